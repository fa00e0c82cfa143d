use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, Connection, PgConnection, PgPool, Row};

use super::{AppliedChange, ChatStore, ConversationFilter, Page};
use crate::conversation::{ticket_number, ConversationChange, ConversationDraft};
use crate::error::StoreError;
use crate::types::{
    AgentSummary, AssignmentMode, ChatSettings, ClientAccount, Conversation, ConversationEvent,
    ConversationSource, ConversationStatus, ConversationSummary, EmbedToken, EventType, Message,
    Organization, SenderType, StaffMember, SupportTicket,
};

const CONVERSATION_COLUMNS: &str = "c.id, c.organization_id, c.client_account_id, c.subject, c.status, \
     c.assigned_agent_id, c.source, c.source_domain, c.embed_token_id, c.unread_count, \
     c.last_message_at, c.closed_at, c.metadata, c.created_at, c.updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_type, sender_id, sender_name, body, \
     attachments, is_read, created_at";

/// Attempts at inserting a ticket before a number clash is reported.
const TICKET_NUMBER_ATTEMPTS: usize = 5;

const STAFF_COLUMNS: &str = "s.id, s.user_id, s.full_name, s.email, s.is_active, s.is_available, \
     s.max_concurrent_chats, s.last_activity_at, s.last_assigned_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn parse_enum<T>(
    row: &PgRow,
    column: &'static str,
    parse: fn(&str) -> Option<T>,
) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    parse(&raw).ok_or(StoreError::InvalidValue { column, value: raw })
}

fn parse_conversation_row(row: &PgRow) -> Result<Conversation, StoreError> {
    Ok(Conversation {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        client_account_id: row.try_get("client_account_id")?,
        subject: row.try_get("subject")?,
        status: parse_enum(row, "status", ConversationStatus::from_db_value)?,
        assigned_agent_id: row.try_get("assigned_agent_id")?,
        source: parse_enum(row, "source", ConversationSource::from_db_value)?,
        source_domain: row.try_get("source_domain")?,
        embed_token_id: row.try_get("embed_token_id")?,
        unread_count: row.try_get("unread_count")?,
        last_message_at: row.try_get("last_message_at")?,
        closed_at: row.try_get("closed_at")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_message_row(row: &PgRow) -> Result<Message, StoreError> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_type: parse_enum(row, "sender_type", SenderType::from_db_value)?,
        sender_id: row.try_get("sender_id")?,
        sender_name: row.try_get("sender_name")?,
        body: row.try_get("body")?,
        attachments: row.try_get("attachments")?,
        is_read: row.try_get("is_read")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_event_row(row: &PgRow) -> Result<ConversationEvent, StoreError> {
    Ok(ConversationEvent {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        event_type: parse_enum(row, "event_type", EventType::from_db_value)?,
        performed_by: row.try_get("performed_by")?,
        performer_name: row.try_get("performer_name")?,
        data: row.try_get("data")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_staff_row(row: &PgRow) -> Result<StaffMember, StoreError> {
    Ok(StaffMember {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        is_active: row.try_get("is_active")?,
        is_available: row.try_get("is_available")?,
        max_concurrent_chats: row.try_get("max_concurrent_chats")?,
        last_activity_at: row.try_get("last_activity_at")?,
        last_assigned_at: row.try_get("last_assigned_at")?,
    })
}

/// Picks and row-locks the next agent. Load is derived from assigned
/// conversations rather than a stored counter.
async fn select_available_agent(
    conn: &mut PgConnection,
    mode: AssignmentMode,
) -> Result<Option<StaffMember>, StoreError> {
    let order = match mode {
        AssignmentMode::Manual => return Ok(None),
        AssignmentMode::LeastBusy => "load ASC, s.last_assigned_at ASC NULLS FIRST, s.id ASC",
        AssignmentMode::RoundRobin => "s.last_assigned_at ASC NULLS FIRST, s.id ASC",
    };
    let sql = format!(
        "WITH loads AS ( \
             SELECT assigned_agent_id, COUNT(*) AS load FROM conversations \
             WHERE status = 'assigned' AND assigned_agent_id IS NOT NULL \
             GROUP BY assigned_agent_id \
         ) \
         SELECT {STAFF_COLUMNS}, COALESCE(l.load, 0) AS load \
         FROM staff_members s \
         LEFT JOIN loads l ON l.assigned_agent_id = s.id \
         WHERE s.is_active AND s.is_available AND COALESCE(l.load, 0) < s.max_concurrent_chats \
         ORDER BY {order} \
         LIMIT 1 \
         FOR UPDATE OF s SKIP LOCKED"
    );
    let row = sqlx::query(&sql).fetch_optional(&mut *conn).await?;
    row.as_ref().map(parse_staff_row).transpose()
}

async fn stamp_assignment(
    conn: &mut PgConnection,
    staff_id: &str,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE staff_members SET last_assigned_at = $1, last_activity_at = $1 WHERE id = $2",
    )
    .bind(at)
    .bind(staff_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_conversation(
    conn: &mut PgConnection,
    conversation: &Conversation,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO conversations (
            id, organization_id, client_account_id, subject, status, assigned_agent_id, source,
            source_domain, embed_token_id, unread_count, last_message_at, closed_at, metadata,
            created_at, updated_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
        "#,
    )
    .bind(&conversation.id)
    .bind(&conversation.organization_id)
    .bind(&conversation.client_account_id)
    .bind(&conversation.subject)
    .bind(conversation.status.as_str())
    .bind(&conversation.assigned_agent_id)
    .bind(conversation.source.as_str())
    .bind(&conversation.source_domain)
    .bind(&conversation.embed_token_id)
    .bind(conversation.unread_count)
    .bind(conversation.last_message_at)
    .bind(conversation.closed_at)
    .bind(&conversation.metadata)
    .bind(conversation.created_at)
    .bind(conversation.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_event(conn: &mut PgConnection, event: &ConversationEvent) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO conversation_events (id, conversation_id, event_type, performed_by, performer_name, data, created_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7)
        "#,
    )
    .bind(&event.id)
    .bind(&event.conversation_id)
    .bind(event.event_type.as_str())
    .bind(&event.performed_by)
    .bind(&event.performer_name)
    .bind(&event.data)
    .bind(event.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_message(conn: &mut PgConnection, message: &Message) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO conversation_messages (id, conversation_id, sender_type, sender_id, sender_name, body, attachments, is_read, created_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
        "#,
    )
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(message.sender_type.as_str())
    .bind(&message.sender_id)
    .bind(&message.sender_name)
    .bind(&message.body)
    .bind(&message.attachments)
    .bind(message.is_read)
    .bind(message.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Inserts a message into an existing conversation and bumps its activity.
async fn append_message_row(conn: &mut PgConnection, message: &Message) -> Result<(), StoreError> {
    insert_message(conn, message).await?;
    let unread_increment = i32::from(message.sender_type == SenderType::Client);
    sqlx::query(
        "UPDATE conversations \
         SET last_message_at = GREATEST(COALESCE(last_message_at, $1), $1), \
             updated_at = $1, \
             unread_count = unread_count + $2 \
         WHERE id = $3",
    )
    .bind(message.created_at)
    .bind(unread_increment)
    .bind(&message.conversation_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_ticket(conn: &mut PgConnection, ticket: &SupportTicket) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO support_tickets (
            id, ticket_number, subject, description, category, priority, status,
            assigned_to_staff, organization_id, conversation_id, source, created_at, updated_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
        "#,
    )
    .bind(&ticket.id)
    .bind(&ticket.ticket_number)
    .bind(&ticket.subject)
    .bind(&ticket.description)
    .bind(&ticket.category)
    .bind(ticket.priority.as_str())
    .bind(ticket.status.as_str())
    .bind(&ticket.assigned_to_staff)
    .bind(&ticket.organization_id)
    .bind(&ticket.conversation_id)
    .bind(&ticket.source)
    .bind(ticket.created_at)
    .bind(ticket.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn is_ticket_number_clash(err: &StoreError) -> bool {
    match err {
        StoreError::Database(sqlx::Error::Database(db)) => {
            db.is_unique_violation()
                && db.constraint() == Some("support_tickets_ticket_number_key")
        }
        _ => false,
    }
}

/// Inserts the change's ticket inside a savepoint so a clash on
/// `ticket_number` only rolls back that insert, then retries with a fresh
/// number.
async fn insert_change_ticket(
    conn: &mut PgConnection,
    change: &mut ConversationChange,
) -> Result<(), StoreError> {
    let mut attempt = 1;
    loop {
        let Some(ticket) = change.ticket.clone() else {
            return Ok(());
        };
        let mut savepoint = Connection::begin(&mut *conn).await?;
        match insert_ticket(&mut *savepoint, &ticket).await {
            Ok(()) => {
                savepoint.commit().await?;
                return Ok(());
            }
            Err(err) if is_ticket_number_clash(&err) && attempt < TICKET_NUMBER_ATTEMPTS => {
                savepoint.rollback().await?;
                tracing::debug!(
                    ticket_number = %ticket.ticket_number,
                    attempt,
                    "ticket number taken, renumbering"
                );
                change.renumber_ticket(ticket_number(change.at));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[async_trait]
impl ChatStore for PgStore {
    async fn embed_token_by_value(&self, token: &str) -> Result<Option<EmbedToken>, StoreError> {
        let row = sqlx::query(
            "SELECT id, organization_id, token, allowed_domains, is_active, usage_count, \
                    welcome_message, offline_message, primary_color, accent_color \
             FROM embed_tokens WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(EmbedToken {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            token: row.try_get("token")?,
            allowed_domains: row.try_get("allowed_domains")?,
            is_active: row.try_get("is_active")?,
            usage_count: row.try_get("usage_count")?,
            welcome_message: row.try_get("welcome_message")?,
            offline_message: row.try_get("offline_message")?,
            primary_color: row.try_get("primary_color")?,
            accent_color: row.try_get("accent_color")?,
        }))
    }

    async fn record_embed_token_use(&self, token_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE embed_tokens SET usage_count = usage_count + 1 WHERE id = $1")
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn user_for_session(&self, token_hash: &str) -> Result<Option<String>, StoreError> {
        let user_id = sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM auth_sessions \
             WHERE token_hash = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user_id)
    }

    async fn active_staff_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<StaffMember>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STAFF_COLUMNS} FROM staff_members s WHERE s.user_id = $1 AND s.is_active LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_staff_row).transpose()
    }

    async fn client_account_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<ClientAccount>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, organization_id, full_name, email \
             FROM client_accounts WHERE user_id = $1 LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ClientAccount {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            organization_id: row.try_get("organization_id")?,
            full_name: row.try_get("full_name")?,
            email: row.try_get("email")?,
        }))
    }

    async fn staff_member(&self, staff_id: &str) -> Result<Option<StaffMember>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STAFF_COLUMNS} FROM staff_members s WHERE s.id = $1"
        ))
        .bind(staff_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_staff_row).transpose()
    }

    async fn organization(&self, organization_id: &str) -> Result<Option<Organization>, StoreError> {
        let row = sqlx::query("SELECT id, name FROM organizations WHERE id = $1")
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Organization {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        }))
    }

    async fn chat_settings(&self) -> Result<ChatSettings, StoreError> {
        let row = sqlx::query("SELECT assignment_mode, welcome_message FROM chat_settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(ChatSettings::default());
        };
        Ok(ChatSettings {
            assignment_mode: parse_enum(&row, "assignment_mode", AssignmentMode::from_db_value)?,
            welcome_message: row.try_get("welcome_message")?,
        })
    }

    async fn create_conversation(
        &self,
        mut draft: ConversationDraft,
        mode: AssignmentMode,
    ) -> Result<Conversation, StoreError> {
        let mut tx = self.pool.begin().await?;
        let at = draft.conversation.created_at;

        if let Some(agent) = select_available_agent(&mut *tx, mode).await? {
            draft.assign_to(&agent, at);
            stamp_assignment(&mut *tx, &agent.id, at).await?;
        }

        insert_conversation(&mut *tx, &draft.conversation).await?;
        for event in &draft.events {
            insert_event(&mut *tx, event).await?;
        }
        for message in &draft.messages {
            insert_message(&mut *tx, message).await?;
        }

        tx.commit().await?;
        Ok(draft.conversation)
    }

    async fn conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = $1"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_conversation_row).transpose()
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS}, \
                    o.name AS organization_name, \
                    s.full_name AS agent_full_name, s.email AS agent_email \
             FROM conversations c \
             LEFT JOIN organizations o ON o.id = c.organization_id \
             LEFT JOIN staff_members s ON s.id = c.assigned_agent_id \
             WHERE ($1::text IS NULL OR c.organization_id = $1) \
               AND ($2::text IS NULL OR c.status = $2) \
             ORDER BY c.last_message_at DESC NULLS LAST, c.created_at DESC \
             LIMIT $3 OFFSET $4"
        ))
        .bind(&filter.organization_id)
        .bind(filter.status.map(ConversationStatus::as_str))
        .bind(filter.page.limit)
        .bind(filter.page.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ConversationSummary, StoreError> {
                let conversation = parse_conversation_row(row)?;
                let organization = row
                    .try_get::<Option<String>, _>("organization_name")?
                    .map(|name| Organization {
                        id: conversation.organization_id.clone(),
                        name,
                    });
                let assigned_agent = match (
                    conversation.assigned_agent_id.clone(),
                    row.try_get::<Option<String>, _>("agent_full_name")?,
                ) {
                    (Some(id), Some(full_name)) => Some(AgentSummary {
                        id,
                        full_name,
                        email: row
                            .try_get::<Option<String>, _>("agent_email")?
                            .unwrap_or_default(),
                    }),
                    _ => None,
                };
                Ok(ConversationSummary {
                    conversation,
                    organization,
                    assigned_agent,
                })
            })
            .collect()
    }

    async fn append_message(
        &self,
        message: Message,
        staff_id: Option<&str>,
    ) -> Result<Message, StoreError> {
        let mut tx = self.pool.begin().await?;
        append_message_row(&mut *tx, &message).await?;
        if let Some(staff_id) = staff_id {
            sqlx::query("UPDATE staff_members SET last_activity_at = $1 WHERE id = $2")
                .bind(message.created_at)
                .bind(staff_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(message)
    }

    async fn messages(
        &self,
        conversation_id: &str,
        page: Page,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM conversation_messages \
             WHERE conversation_id = $1 \
             ORDER BY created_at ASC, seq ASC \
             LIMIT $2 OFFSET $3"
        ))
        .bind(conversation_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_message_row).collect()
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE conversation_messages SET is_read = true \
             WHERE conversation_id = $1 AND is_read = false",
        )
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let found = sqlx::query("UPDATE conversations SET unread_count = 0 WHERE id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if found == 0 {
            return Err(StoreError::NotFound("conversation"));
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn apply_change(
        &self,
        mut change: ConversationChange,
    ) -> Result<AppliedChange, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE conversations \
             SET status = $1, assigned_agent_id = $2, closed_at = $3, updated_at = $4 \
             WHERE id = $5 AND status = $6 AND assigned_agent_id IS NOT DISTINCT FROM $7",
        )
        .bind(change.status.as_str())
        .bind(&change.assigned_agent_id)
        .bind(change.closed_at)
        .bind(change.at)
        .bind(&change.conversation_id)
        .bind(change.expected_status.as_str())
        .bind(&change.expected_agent)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let exists =
                sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM conversations WHERE id = $1")
                    .bind(&change.conversation_id)
                    .fetch_one(&mut *tx)
                    .await?
                    > 0;
            return Err(if exists {
                StoreError::Conflict
            } else {
                StoreError::NotFound("conversation")
            });
        }

        // The ticket goes first so the event and system message quote its
        // final number.
        insert_change_ticket(&mut *tx, &mut change).await?;
        if let Some(staff_id) = change.assigned_staff.as_deref() {
            stamp_assignment(&mut *tx, staff_id, change.at).await?;
        }
        for event in &change.events {
            insert_event(&mut *tx, event).await?;
        }
        for message in &change.messages {
            append_message_row(&mut *tx, message).await?;
        }

        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = $1"
        ))
        .bind(&change.conversation_id)
        .fetch_one(&mut *tx)
        .await?;
        let conversation = parse_conversation_row(&row)?;

        tx.commit().await?;
        Ok(AppliedChange {
            conversation,
            ticket: change.ticket,
        })
    }

    async fn events(&self, conversation_id: &str) -> Result<Vec<ConversationEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, event_type, performed_by, performer_name, data, created_at \
             FROM conversation_events WHERE conversation_id = $1 \
             ORDER BY created_at ASC, seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_event_row).collect()
    }
}

/// These run against a scratch database created per test from `DATABASE_URL`:
/// `cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::{json, Value};

    use crate::types::{new_id, TicketPriority, TicketStatus};

    async fn seed(pool: &PgPool) {
        sqlx::query("INSERT INTO organizations (id, name) VALUES ('acme', 'Acme'), ('globex', 'Globex')")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO staff_members (id, user_id, full_name, email, max_concurrent_chats) \
             VALUES ('a', 'u-a', 'Ana Reis', 'a@support.example.com', 1), \
                    ('b', 'u-b', 'Ben Ode', 'b@support.example.com', 1)",
        )
        .execute(pool)
        .await
        .unwrap();
    }

    fn draft(id: &str, organization_id: &str, at: DateTime<Utc>) -> ConversationDraft {
        let conversation = Conversation {
            id: id.to_string(),
            organization_id: organization_id.to_string(),
            client_account_id: None,
            subject: format!("subject {id}"),
            status: ConversationStatus::Unassigned,
            assigned_agent_id: None,
            source: ConversationSource::Portal,
            source_domain: None,
            embed_token_id: None,
            unread_count: 0,
            last_message_at: None,
            closed_at: None,
            metadata: json!({}),
            created_at: at,
            updated_at: at,
        };
        let created = ConversationEvent::new(id, EventType::Created, None, Value::Null, at);
        ConversationDraft::new(conversation, created)
    }

    async fn create(store: &PgStore, id: &str, at: DateTime<Utc>) -> Conversation {
        store
            .create_conversation(draft(id, "acme", at), AssignmentMode::Manual)
            .await
            .unwrap()
    }

    fn assign(conversation: &Conversation, agent_id: &str, at: DateTime<Utc>) -> ConversationChange {
        let mut change = ConversationChange::unchanged(conversation, at);
        change.status = ConversationStatus::Assigned;
        change.assigned_agent_id = Some(agent_id.to_string());
        change.assigned_staff = Some(agent_id.to_string());
        change.events.push(ConversationEvent::new(
            &conversation.id,
            EventType::Assigned,
            None,
            json!({ "agentId": agent_id }),
            at,
        ));
        change
    }

    fn close(conversation: &Conversation, at: DateTime<Utc>) -> ConversationChange {
        let mut change = ConversationChange::unchanged(conversation, at);
        change.status = ConversationStatus::Closed;
        change.closed_at = Some(at);
        change
            .events
            .push(ConversationEvent::new(&conversation.id, EventType::Closed, None, Value::Null, at));
        change
            .messages
            .push(Message::system(&conversation.id, "closed", at));
        change
    }

    fn conversion(conversation: &Conversation, number: &str, at: DateTime<Utc>) -> ConversationChange {
        let mut change = ConversationChange::unchanged(conversation, at);
        change.events.push(ConversationEvent::new(
            &conversation.id,
            EventType::ConvertedToTicket,
            None,
            json!({ "ticketNumber": number }),
            at,
        ));
        change.messages.push(Message::system(
            &conversation.id,
            format!("converted to support ticket {number}"),
            at,
        ));
        change.ticket = Some(SupportTicket {
            id: new_id(),
            ticket_number: number.to_string(),
            subject: conversation.subject.clone(),
            description: String::new(),
            category: "general".to_string(),
            priority: TicketPriority::Medium,
            status: TicketStatus::Open,
            assigned_to_staff: None,
            organization_id: Some(conversation.organization_id.clone()),
            conversation_id: Some(conversation.id.clone()),
            source: "chat".to_string(),
            created_at: at,
            updated_at: at,
        });
        change
    }

    fn filter(
        organization_id: Option<&str>,
        status: Option<ConversationStatus>,
        page: Page,
    ) -> ConversationFilter {
        ConversationFilter {
            organization_id: organization_id.map(str::to_string),
            status,
            page,
        }
    }

    fn ids(summaries: &[ConversationSummary]) -> Vec<&str> {
        summaries
            .iter()
            .map(|summary| summary.conversation.id.as_str())
            .collect()
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres server at DATABASE_URL"]
    async fn auto_assign_skips_agents_at_capacity(pool: PgPool) {
        seed(&pool).await;
        let store = PgStore { pool };
        let at = Utc::now();

        let mut agents = Vec::new();
        for id in ["c1", "c2", "c3"] {
            let conversation = store
                .create_conversation(draft(id, "acme", at), AssignmentMode::LeastBusy)
                .await
                .unwrap();
            agents.push(conversation.assigned_agent_id);
        }
        assert_eq!(agents, vec![Some("a".to_string()), Some("b".to_string()), None]);

        let third = store.conversation("c3").await.unwrap().unwrap();
        assert_eq!(third.status, ConversationStatus::Unassigned);
        let stamped = store.staff_member("a").await.unwrap().unwrap();
        assert!(stamped.last_assigned_at.is_some());

        let first = store.conversation("c1").await.unwrap().unwrap();
        store.apply_change(close(&first, Utc::now())).await.unwrap();
        let freed = store
            .create_conversation(draft("c4", "acme", Utc::now()), AssignmentMode::LeastBusy)
            .await
            .unwrap();
        assert_eq!(freed.assigned_agent_id.as_deref(), Some("a"));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres server at DATABASE_URL"]
    async fn stale_changes_conflict_and_write_nothing(pool: PgPool) {
        seed(&pool).await;
        let store = PgStore { pool };
        let snapshot = create(&store, "c1", Utc::now()).await;

        store.apply_change(assign(&snapshot, "a", Utc::now())).await.unwrap();

        let stale_assign = store.apply_change(assign(&snapshot, "b", Utc::now())).await;
        assert!(matches!(stale_assign, Err(StoreError::Conflict)));
        let stale_close = store.apply_change(close(&snapshot, Utc::now())).await;
        assert!(matches!(stale_close, Err(StoreError::Conflict)));

        let mut missing = snapshot.clone();
        missing.id = "nope".to_string();
        let result = store.apply_change(close(&missing, Utc::now())).await;
        assert!(matches!(result, Err(StoreError::NotFound("conversation"))));

        let current = store.conversation("c1").await.unwrap().unwrap();
        assert_eq!(current.assigned_agent_id.as_deref(), Some("a"));
        assert_eq!(store.events("c1").await.unwrap().len(), 2);
        assert!(store.messages("c1", Page::first(10)).await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres server at DATABASE_URL"]
    async fn close_then_reopen_keeps_event_order(pool: PgPool) {
        seed(&pool).await;
        let store = PgStore { pool };
        // One timestamp for every row, so ordering falls back to insertion.
        let at = Utc::now();
        let conversation = create(&store, "c1", at).await;

        let assigned = store
            .apply_change(assign(&conversation, "a", at))
            .await
            .unwrap()
            .conversation;
        let closed = store.apply_change(close(&assigned, at)).await.unwrap().conversation;
        assert_eq!(closed.status, ConversationStatus::Closed);
        assert!(closed.closed_at.is_some());
        assert_eq!(closed.assigned_agent_id.as_deref(), Some("a"));

        let mut reopen = ConversationChange::unchanged(&closed, at);
        reopen.status = ConversationStatus::Assigned;
        reopen.closed_at = None;
        reopen
            .events
            .push(ConversationEvent::new("c1", EventType::Reopened, None, Value::Null, at));
        reopen.messages.push(Message::system("c1", "reopened", at));
        let reopened = store.apply_change(reopen).await.unwrap().conversation;
        assert_eq!(reopened.status, ConversationStatus::Assigned);
        assert_eq!(reopened.closed_at, None);

        let events = store
            .events("c1")
            .await
            .unwrap()
            .into_iter()
            .map(|event| event.event_type)
            .collect::<Vec<_>>();
        assert_eq!(
            events,
            vec![
                EventType::Created,
                EventType::Assigned,
                EventType::Closed,
                EventType::Reopened
            ]
        );
        let bodies = store
            .messages("c1", Page::first(10))
            .await
            .unwrap()
            .into_iter()
            .map(|message| message.body)
            .collect::<Vec<_>>();
        assert_eq!(bodies, vec!["closed", "reopened"]);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres server at DATABASE_URL"]
    async fn list_puts_recent_first_and_silent_last(pool: PgPool) {
        seed(&pool).await;
        let store = PgStore { pool };
        let t0 = Utc::now() - Duration::hours(1);

        let rows = [
            ("old", "acme", Some(t0), t0),
            ("new", "acme", Some(t0 + Duration::minutes(1)), t0),
            ("silent-early", "acme", None, t0),
            ("silent-late", "acme", None, t0 + Duration::minutes(5)),
            ("other", "globex", Some(t0 + Duration::minutes(2)), t0),
        ];
        for (id, organization_id, last_message_at, created_at) in rows {
            let mut row = draft(id, organization_id, created_at);
            row.conversation.last_message_at = last_message_at;
            store
                .create_conversation(row, AssignmentMode::Manual)
                .await
                .unwrap();
        }

        let all = store
            .list_conversations(&filter(None, None, Page::first(10)))
            .await
            .unwrap();
        assert_eq!(ids(&all), vec!["other", "new", "old", "silent-late", "silent-early"]);
        assert_eq!(all[0].organization.as_ref().unwrap().name, "Globex");

        let acme = store
            .list_conversations(&filter(Some("acme"), None, Page::first(10)))
            .await
            .unwrap();
        assert_eq!(ids(&acme), vec!["new", "old", "silent-late", "silent-early"]);

        let page = store
            .list_conversations(&filter(Some("acme"), None, Page { limit: 2, offset: 1 }))
            .await
            .unwrap();
        assert_eq!(ids(&page), vec!["old", "silent-late"]);

        let old = store.conversation("old").await.unwrap().unwrap();
        store.apply_change(close(&old, Utc::now())).await.unwrap();
        let closed = store
            .list_conversations(&filter(
                Some("acme"),
                Some(ConversationStatus::Closed),
                Page::first(10),
            ))
            .await
            .unwrap();
        assert_eq!(ids(&closed), vec!["old"]);
        let closed_elsewhere = store
            .list_conversations(&filter(
                Some("globex"),
                Some(ConversationStatus::Closed),
                Page::first(10),
            ))
            .await
            .unwrap();
        assert!(closed_elsewhere.is_empty());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres server at DATABASE_URL"]
    async fn taken_ticket_number_is_renumbered(pool: PgPool) {
        seed(&pool).await;
        let store = PgStore { pool: pool.clone() };
        let first = create(&store, "c1", Utc::now()).await;
        let second = create(&store, "c2", Utc::now()).await;

        let applied = store
            .apply_change(conversion(&first, "CHAT-SAME", Utc::now()))
            .await
            .unwrap();
        assert_eq!(applied.ticket.unwrap().ticket_number, "CHAT-SAME");

        let applied = store
            .apply_change(conversion(&second, "CHAT-SAME", Utc::now()))
            .await
            .unwrap();
        let renumbered = applied.ticket.unwrap().ticket_number;
        assert_ne!(renumbered, "CHAT-SAME");

        let stored = sqlx::query_scalar::<_, String>(
            "SELECT ticket_number FROM support_tickets WHERE conversation_id = 'c2'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(stored, renumbered);

        let events = store.events("c2").await.unwrap();
        assert_eq!(events.last().unwrap().data["ticketNumber"], json!(renumbered));
        let messages = store.messages("c2", Page::first(10)).await.unwrap();
        assert!(messages[0].body.ends_with(&renumbered));
    }
}
