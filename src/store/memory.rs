//! In-process store used by the test suite and for running the service
//! without Postgres (`STORE_BACKEND=memory`).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{AppliedChange, ChatStore, ConversationFilter, Page};
use crate::auth::hash_session_token;
use crate::conversation::{pick_agent, ticket_number, ConversationChange, ConversationDraft};
use crate::error::StoreError;
use crate::types::{
    AgentSummary, AssignmentMode, ChatSettings, ClientAccount, Conversation, ConversationEvent,
    ConversationStatus, ConversationSummary, EmbedToken, Message, Organization, SenderType,
    StaffMember, SupportTicket,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedSession {
    pub token: String,
    pub user_id: String,
}

/// Reference data a memory store starts with, loadable from JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemorySeed {
    pub organizations: Vec<Organization>,
    pub staff: Vec<StaffMember>,
    pub clients: Vec<ClientAccount>,
    pub embed_tokens: Vec<EmbedToken>,
    pub sessions: Vec<SeedSession>,
    pub settings: ChatSettings,
}

#[derive(Default)]
struct Tables {
    organizations: HashMap<String, Organization>,
    staff: HashMap<String, StaffMember>,
    clients: HashMap<String, ClientAccount>,
    embed_tokens: HashMap<String, EmbedToken>,
    sessions: HashMap<String, String>,
    settings: ChatSettings,
    conversations: HashMap<String, Conversation>,
    messages: Vec<Message>,
    events: Vec<ConversationEvent>,
    tickets: Vec<SupportTicket>,
}

impl Tables {
    fn staff_loads(&self) -> Vec<(StaffMember, i64)> {
        self.staff
            .values()
            .map(|staff| {
                let load = self
                    .conversations
                    .values()
                    .filter(|c| {
                        c.status == ConversationStatus::Assigned
                            && c.assigned_agent_id.as_deref() == Some(staff.id.as_str())
                    })
                    .count() as i64;
                (staff.clone(), load)
            })
            .collect()
    }

    fn stamp_assignment(&mut self, staff_id: &str, at: chrono::DateTime<Utc>) {
        if let Some(staff) = self.staff.get_mut(staff_id) {
            staff.last_assigned_at = Some(at);
            staff.last_activity_at = Some(at);
        }
    }

    fn push_message(&mut self, message: Message) {
        if let Some(conversation) = self.conversations.get_mut(&message.conversation_id) {
            if message.sender_type == SenderType::Client {
                conversation.unread_count += 1;
            }
            conversation.last_message_at = Some(message.created_at);
            conversation.updated_at = message.created_at;
        }
        self.messages.push(message);
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(seed: MemorySeed) -> Self {
        let mut tables = Tables {
            settings: seed.settings,
            ..Tables::default()
        };
        for org in seed.organizations {
            tables.organizations.insert(org.id.clone(), org);
        }
        for staff in seed.staff {
            tables.staff.insert(staff.id.clone(), staff);
        }
        for client in seed.clients {
            tables.clients.insert(client.id.clone(), client);
        }
        for token in seed.embed_tokens {
            tables.embed_tokens.insert(token.id.clone(), token);
        }
        for session in seed.sessions {
            tables
                .sessions
                .insert(hash_session_token(&session.token), session.user_id);
        }
        Self {
            tables: Mutex::new(tables),
        }
    }

    pub async fn set_chat_settings(&self, settings: ChatSettings) {
        self.tables.lock().await.settings = settings;
    }

    pub async fn embed_token(&self, token_id: &str) -> Option<EmbedToken> {
        self.tables.lock().await.embed_tokens.get(token_id).cloned()
    }

    pub async fn tickets(&self) -> Vec<SupportTicket> {
        self.tables.lock().await.tickets.clone()
    }

    pub async fn staff_load(&self, staff_id: &str) -> i64 {
        let tables = self.tables.lock().await;
        tables
            .staff_loads()
            .into_iter()
            .find(|(staff, _)| staff.id == staff_id)
            .map(|(_, load)| load)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn embed_token_by_value(&self, token: &str) -> Result<Option<EmbedToken>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .embed_tokens
            .values()
            .find(|candidate| candidate.token == token)
            .cloned())
    }

    async fn record_embed_token_use(&self, token_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let token = tables
            .embed_tokens
            .get_mut(token_id)
            .ok_or(StoreError::NotFound("embed token"))?;
        token.usage_count += 1;
        Ok(())
    }

    async fn user_for_session(&self, token_hash: &str) -> Result<Option<String>, StoreError> {
        Ok(self.tables.lock().await.sessions.get(token_hash).cloned())
    }

    async fn active_staff_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<StaffMember>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .staff
            .values()
            .find(|staff| staff.user_id == user_id && staff.is_active)
            .cloned())
    }

    async fn client_account_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<ClientAccount>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .clients
            .values()
            .find(|client| client.user_id == user_id)
            .cloned())
    }

    async fn staff_member(&self, staff_id: &str) -> Result<Option<StaffMember>, StoreError> {
        Ok(self.tables.lock().await.staff.get(staff_id).cloned())
    }

    async fn organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<Organization>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .organizations
            .get(organization_id)
            .cloned())
    }

    async fn chat_settings(&self) -> Result<ChatSettings, StoreError> {
        Ok(self.tables.lock().await.settings.clone())
    }

    async fn create_conversation(
        &self,
        mut draft: ConversationDraft,
        mode: AssignmentMode,
    ) -> Result<Conversation, StoreError> {
        let mut tables = self.tables.lock().await;
        let at = draft.conversation.created_at;

        let loads = tables.staff_loads();
        if let Some(agent) = pick_agent(mode, &loads).cloned() {
            draft.assign_to(&agent, at);
            tables.stamp_assignment(&agent.id, at);
        }

        let conversation = draft.conversation;
        tables
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        tables.events.extend(draft.events);
        tables.messages.extend(draft.messages);
        Ok(conversation)
    }

    async fn conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .conversations
            .get(conversation_id)
            .cloned())
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows = tables
            .conversations
            .values()
            .filter(|c| {
                filter
                    .organization_id
                    .as_deref()
                    .map_or(true, |org| c.organization_id == org)
            })
            .filter(|c| filter.status.map_or(true, |status| c.status == status))
            .cloned()
            .collect::<Vec<_>>();

        // Most recent message first; `None` sorts after every timestamp.
        rows.sort_by(|a, b| match (a.last_message_at, b.last_message_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => b.created_at.cmp(&a.created_at),
        });

        Ok(rows
            .into_iter()
            .skip(filter.page.offset as usize)
            .take(filter.page.limit as usize)
            .map(|conversation| ConversationSummary {
                organization: tables
                    .organizations
                    .get(&conversation.organization_id)
                    .cloned(),
                assigned_agent: conversation
                    .assigned_agent_id
                    .as_ref()
                    .and_then(|id| tables.staff.get(id))
                    .map(|staff| AgentSummary {
                        id: staff.id.clone(),
                        full_name: staff.full_name.clone(),
                        email: staff.email.clone(),
                    }),
                conversation,
            })
            .collect())
    }

    async fn append_message(
        &self,
        message: Message,
        staff_id: Option<&str>,
    ) -> Result<Message, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.conversations.contains_key(&message.conversation_id) {
            return Err(StoreError::NotFound("conversation"));
        }
        if let Some(staff) = staff_id.and_then(|id| tables.staff.get_mut(id)) {
            staff.last_activity_at = Some(message.created_at);
        }
        tables.push_message(message.clone());
        Ok(message)
    }

    async fn messages(
        &self,
        conversation_id: &str,
        page: Page,
    ) -> Result<Vec<Message>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect::<Vec<_>>();
        // Stable sort keeps insertion order for equal timestamps.
        rows.sort_by_key(|m| m.created_at);
        Ok(rows
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let conversation = tables
            .conversations
            .get_mut(conversation_id)
            .ok_or(StoreError::NotFound("conversation"))?;
        conversation.unread_count = 0;

        let mut updated = 0;
        for message in tables
            .messages
            .iter_mut()
            .filter(|m| m.conversation_id == conversation_id && !m.is_read)
        {
            message.is_read = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn apply_change(
        &self,
        mut change: ConversationChange,
    ) -> Result<AppliedChange, StoreError> {
        let mut tables = self.tables.lock().await;
        let conversation = tables
            .conversations
            .get_mut(&change.conversation_id)
            .ok_or(StoreError::NotFound("conversation"))?;
        if conversation.status != change.expected_status
            || conversation.assigned_agent_id != change.expected_agent
        {
            return Err(StoreError::Conflict);
        }
        change.apply_to(conversation);

        while let Some(number) = change.ticket.as_ref().map(|t| t.ticket_number.clone()) {
            if !tables.tickets.iter().any(|t| t.ticket_number == number) {
                break;
            }
            change.renumber_ticket(ticket_number(change.at));
        }

        if let Some(staff_id) = change.assigned_staff.as_deref() {
            tables.stamp_assignment(staff_id, change.at);
        }
        tables.events.extend(change.events);
        for message in change.messages {
            tables.push_message(message);
        }
        if let Some(ticket) = &change.ticket {
            tables.tickets.push(ticket.clone());
        }

        let conversation = tables
            .conversations
            .get(&change.conversation_id)
            .cloned()
            .ok_or(StoreError::NotFound("conversation"))?;
        Ok(AppliedChange {
            conversation,
            ticket: change.ticket,
        })
    }

    async fn events(&self, conversation_id: &str) -> Result<Vec<ConversationEvent>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows = tables
            .events
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|e| e.created_at);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationSource, EventType, TicketPriority, TicketStatus};
    use serde_json::{json, Value};

    async fn open_conversation(store: &MemoryStore, id: &str) -> Conversation {
        let at = Utc::now();
        let conversation = Conversation {
            id: id.to_string(),
            organization_id: "acme".to_string(),
            client_account_id: None,
            subject: "Export".to_string(),
            status: ConversationStatus::Unassigned,
            assigned_agent_id: None,
            source: ConversationSource::Portal,
            source_domain: None,
            embed_token_id: None,
            unread_count: 0,
            last_message_at: None,
            closed_at: None,
            metadata: Value::Null,
            created_at: at,
            updated_at: at,
        };
        let created = ConversationEvent::new(id, EventType::Created, None, Value::Null, at);
        store
            .create_conversation(ConversationDraft::new(conversation, created), AssignmentMode::Manual)
            .await
            .unwrap()
    }

    fn conversion(conversation: &Conversation, number: &str) -> ConversationChange {
        let at = Utc::now();
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
            id: crate::types::new_id(),
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

    #[tokio::test]
    async fn duplicate_ticket_number_is_renumbered() {
        let store = MemoryStore::new();
        let first = open_conversation(&store, "c1").await;
        let second = open_conversation(&store, "c2").await;

        let applied = store.apply_change(conversion(&first, "CHAT-SAME")).await.unwrap();
        assert_eq!(applied.ticket.unwrap().ticket_number, "CHAT-SAME");

        let applied = store.apply_change(conversion(&second, "CHAT-SAME")).await.unwrap();
        let renumbered = applied.ticket.unwrap().ticket_number;
        assert_ne!(renumbered, "CHAT-SAME");
        assert!(renumbered.starts_with("CHAT-"));

        let events = store.events("c2").await.unwrap();
        assert_eq!(events.last().unwrap().data["ticketNumber"], json!(renumbered));
        let messages = store.messages("c2", Page::first(10)).await.unwrap();
        assert!(messages[0].body.ends_with(&renumbered));
        assert_eq!(store.tickets().await.len(), 2);
    }

    #[tokio::test]
    async fn stale_change_conflicts() {
        let store = MemoryStore::new();
        let conversation = open_conversation(&store, "c1").await;

        let mut close = ConversationChange::unchanged(&conversation, Utc::now());
        close.status = ConversationStatus::Closed;
        store.apply_change(close.clone()).await.unwrap();

        assert!(matches!(store.apply_change(close).await, Err(StoreError::Conflict)));
    }
}
