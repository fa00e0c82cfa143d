//! The chat endpoint's actions.
//!
//! A request body is parsed into one [`ChatAction`] variant by its `action`
//! field, and [`dispatch`] routes it to the handler for that variant. Every
//! handler performs at most one write through the store, so an action either
//! commits completely or not at all.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::Caller;
use crate::conversation::{
    assignment_event, build_transcript, check_transition, sender_metadata, ticket_number,
    ConversationChange, ConversationDraft, Transition, TRANSCRIPT_LIMIT,
};
use crate::error::ApiError;
use crate::store::{ChatStore, ConversationFilter, Page, PageLimits};
use crate::templates::{
    closed_message, converted_message, reopened_message, render_ticket_description,
    TicketDescriptionContext,
};
use crate::types::{
    new_id, Conversation, ConversationEvent, ConversationSource, ConversationStatus, EventType,
    Message, SenderType, SupportTicket, TicketPriority, TicketStatus,
};

const DEFAULT_SUBJECT: &str = "New conversation";
const DEFAULT_SENDER_NAME: &str = "Visitor";
const DEFAULT_TICKET_CATEGORY: &str = "general";

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChatAction {
    StartConversation(StartConversation),
    SendMessage(SendMessage),
    GetMessages(GetMessages),
    GetConversations(GetConversations),
    GetConversation(ConversationRef),
    GetEvents(ConversationRef),
    MarkRead(ConversationRef),
    Assign(Assign),
    Close(ConversationRef),
    Reopen(ConversationRef),
    ConvertToTicket(ConvertToTicket),
}

impl ChatAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartConversation(_) => "start_conversation",
            Self::SendMessage(_) => "send_message",
            Self::GetMessages(_) => "get_messages",
            Self::GetConversations(_) => "get_conversations",
            Self::GetConversation(_) => "get_conversation",
            Self::GetEvents(_) => "get_events",
            Self::MarkRead(_) => "mark_read",
            Self::Assign(_) => "assign",
            Self::Close(_) => "close",
            Self::Reopen(_) => "reopen",
            Self::ConvertToTicket(_) => "convert_to_ticket",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConversation {
    /// Only read for staff callers; everyone else is scoped by credentials.
    #[serde(alias = "organization_id")]
    pub organization_id: Option<String>,
    pub subject: Option<String>,
    #[serde(alias = "body")]
    pub message: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(alias = "sender_name")]
    pub sender_name: Option<String>,
    #[serde(alias = "sender_email")]
    pub sender_email: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(alias = "conversation_id")]
    pub conversation_id: Option<String>,
    #[serde(alias = "body")]
    pub message: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(alias = "sender_name")]
    pub sender_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessages {
    #[serde(alias = "conversation_id")]
    pub conversation_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConversations {
    pub status: Option<ConversationStatus>,
    /// Staff-only narrowing; ignored for organization-scoped callers.
    #[serde(alias = "organization_id")]
    pub organization_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    #[serde(alias = "conversation_id")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assign {
    #[serde(alias = "conversation_id")]
    pub conversation_id: Option<String>,
    /// Defaults to the calling staff member.
    #[serde(alias = "agent_id")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertToTicket {
    #[serde(alias = "conversation_id")]
    pub conversation_id: Option<String>,
    pub subject: Option<String>,
    pub category: Option<String>,
    pub priority: Option<TicketPriority>,
}

/// What a handler runs against: the authenticated caller and the store.
pub struct ActionContext<'a> {
    pub store: &'a dyn ChatStore,
    pub caller: &'a Caller,
    pub page_limits: PageLimits,
}

pub async fn dispatch(ctx: &ActionContext<'_>, action: ChatAction) -> Result<Value, ApiError> {
    tracing::debug!(action = action.name(), caller = ctx.caller.kind(), "dispatching chat action");

    match action {
        ChatAction::StartConversation(body) => start_conversation(ctx, body).await,
        ChatAction::SendMessage(body) => send_message(ctx, body).await,
        ChatAction::GetMessages(body) => get_messages(ctx, body).await,
        ChatAction::GetConversations(body) => get_conversations(ctx, body).await,
        ChatAction::GetConversation(body) => get_conversation(ctx, body).await,
        ChatAction::GetEvents(body) => get_events(ctx, body).await,
        ChatAction::MarkRead(body) => mark_read(ctx, body).await,
        ChatAction::Assign(body) => assign(ctx, body).await,
        ChatAction::Close(body) => close(ctx, body).await,
        ChatAction::Reopen(body) => reopen(ctx, body).await,
        ChatAction::ConvertToTicket(body) => convert_to_ticket(ctx, body).await,
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Fetches a conversation the caller is allowed to see.
async fn accessible_conversation(
    ctx: &ActionContext<'_>,
    conversation_id: Option<&str>,
) -> Result<Conversation, ApiError> {
    let conversation_id = non_blank(conversation_id)
        .ok_or_else(|| ApiError::bad_request("conversationId is required"))?;
    let conversation = ctx
        .store
        .conversation(conversation_id)
        .await?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;
    ctx.caller.ensure_access(&conversation)?;
    Ok(conversation)
}

struct Sender {
    sender_type: SenderType,
    sender_id: Option<String>,
    name: String,
}

fn sender_for(caller: &Caller, provided_name: Option<&str>) -> Sender {
    match caller {
        Caller::Staff(staff) => Sender {
            sender_type: SenderType::Agent,
            sender_id: Some(staff.id.clone()),
            name: staff.full_name.clone(),
        },
        Caller::Client(client) => Sender {
            sender_type: SenderType::Client,
            sender_id: Some(client.id.clone()),
            name: non_blank(provided_name)
                .or_else(|| non_blank(Some(client.full_name.as_str())))
                .unwrap_or(DEFAULT_SENDER_NAME)
                .to_string(),
        },
        Caller::Embed(_) => Sender {
            sender_type: SenderType::Client,
            sender_id: None,
            name: non_blank(provided_name)
                .unwrap_or(DEFAULT_SENDER_NAME)
                .to_string(),
        },
    }
}

fn new_message(
    conversation_id: &str,
    sender: &Sender,
    body: &str,
    attachments: Vec<String>,
    at: chrono::DateTime<Utc>,
) -> Message {
    Message {
        id: new_id(),
        conversation_id: conversation_id.to_string(),
        sender_type: sender.sender_type,
        sender_id: sender.sender_id.clone(),
        sender_name: sender.name.clone(),
        body: body.to_string(),
        attachments,
        is_read: false,
        created_at: at,
    }
}

fn clean_attachments(attachments: Vec<String>) -> Vec<String> {
    attachments
        .into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect()
}

async fn start_conversation(
    ctx: &ActionContext<'_>,
    body: StartConversation,
) -> Result<Value, ApiError> {
    let organization_id = match ctx.caller {
        Caller::Embed(embed) => embed.organization_id.clone(),
        Caller::Client(client) => client.organization_id.clone(),
        Caller::Staff(_) => {
            let requested = non_blank(body.organization_id.as_deref())
                .ok_or_else(|| ApiError::bad_request("organizationId is required"))?;
            ctx.store
                .organization(requested)
                .await?
                .ok_or_else(|| ApiError::not_found("organization not found"))?
                .id
        }
    };

    let now = Utc::now();
    let sender = sender_for(ctx.caller, body.sender_name.as_deref());
    let sender_email = non_blank(body.sender_email.as_deref()).or(match ctx.caller {
        Caller::Client(client) => non_blank(Some(client.email.as_str())),
        _ => None,
    });
    let settings = ctx.store.chat_settings().await?;

    let (source, source_domain, embed_token_id, welcome) = match ctx.caller {
        Caller::Embed(embed) => (
            ConversationSource::Embed,
            embed.origin_host.clone(),
            Some(embed.token_id.clone()),
            embed.welcome_message.clone(),
        ),
        _ => (ConversationSource::Portal, None, None, None),
    };
    let welcome = welcome.or_else(|| {
        settings
            .welcome_message
            .clone()
            .filter(|message| !message.trim().is_empty())
    });

    let conversation = Conversation {
        id: new_id(),
        organization_id,
        client_account_id: match ctx.caller {
            Caller::Client(client) => Some(client.id.clone()),
            _ => None,
        },
        subject: non_blank(body.subject.as_deref())
            .unwrap_or(DEFAULT_SUBJECT)
            .to_string(),
        status: ConversationStatus::Unassigned,
        assigned_agent_id: None,
        source,
        source_domain,
        embed_token_id,
        unread_count: 0,
        last_message_at: None,
        closed_at: None,
        metadata: sender_metadata(Some(sender.name.as_str()), sender_email),
        created_at: now,
        updated_at: now,
    };

    let mut created = ConversationEvent::new(
        &conversation.id,
        EventType::Created,
        ctx.caller.staff(),
        json!({ "source": source, "subject": conversation.subject }),
        now,
    );
    if created.performer_name.is_none() {
        created.performer_name = Some(sender.name.clone());
    }

    let mut draft = ConversationDraft::new(conversation, created);
    if let Some(welcome) = welcome {
        draft.push_message(Message::system(&draft.conversation.id, welcome, now));
    }
    let attachments = clean_attachments(body.attachments);
    let first_message = non_blank(body.message.as_deref()).unwrap_or("");
    if !first_message.is_empty() || !attachments.is_empty() {
        let message = new_message(
            &draft.conversation.id,
            &sender,
            first_message,
            attachments,
            now,
        );
        draft.push_message(message);
    }

    let conversation = ctx
        .store
        .create_conversation(draft, settings.assignment_mode)
        .await?;

    tracing::info!(
        conversation_id = %conversation.id,
        organization_id = %conversation.organization_id,
        status = %conversation.status,
        agent_id = conversation.assigned_agent_id.as_deref().unwrap_or("-"),
        "conversation started"
    );
    Ok(json!({ "conversation": conversation }))
}

async fn send_message(ctx: &ActionContext<'_>, body: SendMessage) -> Result<Value, ApiError> {
    let text = non_blank(body.message.as_deref()).unwrap_or("").to_string();
    let attachments = clean_attachments(body.attachments);
    if text.is_empty() && attachments.is_empty() {
        return Err(ApiError::bad_request("message or attachments required"));
    }

    let conversation = accessible_conversation(ctx, body.conversation_id.as_deref()).await?;
    let sender = sender_for(ctx.caller, body.sender_name.as_deref());
    let message = new_message(&conversation.id, &sender, &text, attachments, Utc::now());

    let staff_id = ctx.caller.staff().map(|staff| staff.id.as_str());
    let message = ctx.store.append_message(message, staff_id).await?;

    tracing::debug!(
        conversation_id = %conversation.id,
        sender_type = %message.sender_type,
        "message appended"
    );
    Ok(json!({ "message": message }))
}

async fn get_messages(ctx: &ActionContext<'_>, body: GetMessages) -> Result<Value, ApiError> {
    let page = ctx
        .page_limits
        .resolve(body.limit, body.offset)
        .map_err(ApiError::bad_request)?;
    let conversation = accessible_conversation(ctx, body.conversation_id.as_deref()).await?;
    let messages = ctx.store.messages(&conversation.id, page).await?;
    Ok(json!({ "messages": messages }))
}

async fn get_conversations(
    ctx: &ActionContext<'_>,
    body: GetConversations,
) -> Result<Value, ApiError> {
    let page = ctx
        .page_limits
        .resolve(body.limit, body.offset)
        .map_err(ApiError::bad_request)?;
    let organization_id = match ctx.caller.organization_id() {
        Some(scope) => Some(scope.to_string()),
        None => non_blank(body.organization_id.as_deref()).map(str::to_string),
    };

    let conversations = ctx
        .store
        .list_conversations(&ConversationFilter {
            organization_id,
            status: body.status,
            page,
        })
        .await?;
    Ok(json!({ "conversations": conversations }))
}

async fn get_conversation(ctx: &ActionContext<'_>, body: ConversationRef) -> Result<Value, ApiError> {
    let conversation = accessible_conversation(ctx, body.conversation_id.as_deref()).await?;
    Ok(json!({ "conversation": conversation }))
}

async fn get_events(ctx: &ActionContext<'_>, body: ConversationRef) -> Result<Value, ApiError> {
    let conversation = accessible_conversation(ctx, body.conversation_id.as_deref()).await?;
    let events = ctx.store.events(&conversation.id).await?;
    Ok(json!({ "events": events }))
}

async fn mark_read(ctx: &ActionContext<'_>, body: ConversationRef) -> Result<Value, ApiError> {
    let conversation = accessible_conversation(ctx, body.conversation_id.as_deref()).await?;
    let updated = ctx.store.mark_read(&conversation.id).await?;
    Ok(json!({ "updated": updated }))
}

async fn assign(ctx: &ActionContext<'_>, body: Assign) -> Result<Value, ApiError> {
    let staff = ctx.caller.require_staff()?;
    let conversation = accessible_conversation(ctx, body.conversation_id.as_deref()).await?;
    let status = check_transition(conversation.status, Transition::Assign)?;

    // Manual assignment ignores availability and capacity; only auto-assign
    // enforces them.
    let agent_id = non_blank(body.agent_id.as_deref()).unwrap_or(staff.id.as_str());
    let agent = ctx
        .store
        .staff_member(agent_id)
        .await?
        .filter(|agent| agent.is_active)
        .ok_or_else(|| ApiError::not_found("agent not found"))?;

    let now = Utc::now();
    let previous_agent = conversation.assigned_agent_id.clone();
    let event_type = assignment_event(previous_agent.as_deref(), &agent.id);

    let mut change = ConversationChange::unchanged(&conversation, now);
    change.status = status;
    change.assigned_agent_id = Some(agent.id.clone());
    change.assigned_staff = Some(agent.id.clone());
    change.events.push(ConversationEvent::new(
        &conversation.id,
        event_type,
        Some(staff),
        json!({
            "agentId": agent.id,
            "agentName": agent.full_name,
            "previousAgentId": previous_agent,
        }),
        now,
    ));

    let conversation = ctx.store.apply_change(change).await?.conversation;
    tracing::info!(
        conversation_id = %conversation.id,
        agent_id = %agent.id,
        event = %event_type,
        "conversation assigned"
    );
    Ok(json!({ "conversation": conversation }))
}

async fn close(ctx: &ActionContext<'_>, body: ConversationRef) -> Result<Value, ApiError> {
    let staff = ctx.caller.require_staff()?;
    let conversation = accessible_conversation(ctx, body.conversation_id.as_deref()).await?;
    let status = check_transition(conversation.status, Transition::Close)?;

    let now = Utc::now();
    let mut change = ConversationChange::unchanged(&conversation, now);
    change.status = status;
    change.closed_at = Some(now);
    change.events.push(ConversationEvent::new(
        &conversation.id,
        EventType::Closed,
        Some(staff),
        json!({ "previousStatus": conversation.status, "agentId": conversation.assigned_agent_id }),
        now,
    ));
    change.messages.push(Message::system(
        &conversation.id,
        closed_message(&staff.full_name),
        now,
    ));

    let conversation = ctx.store.apply_change(change).await?.conversation;
    tracing::info!(conversation_id = %conversation.id, staff_id = %staff.id, "conversation closed");
    Ok(json!({ "conversation": conversation }))
}

async fn reopen(ctx: &ActionContext<'_>, body: ConversationRef) -> Result<Value, ApiError> {
    let staff = ctx.caller.require_staff()?;
    let conversation = accessible_conversation(ctx, body.conversation_id.as_deref()).await?;
    let status = check_transition(conversation.status, Transition::Reopen)?;

    let now = Utc::now();
    let mut change = ConversationChange::unchanged(&conversation, now);
    change.status = status;
    change.closed_at = None;
    if change.assigned_agent_id.is_none() {
        change.assigned_agent_id = Some(staff.id.clone());
        change.assigned_staff = Some(staff.id.clone());
    }
    change.events.push(ConversationEvent::new(
        &conversation.id,
        EventType::Reopened,
        Some(staff),
        json!({ "agentId": change.assigned_agent_id }),
        now,
    ));
    change.messages.push(Message::system(
        &conversation.id,
        reopened_message(&staff.full_name),
        now,
    ));

    let conversation = ctx.store.apply_change(change).await?.conversation;
    tracing::info!(conversation_id = %conversation.id, staff_id = %staff.id, "conversation reopened");
    Ok(json!({ "conversation": conversation }))
}

fn requester(conversation: &Conversation) -> String {
    let name = conversation.metadata["senderName"].as_str().unwrap_or("").trim();
    let email = conversation.metadata["senderEmail"].as_str().unwrap_or("").trim();
    match (name.is_empty(), email.is_empty()) {
        (false, false) => format!("{name} <{email}>"),
        (false, true) => name.to_string(),
        (true, false) => email.to_string(),
        (true, true) => String::new(),
    }
}

async fn convert_to_ticket(
    ctx: &ActionContext<'_>,
    body: ConvertToTicket,
) -> Result<Value, ApiError> {
    let staff = ctx.caller.require_staff()?;
    let conversation = accessible_conversation(ctx, body.conversation_id.as_deref()).await?;

    let messages = ctx
        .store
        .messages(&conversation.id, Page::first(TRANSCRIPT_LIMIT as i64))
        .await?;
    let transcript = build_transcript(&messages);
    let subject = non_blank(body.subject.as_deref())
        .unwrap_or(conversation.subject.as_str())
        .to_string();
    let description = render_ticket_description(&TicketDescriptionContext {
        subject: &subject,
        requester: &requester(&conversation),
        source_domain: conversation.source_domain.as_deref().unwrap_or(""),
        transcript: &transcript,
        message_count: messages.len().min(TRANSCRIPT_LIMIT),
    });

    let now = Utc::now();
    let ticket = SupportTicket {
        id: new_id(),
        ticket_number: ticket_number(now),
        subject,
        description,
        category: non_blank(body.category.as_deref())
            .unwrap_or(DEFAULT_TICKET_CATEGORY)
            .to_string(),
        priority: body.priority.unwrap_or(TicketPriority::Medium),
        status: TicketStatus::Open,
        assigned_to_staff: Some(staff.id.clone()),
        organization_id: Some(conversation.organization_id.clone()),
        conversation_id: Some(conversation.id.clone()),
        source: "chat".to_string(),
        created_at: now,
        updated_at: now,
    };

    let mut change = ConversationChange::unchanged(&conversation, now);
    change.events.push(ConversationEvent::new(
        &conversation.id,
        EventType::ConvertedToTicket,
        Some(staff),
        json!({ "ticketId": ticket.id, "ticketNumber": ticket.ticket_number }),
        now,
    ));
    change.messages.push(Message::system(
        &conversation.id,
        converted_message(&ticket.ticket_number),
        now,
    ));
    change.ticket = Some(ticket);
    let applied = ctx.store.apply_change(change).await?;
    let ticket = applied
        .ticket
        .ok_or_else(|| ApiError::Internal("ticket was not stored".to_string()))?;

    tracing::info!(
        conversation_id = %conversation.id,
        ticket_number = %ticket.ticket_number,
        "conversation converted to ticket"
    );
    Ok(json!({ "ticket": ticket }))
}
