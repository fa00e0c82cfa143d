use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Declares a string-backed enum with `as_str`/`from_db_value` helpers so the
/// same spelling is used on the wire and in the database.
macro_rules! db_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn from_db_value(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

db_enum!(
    /// Lifecycle state of a chat thread.
    ConversationStatus {
        Unassigned => "unassigned",
        Assigned => "assigned",
        Closed => "closed",
    }
);

db_enum!(ConversationSource {
    Embed => "embed",
    Portal => "portal",
});

db_enum!(SenderType {
    Client => "client",
    Agent => "agent",
    System => "system",
});

db_enum!(
    /// Audit trail entry kinds written to `conversation_events`.
    EventType {
        Created => "created",
        Assigned => "assigned",
        Transferred => "transferred",
        Closed => "closed",
        Reopened => "reopened",
        ConvertedToTicket => "converted_to_ticket",
    }
);

db_enum!(TicketPriority {
    Low => "low",
    Medium => "medium",
    High => "high",
    Urgent => "urgent",
});

db_enum!(TicketStatus {
    Open => "open",
    InProgress => "in_progress",
    Resolved => "resolved",
    Closed => "closed",
});

db_enum!(
    /// How new conversations pick an agent. `Manual` disables auto-assign.
    AssignmentMode {
        Manual => "manual",
        LeastBusy => "least_busy",
        RoundRobin => "round_robin",
    }
);

impl Default for AssignmentMode {
    fn default() -> Self {
        Self::Manual
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub organization_id: String,
    pub client_account_id: Option<String>,
    pub subject: String,
    pub status: ConversationStatus,
    pub assigned_agent_id: Option<String>,
    pub source: ConversationSource,
    pub source_domain: Option<String>,
    pub embed_token_id: Option<String>,
    pub unread_count: i32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_type: SenderType,
    pub sender_id: Option<String>,
    pub sender_name: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn system(conversation_id: &str, body: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            conversation_id: conversation_id.to_string(),
            sender_type: SenderType::System,
            sender_id: None,
            sender_name: "System".to_string(),
            body: body.into(),
            attachments: Vec::new(),
            is_read: false,
            created_at: at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    pub id: String,
    pub conversation_id: String,
    pub event_type: EventType,
    pub performed_by: Option<String>,
    pub performer_name: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl ConversationEvent {
    pub fn new(
        conversation_id: &str,
        event_type: EventType,
        performer: Option<&StaffMember>,
        data: Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            conversation_id: conversation_id.to_string(),
            event_type,
            performed_by: performer.map(|staff| staff.id.clone()),
            performer_name: performer.map(|staff| staff.full_name.clone()),
            data,
            created_at: at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportTicket {
    pub id: String,
    pub ticket_number: String,
    pub subject: String,
    pub description: String,
    pub category: String,
    pub priority: TicketPriority,
    pub status: TicketStatus,
    pub assigned_to_staff: Option<String>,
    pub organization_id: Option<String>,
    pub conversation_id: Option<String>,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedToken {
    pub id: String,
    pub organization_id: String,
    #[serde(skip_serializing)]
    pub token: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    pub is_active: bool,
    #[serde(default)]
    pub usage_count: i64,
    #[serde(default)]
    pub welcome_message: Option<String>,
    #[serde(default)]
    pub offline_message: Option<String>,
    #[serde(default)]
    pub primary_color: Option<String>,
    #[serde(default)]
    pub accent_color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffMember {
    pub id: String,
    pub user_id: String,
    pub full_name: String,
    pub email: String,
    pub is_active: bool,
    pub is_available: bool,
    pub max_concurrent_chats: i32,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientAccount {
    pub id: String,
    pub user_id: String,
    pub organization_id: String,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    #[serde(default)]
    pub assignment_mode: AssignmentMode,
    #[serde(default)]
    pub welcome_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub organization: Option<Organization>,
    pub assigned_agent: Option<AgentSummary>,
}
