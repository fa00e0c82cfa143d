//! Persistence layer for conversations, messages, events and tickets.
//!
//! Every method that writes is a unit of work: the Postgres backend runs it in
//! one transaction and the in-memory backend under one lock, so an action
//! either lands completely or not at all.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::conversation::{ConversationChange, ConversationDraft};
use crate::error::StoreError;
use crate::types::{
    AssignmentMode, ChatSettings, ClientAccount, Conversation, ConversationEvent,
    ConversationStatus, ConversationSummary, EmbedToken, Message, Organization, StaffMember,
    SupportTicket,
};

pub use memory::{MemorySeed, MemoryStore};
pub use postgres::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub fn first(limit: i64) -> Self {
        Self { limit, offset: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default: i64,
    pub max: i64,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default: 100,
            max: 500,
        }
    }
}

impl PageLimits {
    /// Clamps a requested page to the configured bounds.
    pub fn resolve(&self, limit: Option<i64>, offset: Option<i64>) -> Result<Page, String> {
        let limit = match limit {
            None => self.default,
            Some(value) if value <= 0 => return Err("limit must be positive".to_string()),
            Some(value) => value.min(self.max),
        };
        let offset = match offset {
            None => 0,
            Some(value) if value < 0 => return Err("offset must not be negative".to_string()),
            Some(value) => value,
        };
        Ok(Page { limit, offset })
    }
}

#[derive(Debug, Clone)]
pub struct ConversationFilter {
    /// `None` lists every organization (staff view).
    pub organization_id: Option<String>,
    pub status: Option<ConversationStatus>,
    pub page: Page,
}

/// Result of [`ChatStore::apply_change`]. `ticket` carries the number the
/// ticket was finally stored under, which can differ from the requested one.
#[derive(Debug, Clone)]
pub struct AppliedChange {
    pub conversation: Conversation,
    pub ticket: Option<SupportTicket>,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn embed_token_by_value(&self, token: &str) -> Result<Option<EmbedToken>, StoreError>;

    /// Atomically bumps the token's usage counter.
    async fn record_embed_token_use(&self, token_id: &str) -> Result<(), StoreError>;

    /// Resolves a hashed session token to the user it belongs to.
    async fn user_for_session(&self, token_hash: &str) -> Result<Option<String>, StoreError>;

    async fn active_staff_for_user(&self, user_id: &str)
        -> Result<Option<StaffMember>, StoreError>;

    async fn client_account_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<ClientAccount>, StoreError>;

    async fn staff_member(&self, staff_id: &str) -> Result<Option<StaffMember>, StoreError>;

    async fn organization(&self, organization_id: &str)
        -> Result<Option<Organization>, StoreError>;

    async fn chat_settings(&self) -> Result<ChatSettings, StoreError>;

    /// Inserts a new conversation with its events and messages. When `mode`
    /// is not manual, an agent is picked and assigned in the same unit of work.
    async fn create_conversation(
        &self,
        draft: ConversationDraft,
        mode: AssignmentMode,
    ) -> Result<Conversation, StoreError>;

    async fn conversation(&self, conversation_id: &str)
        -> Result<Option<Conversation>, StoreError>;

    /// Ordered by most recent message first, conversations without messages last.
    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationSummary>, StoreError>;

    /// Appends a message and bumps the conversation's activity. `staff_id`
    /// gets its last-activity timestamp refreshed.
    async fn append_message(
        &self,
        message: Message,
        staff_id: Option<&str>,
    ) -> Result<Message, StoreError>;

    /// Oldest first.
    async fn messages(&self, conversation_id: &str, page: Page)
        -> Result<Vec<Message>, StoreError>;

    /// Marks every unread message read and resets the unread counter.
    /// Returns how many messages changed.
    async fn mark_read(&self, conversation_id: &str) -> Result<u64, StoreError>;

    /// Applies a compare-and-set change. A ticket whose number is already
    /// taken is renumbered instead of failing the change.
    async fn apply_change(&self, change: ConversationChange) -> Result<AppliedChange, StoreError>;

    /// Oldest first.
    async fn events(&self, conversation_id: &str) -> Result<Vec<ConversationEvent>, StoreError>;
}
