//! Conversation lifecycle rules shared by every store backend.
//!
//! Nothing in here touches storage: handlers use these helpers to validate a
//! transition and build the rows an action writes, and the store applies them
//! in one transaction.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::types::{
    AssignmentMode, Conversation, ConversationEvent, ConversationStatus, EventType, Message,
    SenderType, StaffMember, SupportTicket,
};

/// Number of messages copied into a ticket when a chat is converted.
pub const TRANSCRIPT_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Assign,
    Close,
    Reopen,
}

impl Transition {
    fn verb(self) -> &'static str {
        match self {
            Self::Assign => "assign",
            Self::Close => "close",
            Self::Reopen => "reopen",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {} a conversation that is {from}", .transition.verb())]
pub struct TransitionError {
    pub from: ConversationStatus,
    pub transition: Transition,
}

/// Returns the status a conversation ends up in after `transition`.
///
/// Closed conversations must be reopened before they can be reassigned, and
/// only closed conversations can be reopened.
pub fn check_transition(
    from: ConversationStatus,
    transition: Transition,
) -> Result<ConversationStatus, TransitionError> {
    use ConversationStatus::*;

    match (from, transition) {
        (Unassigned | Assigned, Transition::Assign) => Ok(Assigned),
        (Unassigned | Assigned, Transition::Close) => Ok(Closed),
        (Closed, Transition::Reopen) => Ok(Assigned),
        _ => Err(TransitionError { from, transition }),
    }
}

/// `Transferred` only when a different agent previously held the conversation.
pub fn assignment_event(previous_agent: Option<&str>, next_agent: &str) -> EventType {
    match previous_agent {
        Some(previous) if previous != next_agent => EventType::Transferred,
        _ => EventType::Assigned,
    }
}

/// Picks the agent a new conversation goes to. `candidates` pairs each staff
/// member with their current number of assigned conversations.
pub fn pick_agent(
    mode: AssignmentMode,
    candidates: &[(StaffMember, i64)],
) -> Option<&StaffMember> {
    let eligible = candidates.iter().filter(|(staff, load)| {
        staff.is_active && staff.is_available && *load < i64::from(staff.max_concurrent_chats)
    });

    match mode {
        AssignmentMode::Manual => None,
        AssignmentMode::LeastBusy => eligible
            .min_by(|(a, a_load), (b, b_load)| {
                a_load
                    .cmp(b_load)
                    .then_with(|| a.last_assigned_at.cmp(&b.last_assigned_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(staff, _)| staff),
        AssignmentMode::RoundRobin => eligible
            .min_by(|(a, _), (b, _)| {
                a.last_assigned_at
                    .cmp(&b.last_assigned_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(staff, _)| staff),
    }
}

/// Rows written by `start_conversation`, kept together so the store can insert
/// them atomically.
#[derive(Debug, Clone)]
pub struct ConversationDraft {
    pub conversation: Conversation,
    pub events: Vec<ConversationEvent>,
    pub messages: Vec<Message>,
}

impl ConversationDraft {
    pub fn new(conversation: Conversation, created: ConversationEvent) -> Self {
        Self {
            conversation,
            events: vec![created],
            messages: Vec::new(),
        }
    }

    pub fn push_message(&mut self, message: Message) {
        if message.sender_type == SenderType::Client {
            self.conversation.unread_count += 1;
        }
        self.conversation.last_message_at = Some(message.created_at);
        self.messages.push(message);
    }

    /// Hands the draft to `agent` and records the automatic assignment.
    pub fn assign_to(&mut self, agent: &StaffMember, at: DateTime<Utc>) {
        self.conversation.status = ConversationStatus::Assigned;
        self.conversation.assigned_agent_id = Some(agent.id.clone());
        self.events.push(ConversationEvent::new(
            &self.conversation.id,
            EventType::Assigned,
            None,
            json!({
                "agentId": agent.id,
                "agentName": agent.full_name,
                "auto": true,
            }),
            at,
        ));
    }
}

/// A compare-and-set update of one conversation plus the rows that go with it.
///
/// The store only applies it when the row still has `expected_status` and
/// `expected_agent`; otherwise it fails with a conflict.
#[derive(Debug, Clone)]
pub struct ConversationChange {
    pub conversation_id: String,
    pub expected_status: ConversationStatus,
    pub expected_agent: Option<String>,
    pub status: ConversationStatus,
    pub assigned_agent_id: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub events: Vec<ConversationEvent>,
    pub messages: Vec<Message>,
    /// Staff member whose assignment and activity timestamps get stamped.
    pub assigned_staff: Option<String>,
    pub ticket: Option<SupportTicket>,
    pub at: DateTime<Utc>,
}

impl ConversationChange {
    /// Starts a change that leaves status and assignee as they are.
    pub fn unchanged(conversation: &Conversation, at: DateTime<Utc>) -> Self {
        Self {
            conversation_id: conversation.id.clone(),
            expected_status: conversation.status,
            expected_agent: conversation.assigned_agent_id.clone(),
            status: conversation.status,
            assigned_agent_id: conversation.assigned_agent_id.clone(),
            closed_at: conversation.closed_at,
            events: Vec::new(),
            messages: Vec::new(),
            assigned_staff: None,
            ticket: None,
            at,
        }
    }

    /// Gives the attached ticket a new number and rewrites the event data and
    /// system messages that quote the old one.
    pub fn renumber_ticket(&mut self, number: String) {
        let Some(ticket) = self.ticket.as_mut() else {
            return;
        };
        let previous = std::mem::replace(&mut ticket.ticket_number, number.clone());
        for event in &mut self.events {
            if event.data.get("ticketNumber").and_then(Value::as_str) == Some(previous.as_str()) {
                event.data["ticketNumber"] = json!(number);
            }
        }
        for message in &mut self.messages {
            if message.sender_type == SenderType::System && message.body.contains(&previous) {
                message.body = message.body.replace(&previous, &number);
            }
        }
    }

    /// Applies the change to an in-memory copy of the conversation.
    pub fn apply_to(&self, conversation: &mut Conversation) {
        conversation.status = self.status;
        conversation.assigned_agent_id = self.assigned_agent_id.clone();
        conversation.closed_at = self.closed_at;
        conversation.updated_at = self.at;
        if let Some(last) = self.messages.iter().map(|m| m.created_at).max() {
            conversation.last_message_at = Some(last);
        }
    }
}

/// Renders up to the first [`TRANSCRIPT_LIMIT`] messages, oldest first.
pub fn build_transcript(messages: &[Message]) -> String {
    let mut ordered = messages.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|message| message.created_at);

    ordered
        .into_iter()
        .take(TRANSCRIPT_LIMIT)
        .map(|message| {
            let mut line = format!(
                "[{}] {}: {}",
                message.created_at.format("%Y-%m-%d %H:%M"),
                message.sender_name,
                message.body.trim()
            );
            for url in &message.attachments {
                line.push_str(&format!(" (attachment: {url})"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Last millisecond value handed out by [`ticket_number`] in this process.
static LAST_TICKET_MILLIS: AtomicU64 = AtomicU64::new(0);

/// `CHAT-<base36 millisecond timestamp>`. Numbers issued by one process are
/// strictly increasing: a second call within the same millisecond takes the
/// next one.
pub fn ticket_number(at: DateTime<Utc>) -> String {
    let now = u64::try_from(at.timestamp_millis()).unwrap_or(0);
    let previous = LAST_TICKET_MILLIS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last.saturating_add(1)))
        })
        .unwrap_or(now);
    format_ticket_number(now.max(previous.saturating_add(1)))
}

fn format_ticket_number(millis: u64) -> String {
    format!("CHAT-{}", to_base36(millis))
}

pub fn sender_metadata(name: Option<&str>, email: Option<&str>) -> Value {
    let mut metadata = serde_json::Map::new();
    if let Some(name) = name.map(str::trim).filter(|v| !v.is_empty()) {
        metadata.insert("senderName".to_string(), json!(name));
    }
    if let Some(email) = email.map(str::trim).filter(|v| !v.is_empty()) {
        metadata.insert("senderEmail".to_string(), json!(email));
    }
    Value::Object(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{new_id, ConversationSource};
    use chrono::{Duration, TimeZone};

    fn staff(id: &str, max: i32, last_assigned: Option<i64>) -> StaffMember {
        StaffMember {
            id: id.to_string(),
            user_id: format!("user-{id}"),
            full_name: format!("Agent {id}"),
            email: format!("{id}@example.com"),
            is_active: true,
            is_available: true,
            max_concurrent_chats: max,
            last_activity_at: None,
            last_assigned_at: last_assigned.map(|secs| Utc.timestamp_opt(secs, 0).unwrap()),
        }
    }

    fn message(sender: &str, body: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: new_id(),
            conversation_id: "c1".to_string(),
            sender_type: SenderType::Client,
            sender_id: None,
            sender_name: sender.to_string(),
            body: body.to_string(),
            attachments: Vec::new(),
            is_read: false,
            created_at: at,
        }
    }

    #[test]
    fn lifecycle_follows_unassigned_assigned_closed_reopen() {
        use ConversationStatus::*;

        assert_eq!(check_transition(Unassigned, Transition::Assign), Ok(Assigned));
        assert_eq!(check_transition(Assigned, Transition::Assign), Ok(Assigned));
        assert_eq!(check_transition(Assigned, Transition::Close), Ok(Closed));
        assert_eq!(check_transition(Closed, Transition::Reopen), Ok(Assigned));

        assert!(check_transition(Closed, Transition::Assign).is_err());
        assert!(check_transition(Closed, Transition::Close).is_err());
        assert!(check_transition(Assigned, Transition::Reopen).is_err());
        assert!(check_transition(Unassigned, Transition::Reopen).is_err());
    }

    #[test]
    fn transition_error_reads_naturally() {
        let err = check_transition(ConversationStatus::Closed, Transition::Assign).unwrap_err();
        assert_eq!(err.to_string(), "cannot assign a conversation that is closed");
    }

    #[test]
    fn transfer_only_when_agent_changes() {
        assert_eq!(assignment_event(None, "a"), EventType::Assigned);
        assert_eq!(assignment_event(Some("a"), "a"), EventType::Assigned);
        assert_eq!(assignment_event(Some("a"), "b"), EventType::Transferred);
    }

    #[test]
    fn manual_mode_never_picks() {
        let candidates = vec![(staff("a", 5, None), 0)];
        assert!(pick_agent(AssignmentMode::Manual, &candidates).is_none());
    }

    #[test]
    fn least_busy_prefers_lowest_load_then_oldest_assignment() {
        let candidates = vec![
            (staff("a", 5, Some(100)), 2),
            (staff("b", 5, Some(300)), 1),
            (staff("c", 5, Some(200)), 1),
        ];
        let picked = pick_agent(AssignmentMode::LeastBusy, &candidates).unwrap();
        assert_eq!(picked.id, "c");
    }

    #[test]
    fn round_robin_prefers_never_assigned() {
        let candidates = vec![
            (staff("a", 5, Some(100)), 0),
            (staff("b", 5, None), 3),
        ];
        let picked = pick_agent(AssignmentMode::RoundRobin, &candidates).unwrap();
        assert_eq!(picked.id, "b");
    }

    #[test]
    fn agents_at_capacity_or_unavailable_are_skipped() {
        let mut away = staff("b", 5, None);
        away.is_available = false;
        let candidates = vec![(staff("a", 2, None), 2), (away, 0)];
        assert!(pick_agent(AssignmentMode::LeastBusy, &candidates).is_none());
    }

    #[test]
    fn transcript_keeps_first_ten_in_order() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut messages = (0..12)
            .map(|i| message("Ana", &format!("msg {i}"), start + Duration::minutes(i)))
            .collect::<Vec<_>>();
        messages.reverse();

        let transcript = build_transcript(&messages);
        let lines = transcript.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), TRANSCRIPT_LIMIT);
        assert_eq!(lines[0], "[2024-03-01 09:00] Ana: msg 0");
        assert_eq!(lines[9], "[2024-03-01 09:09] Ana: msg 9");
        assert!(!transcript.contains("msg 10"));
    }

    #[test]
    fn transcript_lists_attachments() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut msg = message("Ana", "see file", at);
        msg.attachments.push("https://files.example.com/a.png".to_string());
        assert_eq!(
            build_transcript(&[msg]),
            "[2024-03-01 09:00] Ana: see file (attachment: https://files.example.com/a.png)"
        );
    }

    #[test]
    fn ticket_number_is_base36_millis() {
        let number = format_ticket_number(1_700_000_000_000);
        let digits = number.strip_prefix("CHAT-").unwrap();
        assert_eq!(u64::from_str_radix(digits, 36).unwrap(), 1_700_000_000_000);
        assert_eq!(digits, digits.to_ascii_uppercase());
    }

    #[test]
    fn ticket_numbers_within_one_millisecond_stay_unique() {
        let at = Utc.timestamp_millis_opt(1_800_000_000_000).unwrap();
        let numbers = (0..50).map(|_| ticket_number(at)).collect::<Vec<_>>();
        let values = numbers
            .iter()
            .map(|n| u64::from_str_radix(n.strip_prefix("CHAT-").unwrap(), 36).unwrap())
            .collect::<Vec<_>>();
        assert!(values.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(values[0] >= 1_800_000_000_000);
    }

    #[test]
    fn threads_never_share_a_ticket_number() {
        let at = Utc.timestamp_millis_opt(1_900_000_000_000).unwrap();
        let handles = (0..4)
            .map(|_| std::thread::spawn(move || (0..100).map(|_| ticket_number(at)).collect::<Vec<_>>()))
            .collect::<Vec<_>>();
        let mut all = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>();
        let issued = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), issued);
    }

    #[test]
    fn renumbering_rewrites_quoted_ticket_number() {
        let at = Utc::now();
        let conversation = Conversation {
            id: "c1".to_string(),
            organization_id: "org".to_string(),
            client_account_id: None,
            subject: "Export".to_string(),
            status: ConversationStatus::Assigned,
            assigned_agent_id: Some("s1".to_string()),
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
        let mut change = ConversationChange::unchanged(&conversation, at);
        change.events.push(ConversationEvent::new(
            "c1",
            EventType::ConvertedToTicket,
            None,
            json!({ "ticketId": "t1", "ticketNumber": "CHAT-A" }),
            at,
        ));
        change.messages.push(Message::system("c1", "converted to support ticket CHAT-A", at));
        change.ticket = Some(SupportTicket {
            id: "t1".to_string(),
            ticket_number: "CHAT-A".to_string(),
            subject: "Export".to_string(),
            description: String::new(),
            category: "general".to_string(),
            priority: crate::types::TicketPriority::Medium,
            status: crate::types::TicketStatus::Open,
            assigned_to_staff: None,
            organization_id: None,
            conversation_id: Some("c1".to_string()),
            source: "chat".to_string(),
            created_at: at,
            updated_at: at,
        });

        change.renumber_ticket("CHAT-B".to_string());

        assert_eq!(change.ticket.as_ref().unwrap().ticket_number, "CHAT-B");
        assert_eq!(change.events[0].data["ticketNumber"], "CHAT-B");
        assert_eq!(change.messages[0].body, "converted to support ticket CHAT-B");
    }

    #[test]
    fn base36_edges() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "Z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn draft_tracks_unread_and_auto_assignment() {
        let at = Utc::now();
        let conversation = Conversation {
            id: "c1".to_string(),
            organization_id: "org".to_string(),
            client_account_id: None,
            subject: "Billing question".to_string(),
            status: ConversationStatus::Unassigned,
            assigned_agent_id: None,
            source: ConversationSource::Embed,
            source_domain: None,
            embed_token_id: None,
            unread_count: 0,
            last_message_at: None,
            closed_at: None,
            metadata: Value::Null,
            created_at: at,
            updated_at: at,
        };
        let created = ConversationEvent::new("c1", EventType::Created, None, Value::Null, at);
        let mut draft = ConversationDraft::new(conversation, created);
        draft.push_message(Message::system("c1", "Welcome!", at));
        draft.push_message(message("Ana", "Hello", at));
        draft.assign_to(&staff("a", 5, None), at);

        assert_eq!(draft.conversation.unread_count, 1);
        assert_eq!(draft.conversation.status, ConversationStatus::Assigned);
        assert_eq!(draft.conversation.assigned_agent_id.as_deref(), Some("a"));
        assert_eq!(draft.events.len(), 2);
        assert_eq!(draft.events[1].event_type, EventType::Assigned);
        assert_eq!(draft.events[1].data["auto"], json!(true));
    }

    #[test]
    fn sender_metadata_skips_blank_fields() {
        assert_eq!(
            sender_metadata(Some(" Ana "), Some("")),
            json!({ "senderName": "Ana" })
        );
    }
}
