//! Data models for alumni chat

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Prefix for locally generated ids of messages the server has not acknowledged.
pub const PROVISIONAL_PREFIX: &str = "local-";

pub fn provisional_id() -> String {
    format!("{}{}", PROVISIONAL_PREFIX, uuid::Uuid::new_v4())
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Messages
// ============================================================================

/// Local-only delivery marker. Never serialized onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    Failed,
}

impl Default for DeliveryState {
    fn default() -> Self {
        Self::Sent
    }
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "failed" => Self::Failed,
            _ => Self::Sent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub file_id: String,
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Attachment(AttachmentRef),
}

impl MessageContent {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Short form used for the conversation list.
    pub fn preview(&self) -> String {
        match self {
            Self::Text(text) => text.chars().take(50).collect(),
            Self::Attachment(a) => format!("[{}]", a.file_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, alias = "chatId")]
    pub conversation_id: String,
    pub sender_id: String,
    pub content: MessageContent,
    pub timestamp: i64,
    #[serde(default)]
    pub read_at: Option<i64>,
    #[serde(skip)]
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Optimistic message created on send, before the server has seen it.
    pub fn pending(conversation_id: &str, sender_id: &str, content: MessageContent) -> Self {
        let id = provisional_id();
        Self {
            client_id: Some(id.clone()),
            id,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content,
            timestamp: now_millis(),
            read_at: None,
            delivery_state: DeliveryState::Pending,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.timestamp, &self.id)
    }

    pub fn is_provisional(&self) -> bool {
        self.id.starts_with(PROVISIONAL_PREFIX)
    }

    pub fn is_unread_for(&self, user_id: &str) -> bool {
        self.read_at.is_none() && self.sender_id != user_id
    }
}

/// Total order over messages: timestamp first, then id.
///
/// Ids that parse as unsigned integers compare numerically and sort before
/// non-numeric ids; everything else compares lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub timestamp: i64,
    pub id: String,
}

impl MessageKey {
    pub fn new(timestamp: i64, id: &str) -> Self {
        Self {
            timestamp,
            id: id.to_string(),
        }
    }
}

pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

impl Ord for MessageKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| compare_ids(&self.id, &other.id))
    }
}

impl PartialOrd for MessageKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

// ============================================================================
// Conversation
// ============================================================================

/// Conversation metadata as the server describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "members")]
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_activity_at: Option<i64>,
}

impl ConversationSummary {
    pub fn validate(&self) -> Result<()> {
        let unique: BTreeSet<&String> = self.participant_ids.iter().collect();
        if unique.len() < 2 {
            return Err(Error::InvalidConversation(
                self.id.clone(),
                "needs at least two participants".to_string(),
            ));
        }
        if self.is_group && self.name.as_deref().map_or(true, str::is_empty) {
            return Err(Error::InvalidConversation(
                self.id.clone(),
                "group conversation without a name".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participant_ids: BTreeSet<String>,
    pub is_group: bool,
    pub name: Option<String>,
    /// Ordered by `(timestamp, id)`, unique by id.
    pub messages: Vec<Message>,
    pub unread_count: u32,
    pub last_activity_at: Option<i64>,
    pub last_message_preview: Option<String>,
    /// Server timestamp of the newest message read here. History older than
    /// this is read; live messages are never judged by it.
    pub last_read_at: Option<i64>,
    /// Newest read receipt from another member.
    pub peer_read_at: Option<i64>,
}

impl Conversation {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            participant_ids: BTreeSet::new(),
            is_group: false,
            name: None,
            messages: Vec::new(),
            unread_count: 0,
            last_activity_at: None,
            last_message_preview: None,
            last_read_at: None,
            peer_read_at: None,
        }
    }

    pub fn from_summary(summary: &ConversationSummary) -> Self {
        let mut conv = Self::new(&summary.id);
        conv.apply_summary(summary);
        conv
    }

    /// Merge server metadata. Returns true if anything changed.
    pub fn apply_summary(&mut self, summary: &ConversationSummary) -> bool {
        let participants: BTreeSet<String> = summary.participant_ids.iter().cloned().collect();
        let last_activity = match (self.last_activity_at, summary.last_activity_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let changed = self.participant_ids != participants
            || self.is_group != summary.is_group
            || self.name != summary.name
            || self.last_activity_at != last_activity;

        self.participant_ids = participants;
        self.is_group = summary.is_group;
        self.name = summary.name.clone();
        self.last_activity_at = last_activity;
        changed
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            participant_ids: self.participant_ids.iter().cloned().collect(),
            is_group: self.is_group,
            name: self.name.clone(),
            last_activity_at: self.last_activity_at,
        }
    }

    /// Binary search by ordering key.
    pub fn position_of(&self, key: &MessageKey) -> std::result::Result<usize, usize> {
        self.messages.binary_search_by(|m| m.key().cmp(key))
    }
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

// ============================================================================
// Transport events
// ============================================================================

/// Events this client produces on the event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum OutboundEvent {
    Authenticate {
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    UserJoinRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    UserLeaveRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    UserSendMessage {
        chat_id: String,
        sender_id: String,
        content: MessageContent,
        message_id: String,
        client_id: String,
    },
    #[serde(rename_all = "camelCase")]
    MarkAsRead {
        conversation_id: String,
        user_id: String,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::UserJoinRoom { .. } => "user-join-room",
            Self::UserLeaveRoom { .. } => "user-leave-room",
            Self::UserSendMessage { .. } => "user-send-message",
            Self::MarkAsRead { .. } => "mark-as-read",
        }
    }
}

/// An inbound frame before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawEvent {
    pub fn new(name: &str, payload: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            payload,
        }
    }
}

// ============================================================================
// Updates delivered to subscribers
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    MessageUpserted {
        conversation_id: String,
        message: Message,
    },
    /// An optimistic entry was acknowledged and now carries its server id.
    MessageReplaced {
        conversation_id: String,
        provisional_id: String,
        message: Message,
    },
    DeliveryStateChanged {
        conversation_id: String,
        message_id: String,
        state: DeliveryState,
    },
    MessageDeleted {
        conversation_id: String,
        message_id: String,
    },
    UnreadChanged {
        conversation_id: String,
        unread_count: u32,
        total_unread: u32,
    },
    ConversationUpdated {
        conversation_id: String,
    },
    PeerRead {
        conversation_id: String,
        user_id: String,
        read_at: i64,
    },
    ConnectionStateChanged(ConnectionState),
    AuthRejected(String),
}

impl ChatUpdate {
    /// Conversation this update belongs to; `None` for session-wide updates.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::MessageUpserted { conversation_id, .. }
            | Self::MessageReplaced { conversation_id, .. }
            | Self::DeliveryStateChanged { conversation_id, .. }
            | Self::MessageDeleted { conversation_id, .. }
            | Self::UnreadChanged { conversation_id, .. }
            | Self::ConversationUpdated { conversation_id }
            | Self::PeerRead { conversation_id, .. } => Some(conversation_id),
            Self::ConnectionStateChanged(_) | Self::AuthRejected(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_tie_break() {
        let mut keys = vec![
            MessageKey::new(100, "b"),
            MessageKey::new(101, "c"),
            MessageKey::new(100, "a"),
        ];
        keys.sort();
        let ids: Vec<&str> = keys.iter().map(|k| k.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_numeric_ids_compare_numerically() {
        assert_eq!(compare_ids("9", "10"), Ordering::Less);
        assert_eq!(compare_ids("10", "1a"), Ordering::Less);
        assert_eq!(compare_ids("1a", "9"), Ordering::Greater);
        assert_eq!(compare_ids("abc", "abd"), Ordering::Less);
    }

    #[test]
    fn test_message_from_wire() {
        let msg: Message = serde_json::from_value(json!({
            "_id": "64f0c2",
            "chatId": "chat-1",
            "senderId": "u2",
            "content": "hi there",
            "timestamp": 1700000000000i64,
            "clientId": "local-xyz"
        }))
        .unwrap();

        assert_eq!(msg.id, "64f0c2");
        assert_eq!(msg.conversation_id, "chat-1");
        assert_eq!(msg.content, MessageContent::text("hi there"));
        assert_eq!(msg.client_id.as_deref(), Some("local-xyz"));
        assert_eq!(msg.delivery_state, DeliveryState::Sent);
        assert!(msg.read_at.is_none());
    }

    #[test]
    fn test_attachment_content_from_wire() {
        let content: MessageContent = serde_json::from_value(json!({
            "fileId": "f1",
            "fileName": "cv.pdf",
            "mimeType": "application/pdf"
        }))
        .unwrap();
        assert_eq!(content.preview(), "[cv.pdf]");
    }

    #[test]
    fn test_summary_validation() {
        let mut summary = ConversationSummary {
            id: "c1".into(),
            participant_ids: vec!["u1".into(), "u1".into()],
            is_group: false,
            name: None,
            last_activity_at: None,
        };
        assert!(summary.validate().is_err());

        summary.participant_ids = vec!["u1".into(), "u2".into(), "u3".into()];
        summary.is_group = true;
        assert!(summary.validate().is_err());

        summary.name = Some("Class of 2012".into());
        assert!(summary.validate().is_ok());
    }

    #[test]
    fn test_outbound_wire_format() {
        let event = OutboundEvent::MarkAsRead {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "mark-as-read", "payload": {"conversationId": "c1", "userId": "u1"}})
        );
        assert_eq!(event.name(), "mark-as-read");
    }

    #[test]
    fn test_pending_message_is_provisional() {
        let msg = Message::pending("c1", "me", MessageContent::text("yo"));
        assert!(msg.is_provisional());
        assert_eq!(msg.client_id.as_deref(), Some(msg.id.as_str()));
        assert_eq!(msg.delivery_state, DeliveryState::Pending);
    }
}
