use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Open,
    Snoozed,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Snoozed => "SNOOZED",
            Self::Closed => "CLOSED",
        }
    }
}

impl From<String> for ConversationStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "SNOOZED" => Self::Snoozed,
            "CLOSED" => Self::Closed,
            _ => Self::Open,
        }
    }
}

/// Customer profile cached from the channel platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerProfile {
    pub name: Option<String>,
    pub locale: Option<String>,
    pub avatar_url: Option<String>,
}

/// One end-user thread on one connected channel.
///
/// `(channel_id, sender_id)` is unique: there is exactly one conversation per
/// sender on a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Internal channel connection id.
    pub channel_id: Uuid,
    pub sender_id: String,
    pub status: ConversationStatus,
    pub auto_reply: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Free-text notes, doubles as the persisted memory summary.
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub customer: CustomerProfile,
    pub created_at: DateTime<Utc>,
}

/// Result of bumping a conversation after a new message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationActivity {
    pub last_message_at: DateTime<Utc>,
    pub message_count: i64,
}
