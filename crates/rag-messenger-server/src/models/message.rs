use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageRole {
    User,
    Bot,
    Agent,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Bot => "BOT",
            Self::Agent => "AGENT",
        }
    }
}

impl From<String> for MessageRole {
    fn from(s: String) -> Self {
        match s.as_str() {
            "BOT" => Self::Bot,
            "AGENT" => Self::Agent,
            _ => Self::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Free-form message metadata, stored as JSON.
///
/// Known keys are typed; anything else round-trips through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<DeliveryStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_error: Option<String>,
    /// Set once the message has been claimed for an auto-reply.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reply_enqueued: bool,
    /// For BOT messages: the USER message this reply answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Platform timestamp (epoch ms) of the inbound event, part of the dedupe key.
    pub source_timestamp: Option<i64>,
    pub metadata: MessageMetadata,
    /// Generation provider, BOT messages only.
    pub provider: Option<String>,
}

impl Message {
    pub fn is_sent(&self) -> bool {
        self.metadata.platform_message_id.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub text: String,
    pub source_timestamp: Option<i64>,
    pub metadata: MessageMetadata,
    pub provider: Option<String>,
}

impl NewMessage {
    pub fn user(conversation_id: Uuid, text: impl Into<String>, source_timestamp: i64) -> Self {
        Self {
            conversation_id,
            role: MessageRole::User,
            text: text.into(),
            source_timestamp: Some(source_timestamp),
            metadata: MessageMetadata::default(),
            provider: None,
        }
    }

    pub fn bot(conversation_id: Uuid, text: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            conversation_id,
            role: MessageRole::Bot,
            text: text.into(),
            source_timestamp: None,
            metadata: MessageMetadata::default(),
            provider: Some(provider.into()),
        }
    }

    /// Dedupe key, present only for messages that carry a source timestamp.
    pub fn dedupe_key(&self) -> Option<DedupeKey> {
        self.source_timestamp.map(|ts| DedupeKey {
            conversation_id: self.conversation_id,
            role: self.role,
            text: self.text.clone(),
            source_timestamp: ts,
        })
    }
}

/// `(conversation, role, text, source timestamp)`: two messages sharing it are
/// the same platform event delivered twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub text: String,
    pub source_timestamp: i64,
}

impl DedupeKey {
    /// Stable digest of the text, used by the unique index instead of the raw text.
    pub fn text_hash(&self) -> String {
        text_hash(&self.text)
    }
}

pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Platform epoch-millisecond timestamp to `DateTime`, falling back to now
/// for out-of-range values.
pub fn timestamp_from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_keeps_unknown_keys() {
        let raw = serde_json::json!({
            "platformMessageId": "m_1",
            "replyEnqueued": true,
            "campaign": "spring"
        });
        let meta: MessageMetadata = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(meta.platform_message_id.as_deref(), Some("m_1"));
        assert!(meta.reply_enqueued);
        assert_eq!(meta.extra.get("campaign"), Some(&serde_json::json!("spring")));
        assert_eq!(serde_json::to_value(&meta).unwrap(), raw);
    }

    #[test]
    fn bot_messages_have_no_dedupe_key() {
        let conv = Uuid::new_v4();
        assert!(NewMessage::bot(conv, "hi", "openai").dedupe_key().is_none());
        let key = NewMessage::user(conv, "hello", 1000).dedupe_key().unwrap();
        assert_eq!(key.source_timestamp, 1000);
        assert_eq!(key.role, MessageRole::User);
    }
}
