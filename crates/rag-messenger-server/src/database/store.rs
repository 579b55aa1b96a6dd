use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ChannelConnection, Conversation, ConversationActivity, CustomerProfile, DedupeKey, Message,
    NewMessage, TenantGenerationConfig,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Delivery or read acknowledgement from the platform for messages the page sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Receipt {
    /// `mids` lists delivered platform message ids; every message sent before
    /// `watermark` (epoch ms) is delivered as well.
    Delivered { mids: Vec<String>, watermark: i64 },
    /// Every message sent before `watermark` (epoch ms) was read.
    Read { watermark: i64 },
}

/// Conversations, messages, channel connections and tenant generation settings.
///
/// Implementations must keep two atomicity contracts: one conversation per
/// `(channel, sender)` under concurrent creation, and one message per
/// [`DedupeKey`] under concurrent inserts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn channel_by_page_id(
        &self,
        page_id: &str,
    ) -> Result<Option<ChannelConnection>, StoreError>;

    async fn channel(&self, id: Uuid) -> Result<Option<ChannelConnection>, StoreError>;

    /// Encrypted verify tokens of every connected channel.
    async fn verify_tokens(&self) -> Result<Vec<String>, StoreError>;

    /// Returns the conversation and whether this call created it.
    async fn find_or_create_conversation(
        &self,
        channel: &ChannelConnection,
        sender_id: &str,
    ) -> Result<(Conversation, bool), StoreError>;

    async fn find_conversation(
        &self,
        channel_id: Uuid,
        sender_id: &str,
    ) -> Result<Option<Conversation>, StoreError>;

    async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    async fn update_customer_profile(
        &self,
        conversation_id: Uuid,
        profile: &CustomerProfile,
    ) -> Result<(), StoreError>;

    /// Moves `last_message_at` forward (never back) and reports the message count.
    async fn touch_conversation(
        &self,
        conversation_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ConversationActivity, StoreError>;

    async fn update_notes(&self, conversation_id: Uuid, notes: &str) -> Result<(), StoreError>;

    async fn find_message(&self, key: &DedupeKey) -> Result<Option<Message>, StoreError>;

    /// Inserts unless a message with the same dedupe key exists; returns the
    /// stored message and whether this call inserted it.
    async fn insert_message(&self, message: NewMessage) -> Result<(Message, bool), StoreError>;

    async fn message(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Latest `limit` messages, oldest first.
    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    async fn recent_bot_message_with_text(
        &self,
        conversation_id: Uuid,
        text: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError>;

    /// BOT message generated in answer to `trigger_message_id`, if any.
    async fn bot_reply_for(&self, trigger_message_id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Sets the `replyEnqueued` marker. True only for the single caller that set it.
    async fn claim_reply(&self, message_id: Uuid) -> Result<bool, StoreError>;

    async fn record_delivery(
        &self,
        message_id: Uuid,
        platform_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_delivery_failure(&self, message_id: Uuid, error: &str)
        -> Result<(), StoreError>;

    /// Applies a receipt to the conversation's sent BOT messages; returns the ids touched.
    async fn record_receipt(
        &self,
        conversation_id: Uuid,
        receipt: &Receipt,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn generation_config(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<TenantGenerationConfig>, StoreError>;
}

/// One tenant document chunk with its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub id: Uuid,
    pub content: String,
    pub metadata: serde_json::Value,
    pub similarity: f32,
}

/// Remote similarity search over tenant chunks.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn match_chunks(
        &self,
        query_embedding: &[f32],
        tenant_id: Uuid,
        match_threshold: f32,
        match_count: usize,
    ) -> Result<Vec<ChunkMatch>, StoreError>;
}

/// Raw chunk rows for the local cosine scan.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn tenant_chunks(&self, tenant_id: Uuid) -> Result<Vec<ChunkRecord>, StoreError>;
}
