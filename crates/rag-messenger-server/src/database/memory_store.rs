use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{
    ChunkMatch, ChunkRecord, ChunkSource, ConversationStore, Receipt, StoreError, VectorStore,
};
use crate::models::{
    timestamp_from_millis, ChannelConnection, Conversation, ConversationActivity,
    ConversationStatus, CustomerProfile, DedupeKey, DeliveryStatus, Message, MessageRole, NewMessage,
    TenantGenerationConfig,
};
use crate::utils::cosine_similarity;

/// In-process store for single-node runs and tests.
///
/// Uniqueness rides on `DashMap::entry`, which holds the shard lock for the
/// check and the insert together.
#[derive(Default)]
pub struct MemoryStore {
    channels: DashMap<String, ChannelConnection>,
    threads: DashMap<(Uuid, String), Uuid>,
    conversations: DashMap<Uuid, Conversation>,
    dedupe: DashMap<DedupeKey, Uuid>,
    messages: DashMap<Uuid, Message>,
    /// Message ids per conversation in insertion order.
    timelines: DashMap<Uuid, Vec<Uuid>>,
    generation: DashMap<Uuid, TenantGenerationConfig>,
    chunks: RwLock<Vec<ChunkRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&self, channel: ChannelConnection) {
        self.channels.insert(channel.page_id.clone(), channel);
    }

    pub fn set_generation_config(&self, config: TenantGenerationConfig) {
        self.generation.insert(config.tenant_id, config);
    }

    pub fn add_chunk(&self, chunk: ChunkRecord) {
        self.chunks.write().push(chunk);
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Every message of a conversation, oldest first.
    pub fn messages_of(&self, conversation_id: Uuid) -> Vec<Message> {
        let ids = self
            .timelines
            .get(&conversation_id)
            .map(|t| t.value().clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.messages.get(id).map(|m| m.value().clone()))
            .collect()
    }

    fn update_message<F>(&self, message_id: Uuid, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Message),
    {
        let mut message = self
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        update(message.value_mut());
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn channel_by_page_id(
        &self,
        page_id: &str,
    ) -> Result<Option<ChannelConnection>, StoreError> {
        Ok(self.channels.get(page_id).map(|c| c.value().clone()))
    }

    async fn channel(&self, id: Uuid) -> Result<Option<ChannelConnection>, StoreError> {
        Ok(self
            .channels
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.value().clone()))
    }

    async fn verify_tokens(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .channels
            .iter()
            .filter_map(|c| c.verify_token.clone())
            .collect())
    }

    async fn find_or_create_conversation(
        &self,
        channel: &ChannelConnection,
        sender_id: &str,
    ) -> Result<(Conversation, bool), StoreError> {
        let (id, created) = match self.threads.entry((channel.id, sender_id.to_string())) {
            Entry::Occupied(entry) => (*entry.get(), false),
            Entry::Vacant(entry) => {
                let conversation = Conversation {
                    id: Uuid::new_v4(),
                    tenant_id: channel.tenant_id,
                    channel_id: channel.id,
                    sender_id: sender_id.to_string(),
                    status: ConversationStatus::Open,
                    auto_reply: channel.auto_reply_default,
                    last_message_at: None,
                    notes: None,
                    tags: Vec::new(),
                    customer: CustomerProfile::default(),
                    created_at: Utc::now(),
                };
                let id = conversation.id;
                self.conversations.insert(id, conversation);
                entry.insert(id);
                (id, true)
            }
        };

        let conversation = self
            .conversations
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))?;

        Ok((conversation, created))
    }

    async fn find_conversation(
        &self,
        channel_id: Uuid,
        sender_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let id = match self.threads.get(&(channel_id, sender_id.to_string())) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.conversations.get(&id).map(|c| c.value().clone()))
    }

    async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.get(&id).map(|c| c.value().clone()))
    }

    async fn update_customer_profile(
        &self,
        conversation_id: Uuid,
        profile: &CustomerProfile,
    ) -> Result<(), StoreError> {
        if let Some(mut conversation) = self.conversations.get_mut(&conversation_id) {
            conversation.customer = profile.clone();
        }
        Ok(())
    }

    async fn touch_conversation(
        &self,
        conversation_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ConversationActivity, StoreError> {
        let last_message_at = {
            let mut conversation = self
                .conversations
                .get_mut(&conversation_id)
                .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
            let latest = conversation.last_message_at.map_or(at, |prev| prev.max(at));
            conversation.last_message_at = Some(latest);
            latest
        };

        let message_count = self
            .timelines
            .get(&conversation_id)
            .map_or(0, |t| t.len() as i64);

        Ok(ConversationActivity {
            last_message_at,
            message_count,
        })
    }

    async fn update_notes(&self, conversation_id: Uuid, notes: &str) -> Result<(), StoreError> {
        if let Some(mut conversation) = self.conversations.get_mut(&conversation_id) {
            conversation.notes = Some(notes.to_string());
        }
        Ok(())
    }

    async fn find_message(&self, key: &DedupeKey) -> Result<Option<Message>, StoreError> {
        let id = match self.dedupe.get(key) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.messages.get(&id).map(|m| m.value().clone()))
    }

    async fn insert_message(&self, message: NewMessage) -> Result<(Message, bool), StoreError> {
        let build = |message: NewMessage| Message {
            id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            role: message.role,
            text: message.text,
            created_at: Utc::now(),
            source_timestamp: message.source_timestamp,
            metadata: message.metadata,
            provider: message.provider,
        };

        let stored = match message.dedupe_key() {
            Some(key) => match self.dedupe.entry(key) {
                Entry::Occupied(entry) => {
                    let id = *entry.get();
                    drop(entry);
                    let existing = self
                        .messages
                        .get(&id)
                        .map(|m| m.value().clone())
                        .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
                    return Ok((existing, false));
                }
                Entry::Vacant(entry) => {
                    let stored = build(message);
                    self.messages.insert(stored.id, stored.clone());
                    entry.insert(stored.id);
                    stored
                }
            },
            None => {
                let stored = build(message);
                self.messages.insert(stored.id, stored.clone());
                stored
            }
        };

        self.timelines
            .entry(stored.conversation_id)
            .or_default()
            .push(stored.id);

        Ok((stored, true))
    }

    async fn message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.get(&id).map(|m| m.value().clone()))
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let all = self.messages_of(conversation_id);
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn recent_bot_message_with_text(
        &self,
        conversation_id: Uuid,
        text: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError> {
        Ok(self
            .messages_of(conversation_id)
            .into_iter()
            .rev()
            .find(|m| {
                m.role == MessageRole::Bot && m.text == text && m.created_at >= since
            }))
    }

    async fn bot_reply_for(&self, trigger_message_id: Uuid) -> Result<Option<Message>, StoreError> {
        let trigger = match self.messages.get(&trigger_message_id) {
            Some(m) => m.conversation_id,
            None => return Ok(None),
        };
        Ok(self.messages_of(trigger).into_iter().find(|m| {
            m.role == MessageRole::Bot
                && m.metadata.trigger_message_id == Some(trigger_message_id)
        }))
    }

    async fn claim_reply(&self, message_id: Uuid) -> Result<bool, StoreError> {
        let mut message = self
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        if message.metadata.reply_enqueued {
            return Ok(false);
        }
        message.metadata.reply_enqueued = true;
        Ok(true)
    }

    async fn record_delivery(
        &self,
        message_id: Uuid,
        platform_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_message(message_id, |m| {
            m.metadata.platform_message_id = Some(platform_message_id.to_string());
            m.metadata.sent_at = Some(sent_at);
            m.metadata.delivery_status = Some(DeliveryStatus::Sent);
            m.metadata.delivery_error = None;
        })
    }

    async fn record_delivery_failure(
        &self,
        message_id: Uuid,
        error: &str,
    ) -> Result<(), StoreError> {
        self.update_message(message_id, |m| {
            m.metadata.delivery_status = Some(DeliveryStatus::Failed);
            m.metadata.delivery_error = Some(error.to_string());
        })
    }

    async fn record_receipt(
        &self,
        conversation_id: Uuid,
        receipt: &Receipt,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let ids = self
            .timelines
            .get(&conversation_id)
            .map(|t| t.value().clone())
            .unwrap_or_default();

        let mut touched = Vec::new();
        for id in ids {
            let Some(mut message) = self.messages.get_mut(&id) else {
                continue;
            };
            if message.role != MessageRole::Bot {
                continue;
            }
            let (Some(mid), Some(sent_at)) = (
                message.metadata.platform_message_id.clone(),
                message.metadata.sent_at,
            ) else {
                continue;
            };

            match receipt {
                Receipt::Delivered { mids, watermark } => {
                    let listed = mids.contains(&mid);
                    let below = *watermark > 0 && sent_at <= timestamp_from_millis(*watermark);
                    if message.metadata.delivered_at.is_none() && (listed || below) {
                        message.metadata.delivered_at = Some(at);
                        if message.metadata.delivery_status != Some(DeliveryStatus::Read) {
                            message.metadata.delivery_status = Some(DeliveryStatus::Delivered);
                        }
                        touched.push(id);
                    }
                }
                Receipt::Read { watermark } => {
                    if message.metadata.read_at.is_none()
                        && sent_at <= timestamp_from_millis(*watermark)
                    {
                        message.metadata.read_at = Some(at);
                        message.metadata.delivery_status = Some(DeliveryStatus::Read);
                        touched.push(id);
                    }
                }
            }
        }

        Ok(touched)
    }

    async fn generation_config(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<TenantGenerationConfig>, StoreError> {
        Ok(self.generation.get(&tenant_id).map(|c| c.value().clone()))
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn match_chunks(
        &self,
        query_embedding: &[f32],
        tenant_id: Uuid,
        match_threshold: f32,
        match_count: usize,
    ) -> Result<Vec<ChunkMatch>, StoreError> {
        let chunks = self.chunks.read();
        let mut matches: Vec<ChunkMatch> = chunks
            .iter()
            .filter(|c| c.tenant_id == tenant_id)
            .filter_map(|c| {
                let similarity = cosine_similarity(query_embedding, &c.embedding).ok()?;
                (similarity >= match_threshold).then(|| ChunkMatch {
                    id: c.id,
                    content: c.content.clone(),
                    metadata: c.metadata.clone(),
                    similarity,
                })
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(match_count);
        Ok(matches)
    }
}

#[async_trait]
impl ChunkSource for MemoryStore {
    async fn tenant_chunks(&self, tenant_id: Uuid) -> Result<Vec<ChunkRecord>, StoreError> {
        Ok(self
            .chunks
            .read()
            .iter()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}
