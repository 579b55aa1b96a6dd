use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pgvector::Vector;
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

use super::models::{
    ChannelRow, ChunkMatchRow, ChunkRow, ConversationRow, GenerationConfigRow, MessageRow,
};
use super::store::{
    ChunkMatch, ChunkRecord, ChunkSource, ConversationStore, Receipt, StoreError, VectorStore,
};
use super::DbPool;
use crate::models::{
    ChannelConnection, Conversation, ConversationActivity, CustomerProfile, DedupeKey, Message,
    NewMessage, TenantGenerationConfig,
};

const CONVERSATION_COLUMNS: &str = "id, tenant_id, channel_id, sender_id, status, auto_reply, \
     last_message_at, notes, tags, customer, created_at";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, text, source_timestamp, metadata, provider, created_at";

/// PostgreSQL implementation of the conversation and vector stores.
pub struct Repository {
    pub pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create the conversation tables if missing.
    ///
    /// `document_chunks` and `match_document_chunks` belong to the document
    /// ingestion side and are expected to exist already.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let pool = self.pool.inner();

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS channel_connections (
                id UUID PRIMARY KEY,
                tenant_id UUID NOT NULL,
                page_id TEXT NOT NULL UNIQUE,
                access_token TEXT NOT NULL,
                verify_token TEXT,
                auto_reply_default BOOLEAN NOT NULL DEFAULT TRUE
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS conversations (
                id UUID PRIMARY KEY,
                tenant_id UUID NOT NULL,
                channel_id UUID NOT NULL REFERENCES channel_connections(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'OPEN',
                auto_reply BOOLEAN NOT NULL DEFAULT TRUE,
                last_message_at TIMESTAMPTZ,
                notes TEXT,
                tags TEXT[] NOT NULL DEFAULT '{}',
                customer JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (channel_id, sender_id)
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id UUID PRIMARY KEY,
                conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                text TEXT NOT NULL,
                text_hash TEXT NOT NULL,
                source_timestamp BIGINT,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                provider TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS tenant_generation_configs (
                tenant_id UUID PRIMARY KEY,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                api_key TEXT NOT NULL,
                temperature REAL NOT NULL DEFAULT 0.7,
                max_tokens INTEGER NOT NULL DEFAULT 512,
                system_prompt TEXT
            )"#,
        )
        .execute(pool)
        .await?;

        // Indices
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_dedupe \
             ON messages(conversation_id, role, text_hash, source_timestamp) \
             WHERE source_timestamp IS NOT NULL",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation \
             ON messages(conversation_id, created_at DESC)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_trigger \
             ON messages((metadata->>'triggerMessageId'))",
        )
        .execute(pool)
        .await?;

        debug!("Conversation tables ensured");
        Ok(())
    }

    async fn conversation_by_thread(
        &self,
        channel_id: Uuid,
        sender_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE channel_id = $1 AND sender_id = $2"
        ))
        .bind(channel_id)
        .bind(sender_id)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(row.map(Into::into))
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

#[async_trait]
impl ConversationStore for Repository {
    async fn channel_by_page_id(
        &self,
        page_id: &str,
    ) -> Result<Option<ChannelConnection>, StoreError> {
        let row = sqlx::query_as::<_, ChannelRow>(
            r#"SELECT id, tenant_id, page_id, access_token, verify_token, auto_reply_default
               FROM channel_connections
               WHERE page_id = $1"#,
        )
        .bind(page_id)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(row.map(Into::into))
    }

    async fn channel(&self, id: Uuid) -> Result<Option<ChannelConnection>, StoreError> {
        let row = sqlx::query_as::<_, ChannelRow>(
            r#"SELECT id, tenant_id, page_id, access_token, verify_token, auto_reply_default
               FROM channel_connections
               WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(row.map(Into::into))
    }

    async fn verify_tokens(&self) -> Result<Vec<String>, StoreError> {
        let tokens = sqlx::query_scalar::<_, String>(
            "SELECT verify_token FROM channel_connections WHERE verify_token IS NOT NULL",
        )
        .fetch_all(self.pool.inner())
        .await?;

        Ok(tokens)
    }

    async fn find_or_create_conversation(
        &self,
        channel: &ChannelConnection,
        sender_id: &str,
    ) -> Result<(Conversation, bool), StoreError> {
        // Losers of a concurrent insert get no row back and read the winner's.
        let inserted = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"INSERT INTO conversations (id, tenant_id, channel_id, sender_id, auto_reply)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (channel_id, sender_id) DO NOTHING
               RETURNING {CONVERSATION_COLUMNS}"#
        ))
        .bind(Uuid::new_v4())
        .bind(channel.tenant_id)
        .bind(channel.id)
        .bind(sender_id)
        .bind(channel.auto_reply_default)
        .fetch_optional(self.pool.inner())
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing = self
            .conversation_by_thread(channel.id, sender_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("conversation for {sender_id}")))?;

        Ok((existing, false))
    }

    async fn find_conversation(
        &self,
        channel_id: Uuid,
        sender_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        self.conversation_by_thread(channel_id, sender_id).await
    }

    async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(row.map(Into::into))
    }

    async fn update_customer_profile(
        &self,
        conversation_id: Uuid,
        profile: &CustomerProfile,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE conversations SET customer = $2 WHERE id = $1")
            .bind(conversation_id)
            .bind(Json(profile))
            .execute(self.pool.inner())
            .await?;

        Ok(())
    }

    async fn touch_conversation(
        &self,
        conversation_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ConversationActivity, StoreError> {
        let row = sqlx::query_as::<_, (DateTime<Utc>, i64)>(
            r#"UPDATE conversations
               SET last_message_at = GREATEST(last_message_at, $2)
               WHERE id = $1
               RETURNING last_message_at,
                   (SELECT COUNT(*) FROM messages WHERE conversation_id = $1)"#,
        )
        .bind(conversation_id)
        .bind(at)
        .fetch_optional(self.pool.inner())
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;

        Ok(ConversationActivity {
            last_message_at: row.0,
            message_count: row.1,
        })
    }

    async fn update_notes(&self, conversation_id: Uuid, notes: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE conversations SET notes = $2 WHERE id = $1")
            .bind(conversation_id)
            .bind(notes)
            .execute(self.pool.inner())
            .await?;

        Ok(())
    }

    async fn find_message(&self, key: &DedupeKey) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            r#"SELECT {MESSAGE_COLUMNS} FROM messages
               WHERE conversation_id = $1 AND role = $2 AND text_hash = $3 AND source_timestamp = $4"#
        ))
        .bind(key.conversation_id)
        .bind(key.role.as_str())
        .bind(key.text_hash())
        .bind(key.source_timestamp)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(row.map(Into::into))
    }

    async fn insert_message(&self, message: NewMessage) -> Result<(Message, bool), StoreError> {
        let inserted = sqlx::query_as::<_, MessageRow>(&format!(
            r#"INSERT INTO messages
                   (id, conversation_id, role, text, text_hash, source_timestamp, metadata, provider)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (conversation_id, role, text_hash, source_timestamp)
                   WHERE source_timestamp IS NOT NULL
               DO NOTHING
               RETURNING {MESSAGE_COLUMNS}"#
        ))
        .bind(Uuid::new_v4())
        .bind(message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.text)
        .bind(crate::models::text_hash(&message.text))
        .bind(message.source_timestamp)
        .bind(Json(&message.metadata))
        .bind(&message.provider)
        .fetch_optional(self.pool.inner())
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let key = message
            .dedupe_key()
            .ok_or_else(|| StoreError::Corrupt("insert without dedupe key returned no row".into()))?;
        let existing = self
            .find_message(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound("deduplicated message".into()))?;

        Ok((existing, false))
    }

    async fn message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(row.map(Into::into))
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"SELECT {MESSAGE_COLUMNS} FROM (
                   SELECT {MESSAGE_COLUMNS} FROM messages
                   WHERE conversation_id = $1
                   ORDER BY created_at DESC, id DESC
                   LIMIT $2
               ) recent
               ORDER BY created_at ASC, id ASC"#
        ))
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(self.pool.inner())
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn recent_bot_message_with_text(
        &self,
        conversation_id: Uuid,
        text: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            r#"SELECT {MESSAGE_COLUMNS} FROM messages
               WHERE conversation_id = $1 AND role = 'BOT' AND text = $2 AND created_at >= $3
               ORDER BY created_at DESC
               LIMIT 1"#
        ))
        .bind(conversation_id)
        .bind(text)
        .bind(since)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(row.map(Into::into))
    }

    async fn bot_reply_for(&self, trigger_message_id: Uuid) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            r#"SELECT {MESSAGE_COLUMNS} FROM messages
               WHERE role = 'BOT' AND metadata->>'triggerMessageId' = $1
               ORDER BY created_at ASC
               LIMIT 1"#
        ))
        .bind(trigger_message_id.to_string())
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(row.map(Into::into))
    }

    async fn claim_reply(&self, message_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE messages
               SET metadata = metadata || '{"replyEnqueued": true}'::jsonb
               WHERE id = $1 AND NOT (metadata @> '{"replyEnqueued": true}'::jsonb)"#,
        )
        .bind(message_id)
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_delivery(
        &self,
        message_id: Uuid,
        platform_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE messages
               SET metadata = (metadata - 'deliveryError') || jsonb_build_object(
                   'platformMessageId', $2::text,
                   'sentAt', $3::text,
                   'deliveryStatus', 'SENT')
               WHERE id = $1"#,
        )
        .bind(message_id)
        .bind(platform_message_id)
        .bind(sent_at.to_rfc3339())
        .execute(self.pool.inner())
        .await?;

        Ok(())
    }

    async fn record_delivery_failure(
        &self,
        message_id: Uuid,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE messages
               SET metadata = metadata || jsonb_build_object(
                   'deliveryStatus', 'FAILED',
                   'deliveryError', $2::text)
               WHERE id = $1"#,
        )
        .bind(message_id)
        .bind(error)
        .execute(self.pool.inner())
        .await?;

        Ok(())
    }

    async fn record_receipt(
        &self,
        conversation_id: Uuid,
        receipt: &Receipt,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let ids = match receipt {
            Receipt::Delivered { mids, watermark } => {
                sqlx::query_scalar::<_, Uuid>(
                    r#"UPDATE messages
                       SET metadata = metadata || jsonb_build_object(
                           'deliveredAt', $4::text,
                           'deliveryStatus',
                           CASE WHEN metadata->>'deliveryStatus' = 'READ' THEN 'READ' ELSE 'DELIVERED' END)
                       WHERE conversation_id = $1
                         AND role = 'BOT'
                         AND metadata ? 'platformMessageId'
                         AND NOT metadata ? 'deliveredAt'
                         AND (metadata->>'platformMessageId' = ANY($2)
                              OR ($3::timestamptz IS NOT NULL
                                  AND (metadata->>'sentAt')::timestamptz <= $3))
                       RETURNING id"#,
                )
                .bind(conversation_id)
                .bind(mids)
                .bind(millis_to_datetime(*watermark))
                .bind(at.to_rfc3339())
                .fetch_all(self.pool.inner())
                .await?
            }
            Receipt::Read { watermark } => {
                sqlx::query_scalar::<_, Uuid>(
                    r#"UPDATE messages
                       SET metadata = metadata || jsonb_build_object(
                           'readAt', $3::text,
                           'deliveryStatus', 'READ')
                       WHERE conversation_id = $1
                         AND role = 'BOT'
                         AND metadata ? 'platformMessageId'
                         AND NOT metadata ? 'readAt'
                         AND (metadata->>'sentAt')::timestamptz <= $2
                       RETURNING id"#,
                )
                .bind(conversation_id)
                .bind(millis_to_datetime(*watermark).unwrap_or(at))
                .bind(at.to_rfc3339())
                .fetch_all(self.pool.inner())
                .await?
            }
        };

        Ok(ids)
    }

    async fn generation_config(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<TenantGenerationConfig>, StoreError> {
        let row = sqlx::query_as::<_, GenerationConfigRow>(
            r#"SELECT tenant_id, provider, model, api_key, temperature, max_tokens, system_prompt
               FROM tenant_generation_configs
               WHERE tenant_id = $1"#,
        )
        .bind(tenant_id)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl VectorStore for Repository {
    async fn match_chunks(
        &self,
        query_embedding: &[f32],
        tenant_id: Uuid,
        match_threshold: f32,
        match_count: usize,
    ) -> Result<Vec<ChunkMatch>, StoreError> {
        let rows = sqlx::query_as::<_, ChunkMatchRow>(
            r#"SELECT id, content, metadata, similarity::float8 AS similarity
               FROM match_document_chunks($1::vector, $2, $3, $4)"#,
        )
        .bind(Vector::from(query_embedding.to_vec()))
        .bind(tenant_id)
        .bind(match_threshold as f64)
        .bind(match_count as i32)
        .persistent(false)
        .fetch_all(self.pool.inner())
        .await?;

        debug!("match_document_chunks returned {} rows for tenant {}", rows.len(), tenant_id);

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl ChunkSource for Repository {
    async fn tenant_chunks(&self, tenant_id: Uuid) -> Result<Vec<ChunkRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"SELECT id, tenant_id, content, embedding, metadata
               FROM document_chunks
               WHERE tenant_id = $1"#,
        )
        .bind(tenant_id)
        .persistent(false)
        .fetch_all(self.pool.inner())
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
