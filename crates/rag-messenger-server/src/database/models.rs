//! Row shapes read back from PostgreSQL.

use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::{types::Json, FromRow};
use uuid::Uuid;

use super::store::{ChunkMatch, ChunkRecord};
use crate::models::{
    ChannelConnection, Conversation, CustomerProfile, Message, MessageMetadata,
    TenantGenerationConfig,
};

#[derive(Debug, FromRow)]
pub struct ChannelRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub page_id: String,
    pub access_token: String,
    pub verify_token: Option<String>,
    pub auto_reply_default: bool,
}

impl From<ChannelRow> for ChannelConnection {
    fn from(row: ChannelRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            page_id: row.page_id,
            access_token: row.access_token,
            verify_token: row.verify_token,
            auto_reply_default: row.auto_reply_default,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct ConversationRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub channel_id: Uuid,
    pub sender_id: String,
    pub status: String,
    pub auto_reply: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub customer: Json<CustomerProfile>,
    pub created_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            channel_id: row.channel_id,
            sender_id: row.sender_id,
            status: row.status.into(),
            auto_reply: row.auto_reply,
            last_message_at: row.last_message_at,
            notes: row.notes,
            tags: row.tags,
            customer: row.customer.0,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    pub text: String,
    pub source_timestamp: Option<i64>,
    pub metadata: Json<MessageMetadata>,
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            role: row.role.into(),
            text: row.text,
            created_at: row.created_at,
            source_timestamp: row.source_timestamp,
            metadata: row.metadata.0,
            provider: row.provider,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct GenerationConfigRow {
    pub tenant_id: Uuid,
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: i32,
    pub system_prompt: Option<String>,
}

impl From<GenerationConfigRow> for TenantGenerationConfig {
    fn from(row: GenerationConfigRow) -> Self {
        Self {
            tenant_id: row.tenant_id,
            provider: row.provider,
            model: row.model,
            api_key: row.api_key,
            temperature: row.temperature,
            max_tokens: row.max_tokens.max(1) as u32,
            system_prompt: row.system_prompt,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct ChunkMatchRow {
    pub id: Uuid,
    pub content: String,
    pub metadata: Json<serde_json::Value>,
    pub similarity: f64,
}

impl From<ChunkMatchRow> for ChunkMatch {
    fn from(row: ChunkMatchRow) -> Self {
        Self {
            id: row.id,
            content: row.content,
            metadata: row.metadata.0,
            similarity: row.similarity as f32,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct ChunkRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub content: String,
    pub embedding: Vector,
    pub metadata: Json<serde_json::Value>,
}

impl From<ChunkRow> for ChunkRecord {
    fn from(row: ChunkRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            content: row.content,
            embedding: row.embedding.to_vec(),
            metadata: row.metadata.0,
        }
    }
}
