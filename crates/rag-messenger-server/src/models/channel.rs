use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A connected messaging surface (one platform page) and its credentials.
///
/// Tokens are stored encrypted by the credential vault and decrypted only at
/// the call site that needs them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConnection {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// External platform page id, the `channelId` carried by jobs.
    pub page_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub verify_token: Option<String>,
    /// Auto-reply flag given to new conversations on this channel.
    pub auto_reply_default: bool,
}

/// Tenant generation settings as stored, API key still encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantGenerationConfig {
    pub tenant_id: Uuid,
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}
