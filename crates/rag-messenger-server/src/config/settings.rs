use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub broadcaster: BroadcasterConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Enables `/admin/*` routes when set.
    #[serde(default)]
    pub admin_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SecurityConfig {
    /// Platform application secret used for webhook signatures.
    /// Leaving it empty runs the webhook in insecure mode.
    #[serde(default)]
    pub app_secret: Option<String>,
    /// Operator-wide verify token accepted alongside per-channel tokens.
    #[serde(default)]
    pub fallback_verify_token: Option<String>,
    /// Base64 encoded 32-byte key for the credential vault.
    pub vault_key: String,
    #[serde(default = "default_platform_object")]
    pub platform_object: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Redis,
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_backend")]
    pub backend: QueueBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_dequeue_wait_ms")]
    pub dequeue_wait_ms: u64,
    #[serde(default = "default_failed_retention")]
    pub failed_retention: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub ingest_workers: usize,
    #[serde(default = "default_workers")]
    pub reply_workers: usize,
    #[serde(default = "default_workers")]
    pub deliver_workers: usize,
    #[serde(default = "default_deliver_max_attempts")]
    pub deliver_max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub deliver_backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub deliver_backoff_max_ms: u64,
    /// A BOT message with identical text inside this window is treated as a duplicate.
    #[serde(default = "default_bot_duplicate_window_secs")]
    pub bot_duplicate_window_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub model: String,
    pub base_url: String,
    pub dimension: usize,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,
    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_window")]
    pub window: usize,
    #[serde(default = "default_summarize_threshold")]
    pub summarize_threshold: usize,
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    #[serde(default = "default_hard_cap")]
    pub hard_cap: usize,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PlatformConfig {
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
    #[serde(default = "default_graph_api_version")]
    pub api_version: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BroadcasterConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Concurrency caps on outbound model calls, shared by every worker.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_embedding_concurrency")]
    pub embedding_concurrency: usize,
    #[serde(default = "default_llm_concurrency")]
    pub llm_generate_concurrency: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

fn default_platform_object() -> String {
    "page".to_string()
}

fn default_queue_backend() -> QueueBackend {
    QueueBackend::Redis
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "rag-messenger".to_string()
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_dequeue_wait_ms() -> u64 {
    2_000
}

fn default_failed_retention() -> usize {
    1_000
}

fn default_workers() -> usize {
    2
}

fn default_deliver_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_bot_duplicate_window_secs() -> u64 {
    5
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_top_k() -> usize {
    5
}

fn default_min_similarity() -> f32 {
    0.75
}

fn default_max_context_tokens() -> usize {
    2_000
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_gemini_base_url() -> String {
    // OpenAI-compatible surface of the Gemini API
    "https://generativelanguage.googleapis.com/v1beta/openai".to_string()
}

fn default_max_history_messages() -> usize {
    50
}

fn default_max_message_chars() -> usize {
    4_000
}

fn default_denylist() -> Vec<String> {
    vec![
        r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+instructions".to_string(),
        r"(?i)disregard\s+(your|the)\s+(rules|guidelines|system\s+prompt)".to_string(),
        r"(?i)<\s*script\b".to_string(),
    ]
}

fn default_memory_window() -> usize {
    10
}

fn default_summarize_threshold() -> usize {
    8
}

fn default_keep_recent() -> usize {
    4
}

fn default_hard_cap() -> usize {
    20
}

fn default_summary_max_chars() -> usize {
    1_500
}

fn default_graph_base_url() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_graph_api_version() -> String {
    "v19.0".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

fn default_embedding_concurrency() -> usize {
    8
}

fn default_llm_concurrency() -> usize {
    4
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_queue_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            poll_interval_ms: default_poll_interval_ms(),
            dequeue_wait_ms: default_dequeue_wait_ms(),
            failed_retention: default_failed_retention(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest_workers: default_workers(),
            reply_workers: default_workers(),
            deliver_workers: default_workers(),
            deliver_max_attempts: default_deliver_max_attempts(),
            deliver_backoff_base_ms: default_backoff_base_ms(),
            deliver_backoff_max_ms: default_backoff_max_ms(),
            bot_duplicate_window_secs: default_bot_duplicate_window_secs(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            openai_base_url: default_openai_base_url(),
            anthropic_base_url: default_anthropic_base_url(),
            gemini_base_url: default_gemini_base_url(),
            timeout_seconds: default_timeout_seconds(),
            max_history_messages: default_max_history_messages(),
            max_message_chars: default_max_message_chars(),
            denylist: default_denylist(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            window: default_memory_window(),
            summarize_threshold: default_summarize_threshold(),
            keep_recent: default_keep_recent(),
            hard_cap: default_hard_cap(),
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            graph_base_url: default_graph_base_url(),
            api_version: default_graph_api_version(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            embedding_concurrency: default_embedding_concurrency(),
            llm_generate_concurrency: default_llm_concurrency(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            // Example: APP_DATABASE__URL=postgres://...
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;

        if self.pipeline.deliver_max_attempts == 0 {
            anyhow::bail!("pipeline.deliver_max_attempts must be at least 1");
        }

        if !(0.0..=1.0).contains(&self.retrieval.min_similarity) {
            anyhow::bail!(
                "retrieval.min_similarity must be within [0, 1], got {}",
                self.retrieval.min_similarity
            );
        }

        crate::vault::CredentialVault::from_base64(&self.security.vault_key)
            .map_err(|e| anyhow::anyhow!("security.vault_key: {}", e))?;

        if self.security.app_secret.as_deref().unwrap_or("").is_empty() {
            tracing::warn!("security.app_secret is not set, webhook signatures will NOT be verified");
        }

        Ok(())
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.keep_recent == 0 || self.keep_recent >= self.summarize_threshold {
            anyhow::bail!(
                "memory.keep_recent ({}) must be between 1 and summarize_threshold ({})",
                self.keep_recent,
                self.summarize_threshold
            );
        }
        if self.hard_cap < self.window {
            anyhow::bail!(
                "memory.hard_cap ({}) must not be smaller than memory.window ({})",
                self.hard_cap,
                self.window
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_defaults_are_consistent() {
        assert!(MemoryConfig::default().validate().is_ok());
    }

    #[test]
    fn keep_recent_must_stay_below_threshold() {
        let cfg = MemoryConfig {
            keep_recent: 8,
            summarize_threshold: 8,
            ..MemoryConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn queue_backend_parses_lowercase() {
        let cfg: QueueConfig = serde_json::from_str(r#"{"backend":"memory"}"#).unwrap();
        assert_eq!(cfg.backend, QueueBackend::Memory);
        assert_eq!(cfg.poll_interval_ms, 250);
    }
}
