use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::database::ChunkMatch;
use crate::models::{Conversation, Message, TokenUsage};
use crate::services::conversation::{ContextBuilder, MemoryError, MemoryManager, MemoryTurn};
use crate::services::llm::{ChatMessage, GatewayError, GenerationConfig, LlmGateway, Provider};
use crate::services::vector_service::VectorRetrievalService;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("generation failed: {0}")]
    Generation(#[from] GatewayError),
}

/// Generated answer with the chunks it was grounded on.
#[derive(Debug, Clone)]
pub struct RagReply {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub provider: Provider,
    pub sources: Vec<Uuid>,
}

/// Memory, retrieval and generation for a single reply.
pub struct RagService {
    retrieval: Arc<VectorRetrievalService>,
    gateway: Arc<LlmGateway>,
    memory: Arc<MemoryManager>,
    context_builder: ContextBuilder,
    config: RetrievalConfig,
}

impl RagService {
    pub fn new(
        retrieval: Arc<VectorRetrievalService>,
        gateway: Arc<LlmGateway>,
        memory: Arc<MemoryManager>,
        config: RetrievalConfig,
    ) -> Self {
        let context_builder = ContextBuilder::new(
            ContextBuilder::default_base_instruction(),
            config.max_context_tokens,
        );
        Self {
            retrieval,
            gateway,
            memory,
            context_builder,
            config,
        }
    }

    /// Answers `trigger` within `conversation`.
    ///
    /// Retrieval failures degrade to an answer without knowledge; memory and
    /// generation failures are returned.
    pub async fn generate_reply(
        &self,
        conversation: &Conversation,
        trigger: &Message,
        mut generation: GenerationConfig,
    ) -> Result<RagReply, RagError> {
        let mut memory = self.memory.load(conversation.id).await?;
        if !memory.contains_message(trigger.id) {
            self.memory.append(&mut memory, MemoryTurn::from(trigger));
        }

        let memory = self.memory.reconcile(memory, &generation).await;
        if let Err(e) = self.memory.persist(&memory).await {
            warn!(conversation_id = %conversation.id, error = %e, "Failed to persist memory summary");
        }

        let chunks = self.retrieve(&trigger.text, conversation.tenant_id).await;
        let (knowledge, metrics) = self.context_builder.build_retrieval_context(&chunks);
        debug!(
            conversation_id = %conversation.id,
            chunks_used = metrics.chunks_used,
            estimated_tokens = metrics.estimated_tokens,
            truncated = metrics.truncated,
            "Built retrieval context"
        );

        let tenant_instruction = generation.system_prompt.take();
        let system = self.context_builder.build_system_context(
            tenant_instruction.as_deref(),
            memory.summary.as_deref(),
            knowledge,
        );

        let mut messages = Vec::with_capacity(memory.window.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend(memory.to_chat_messages());

        let response = self.gateway.generate(&generation, &messages).await?;
        info!(
            conversation_id = %conversation.id,
            provider = %generation.provider,
            history = memory.window.len(),
            "Reply generated"
        );

        Ok(RagReply {
            text: response.text.trim().to_string(),
            usage: response.usage,
            provider: generation.provider,
            sources: chunks
                .iter()
                .take(metrics.chunks_used)
                .map(|c| c.id)
                .collect(),
        })
    }

    async fn retrieve(&self, query: &str, tenant_id: Uuid) -> Vec<ChunkMatch> {
        let embedding = match self.retrieval.embed(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Query embedding failed, answering without knowledge");
                return Vec::new();
            }
        };

        match self
            .retrieval
            .search(&embedding, tenant_id, self.config.top_k, self.config.min_similarity)
            .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Retrieval failed, answering without knowledge");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmConfig, MemoryConfig};
    use crate::database::{ChunkRecord, ConversationStore, MemoryStore};
    use crate::models::{ChannelConnection, NewMessage};
    use crate::services::embedding_service::MockEmbeddingProvider;
    use crate::services::llm::{ChatRole, GenerationResponse, ProviderAdapter};
    use crate::utils::Limiters;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingAdapter {
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl ProviderAdapter for RecordingAdapter {
        fn provider(&self) -> Provider {
            Provider::OpenAi
        }

        async fn generate(
            &self,
            _config: &GenerationConfig,
            messages: &[ChatMessage],
        ) -> anyhow::Result<GenerationResponse> {
            self.seen.lock().push(messages.to_vec());
            Ok(GenerationResponse {
                text: " We ship in 3 days. ".into(),
                usage: None,
            })
        }
    }

    fn generation() -> GenerationConfig {
        GenerationConfig {
            provider: Provider::OpenAi,
            api_key: "k".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.3,
            max_tokens: 256,
            system_prompt: Some("You are Acme's helper.".into()),
        }
    }

    async fn fixture(
        embedder: MockEmbeddingProvider,
    ) -> (RagService, Arc<RecordingAdapter>, Conversation, Message) {
        fixture_with_chunks(embedder, &["Standard shipping takes 3 days."]).await
    }

    async fn fixture_with_chunks(
        embedder: MockEmbeddingProvider,
        chunks: &[&str],
    ) -> (RagService, Arc<RecordingAdapter>, Conversation, Message) {
        let store = Arc::new(MemoryStore::new());
        let tenant_id = Uuid::new_v4();
        let channel = ChannelConnection {
            id: Uuid::new_v4(),
            tenant_id,
            page_id: "pg1".into(),
            access_token: "enc".into(),
            verify_token: None,
            auto_reply_default: true,
        };
        for (index, content) in chunks.iter().enumerate() {
            store.add_chunk(ChunkRecord {
                id: Uuid::new_v4(),
                tenant_id,
                content: content.to_string(),
                embedding: vec![1.0, 0.0],
                metadata: json!({"source": "shipping.pdf", "chunkIndex": index}),
            });
        }

        let (conversation, _) = store
            .find_or_create_conversation(&channel, "psid1")
            .await
            .unwrap();
        let (trigger, _) = store
            .insert_message(NewMessage::user(conversation.id, "How long is shipping?", 1))
            .await
            .unwrap();

        let limiters = Arc::new(Limiters::default());
        let adapter = Arc::new(RecordingAdapter::default());
        let gateway = Arc::new(
            LlmGateway::new(LlmConfig::default(), limiters.clone())
                .unwrap()
                .with_adapter(adapter.clone()),
        );
        let retrieval = Arc::new(VectorRetrievalService::new(
            Arc::new(embedder),
            store.clone(),
            store.clone(),
            limiters,
        ));
        let memory = Arc::new(MemoryManager::new(
            store.clone(),
            gateway.clone(),
            MemoryConfig::default(),
        ));
        let service = RagService::new(retrieval, gateway, memory, RetrievalConfig::default());
        (service, adapter, conversation, trigger)
    }

    #[tokio::test]
    async fn grounds_reply_in_retrieved_chunks() {
        let mut embedder = MockEmbeddingProvider::new();
        embedder.expect_embed().returning(|_| Ok(vec![1.0, 0.0]));
        let (service, adapter, conversation, trigger) = fixture(embedder).await;

        let reply = service
            .generate_reply(&conversation, &trigger, generation())
            .await
            .unwrap();
        assert_eq!(reply.text, "We ship in 3 days.");
        assert_eq!(reply.sources.len(), 1);

        let seen = adapter.seen.lock();
        let messages = &seen[0];
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages[0].content.starts_with("You are Acme's helper."));
        assert!(messages[0].content.contains("Standard shipping takes 3 days."));
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some("How long is shipping?"));
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn default_limits_accept_full_page_of_knowledge() {
        let mut embedder = MockEmbeddingProvider::new();
        embedder.expect_embed().returning(|_| Ok(vec![1.0, 0.0]));
        let paragraph = "Orders placed before noon ship the same day from our warehouse. ".repeat(14);
        let chunks: Vec<String> = (0..5).map(|i| format!("Section {i}. {paragraph}")).collect();
        let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        assert!(chunks.iter().all(|c| c.len() > 850));

        let (service, adapter, conversation, trigger) =
            fixture_with_chunks(embedder, &chunk_refs).await;
        let reply = service
            .generate_reply(&conversation, &trigger, generation())
            .await
            .unwrap();

        assert_eq!(reply.sources.len(), 5);
        let seen = adapter.seen.lock();
        assert!(seen[0][0].content.chars().count() > 4_000);
    }

    #[tokio::test]
    async fn embedding_failure_still_answers() {
        let mut embedder = MockEmbeddingProvider::new();
        embedder
            .expect_embed()
            .returning(|_| Err(anyhow::anyhow!("embedding server down")));
        let (service, adapter, conversation, trigger) = fixture(embedder).await;

        let reply = service
            .generate_reply(&conversation, &trigger, generation())
            .await
            .unwrap();
        assert!(reply.sources.is_empty());
        assert!(!adapter.seen.lock()[0][0].content.contains("Relevant knowledge"));
    }
}
