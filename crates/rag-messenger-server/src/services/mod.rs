pub mod broadcaster;
pub mod conversation;
pub mod embedding_service;
pub mod llm;
pub mod platform;
pub mod rag_service;
pub mod vector_service;

pub use broadcaster::{publish_for, Broadcaster, EventBus, RealtimeEvent, Subscription, Topic};
pub use embedding_service::{EmbeddingProvider, EmbeddingService};
pub use llm::LlmGateway;
pub use platform::{GraphApiClient, PlatformClient, PlatformError};
pub use rag_service::{RagError, RagReply, RagService};
pub use vector_service::{RetrievalError, VectorRetrievalService};
