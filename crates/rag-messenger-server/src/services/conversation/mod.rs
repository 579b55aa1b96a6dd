//! Conversation memory: bounded window, rolling summary and prompt context.

mod context_builder;
pub mod manager;
pub mod types;

pub use context_builder::{ContextBuilder, ContextMetrics};
pub use manager::{merge_summaries, MemoryError, MemoryManager, Summarizer};
pub use types::{ConversationMemory, MemoryTurn, SystemContextComponents};
