pub mod memory_store;
pub mod models;
pub mod pool;
pub mod repository;
pub mod store;

pub use memory_store::MemoryStore;
pub use pool::DbPool;
pub use repository::Repository;
pub use store::{
    ChunkMatch, ChunkRecord, ChunkSource, ConversationStore, Receipt, StoreError, VectorStore,
};

#[cfg(test)]
pub use store::MockConversationStore;
