use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::{ChunkMatch, ChunkRecord, ChunkSource, StoreError, VectorStore};
use crate::services::embedding_service::EmbeddingProvider;
use crate::utils::{cosine_similarity, Limiters};

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("vector search unavailable: {0}")]
    Search(#[from] StoreError),
}

/// Embeds text and searches tenant chunks by cosine similarity.
///
/// The remote store is tried first; on failure the tenant's chunk rows are
/// scanned locally with the same filtering and ordering.
pub struct VectorRetrievalService {
    embedder: Arc<dyn EmbeddingProvider>,
    remote: Arc<dyn VectorStore>,
    local: Arc<dyn ChunkSource>,
    limiters: Arc<Limiters>,
}

impl VectorRetrievalService {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        remote: Arc<dyn VectorStore>,
        local: Arc<dyn ChunkSource>,
        limiters: Arc<Limiters>,
    ) -> Self {
        Self {
            embedder,
            remote,
            local,
            limiters,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let (_permit, waited) = Limiters::acquire_timed(
            self.limiters.embedding.clone(),
            self.limiters.acquire_timeout,
            "embedding",
        )
        .await
        .map_err(|e| RetrievalError::Embedding(e.to_string()))?;
        debug!(waited_ms = waited.as_millis() as u64, "Embedding permit acquired");

        self.embedder
            .embed(text)
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))
    }

    pub async fn search(
        &self,
        query_embedding: &[f32],
        tenant_id: Uuid,
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<ChunkMatch>, RetrievalError> {
        match self
            .remote
            .match_chunks(query_embedding, tenant_id, min_similarity, top_k)
            .await
        {
            Ok(matches) => Ok(rank(matches, top_k, min_similarity)),
            Err(e) => {
                warn!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Vector store search failed, falling back to local scan"
                );
                let chunks = self.local.tenant_chunks(tenant_id).await?;
                Ok(local_scan(query_embedding, &chunks, top_k, min_similarity))
            }
        }
    }
}

/// Drop matches under `min_similarity`, sort descending, keep `top_k`.
pub fn rank(mut matches: Vec<ChunkMatch>, top_k: usize, min_similarity: f32) -> Vec<ChunkMatch> {
    matches.retain(|m| m.similarity >= min_similarity);
    matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    matches.truncate(top_k);
    matches
}

/// Brute-force cosine scan over chunk rows.
pub fn local_scan(
    query_embedding: &[f32],
    chunks: &[ChunkRecord],
    top_k: usize,
    min_similarity: f32,
) -> Vec<ChunkMatch> {
    let matches = chunks
        .iter()
        .filter_map(|chunk| match cosine_similarity(query_embedding, &chunk.embedding) {
            Ok(similarity) => Some(ChunkMatch {
                id: chunk.id,
                content: chunk.content.clone(),
                metadata: chunk.metadata.clone(),
                similarity,
            }),
            Err(e) => {
                debug!(chunk_id = %chunk.id, "Skipping chunk: {}", e);
                None
            }
        })
        .collect();

    rank(matches, top_k, min_similarity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryStore;
    use crate::services::embedding_service::MockEmbeddingProvider;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingStore;

    #[async_trait]
    impl VectorStore for FailingStore {
        async fn match_chunks(
            &self,
            _query_embedding: &[f32],
            _tenant_id: Uuid,
            _match_threshold: f32,
            _match_count: usize,
        ) -> Result<Vec<ChunkMatch>, StoreError> {
            Err(StoreError::Unavailable("rpc down".into()))
        }
    }

    struct FixedStore(Vec<ChunkMatch>);

    #[async_trait]
    impl VectorStore for FixedStore {
        async fn match_chunks(
            &self,
            _query_embedding: &[f32],
            _tenant_id: Uuid,
            _match_threshold: f32,
            _match_count: usize,
        ) -> Result<Vec<ChunkMatch>, StoreError> {
            Ok(self.0.clone())
        }
    }

    fn chunk_match(similarity: f32) -> ChunkMatch {
        ChunkMatch {
            id: Uuid::new_v4(),
            content: format!("chunk {similarity}"),
            metadata: json!({}),
            similarity,
        }
    }

    fn chunk(tenant_id: Uuid, embedding: Vec<f32>, content: &str) -> ChunkRecord {
        ChunkRecord {
            id: Uuid::new_v4(),
            tenant_id,
            content: content.into(),
            embedding,
            metadata: json!({"source": "faq.pdf", "chunkIndex": 0}),
        }
    }

    fn service(remote: Arc<dyn VectorStore>, local: Arc<dyn ChunkSource>) -> VectorRetrievalService {
        VectorRetrievalService::new(
            Arc::new(MockEmbeddingProvider::new()),
            remote,
            local,
            Arc::new(Limiters::default()),
        )
    }

    #[test]
    fn rank_filters_and_orders() {
        let ranked = rank(
            vec![chunk_match(0.8), chunk_match(0.5), chunk_match(0.95), chunk_match(0.76)],
            2,
            0.75,
        );
        let scores: Vec<f32> = ranked.iter().map(|m| m.similarity).collect();
        assert_eq!(scores, vec![0.95, 0.8]);
    }

    #[tokio::test]
    async fn below_threshold_remote_match_is_dropped() {
        let svc = service(
            Arc::new(FixedStore(vec![chunk_match(0.60)])),
            Arc::new(MemoryStore::new()),
        );
        let results = svc
            .search(&[0.1, 0.2, 0.3], Uuid::new_v4(), 5, 0.75)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_local_scan() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        store.add_chunk(chunk(tenant, vec![1.0, 0.0], "exact"));
        store.add_chunk(chunk(tenant, vec![0.6, 0.8], "weak"));
        store.add_chunk(chunk(Uuid::new_v4(), vec![1.0, 0.0], "other tenant"));
        store.add_chunk(chunk(tenant, vec![1.0, 0.0, 0.0], "wrong dimension"));

        let svc = service(Arc::new(FailingStore), store);
        let results = svc.search(&[1.0, 0.0], tenant, 5, 0.75).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "exact");
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn embed_errors_are_wrapped() {
        let mut embedder = MockEmbeddingProvider::new();
        embedder
            .expect_embed()
            .returning(|_| Err(anyhow::anyhow!("connection refused")));
        let svc = VectorRetrievalService::new(
            Arc::new(embedder),
            Arc::new(FailingStore),
            Arc::new(MemoryStore::new()),
            Arc::new(Limiters::default()),
        );
        assert!(matches!(
            svc.embed("hi").await,
            Err(RetrievalError::Embedding(_))
        ));
    }
}
