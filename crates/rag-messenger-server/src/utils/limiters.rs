use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::LimitsConfig;

/// Process-wide caps on concurrent embedding and generation calls.
#[derive(Clone)]
pub struct Limiters {
    pub embedding: Arc<Semaphore>,
    pub llm_generate: Arc<Semaphore>,
    pub acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(cfg: &LimitsConfig) -> Self {
        Self {
            embedding: Arc::new(Semaphore::new(cfg.embedding_concurrency.max(1))),
            llm_generate: Arc::new(Semaphore::new(cfg.llm_generate_concurrency.max(1))),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms.max(1)),
        }
    }

    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration)> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| anyhow::anyhow!("Limiter acquire timeout for op={}", op))??;

        Ok((permit, start.elapsed()))
    }
}

impl Default for Limiters {
    fn default() -> Self {
        Self::new(&LimitsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let limiters = Limiters::new(&LimitsConfig {
            embedding_concurrency: 1,
            llm_generate_concurrency: 1,
            acquire_timeout_ms: 20,
        });

        let (_held, _) = Limiters::acquire_timed(
            limiters.embedding.clone(),
            limiters.acquire_timeout,
            "embedding",
        )
        .await
        .unwrap();

        let second =
            Limiters::acquire_timed(limiters.embedding.clone(), limiters.acquire_timeout, "embedding")
                .await;
        assert!(second.is_err());
    }
}
