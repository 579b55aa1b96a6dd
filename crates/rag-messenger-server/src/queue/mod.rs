//! Per-stage job queues: a Redis backend and an in-process fallback.

pub mod in_process;
pub mod job;
pub mod redis_queue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{QueueBackend, QueueConfig};

pub use in_process::InProcessQueue;
pub use job::{DeliverJob, FailedJob, IngestJob, Job, QueuedJob, ReplyJob, Stage};
pub use redis_queue::RedisQueue;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("job encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("queue closed")]
    Closed,

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// FIFO queue per stage with at-least-once delivery.
///
/// A dequeued job stays owned by the consumer until it is acked, retried or
/// failed.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError>;

    /// Waits up to `wait` for the next job of `stage`.
    async fn dequeue(&self, stage: Stage, wait: Duration) -> Result<Option<QueuedJob>, QueueError>;

    async fn ack(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Re-queues the job after `delay` with its attempt count bumped.
    async fn retry(&self, job: &QueuedJob, delay: Duration) -> Result<(), QueueError>;

    /// Moves the job to the stage's failed list.
    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<(), QueueError>;

    /// Most recent failures first.
    async fn failed(&self, stage: Stage, limit: usize) -> Result<Vec<FailedJob>, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

/// Opens the configured backend, falling back to in-process when Redis is down.
pub async fn connect(config: &QueueConfig) -> Arc<dyn JobQueue> {
    match config.backend {
        QueueBackend::Memory => {
            info!("Using in-process job queue");
            Arc::new(InProcessQueue::new(config.failed_retention))
        }
        QueueBackend::Redis => match RedisQueue::connect(config).await {
            Ok(queue) => {
                match queue.recover_orphans().await {
                    Ok(0) => {}
                    Ok(n) => warn!("Re-queued {} jobs left in processing by a previous run", n),
                    Err(e) => warn!("Orphan recovery failed: {}", e),
                }
                info!("Using Redis job queue at {}", config.redis_url);
                Arc::new(queue)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Redis unreachable, falling back to in-process job queue"
                );
                Arc::new(InProcessQueue::new(config.failed_retention))
            }
        },
    }
}
