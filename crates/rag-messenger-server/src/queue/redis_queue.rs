use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{FailedJob, Job, JobQueue, QueueError, QueuedJob, Stage};
use crate::config::QueueConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const PROMOTE_BATCH: isize = 100;

/// Key names for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageKeys {
    pub pending: String,
    pub processing: String,
    pub delayed: String,
    pub failed: String,
}

impl StageKeys {
    pub fn new(prefix: &str, stage: Stage) -> Self {
        let base = format!("{}:{}", prefix, stage.as_str());
        Self {
            pending: format!("{base}:pending"),
            processing: format!("{base}:processing"),
            delayed: format!("{base}:delayed"),
            failed: format!("{base}:failed"),
        }
    }
}

/// Redis lists per stage.
///
/// `LPUSH` onto `pending`, claim with `RPOPLPUSH` into `processing`, ack with
/// `LREM`. Retries wait in the `delayed` sorted set (score = due epoch ms)
/// until a consumer promotes them back to `pending`.
pub struct RedisQueue {
    conn: ConnectionManager,
    prefix: String,
    poll_interval: Duration,
    failed_retention: usize,
}

impl RedisQueue {
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| QueueError::Unavailable("connect timed out".into()))??;

        let queue = Self {
            conn,
            prefix: config.key_prefix.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            failed_retention: config.failed_retention.max(1),
        };
        queue.ping().await?;
        Ok(queue)
    }

    fn keys(&self, stage: Stage) -> StageKeys {
        StageKeys::new(&self.prefix, stage)
    }

    /// Moves everything left in `processing` back to `pending`.
    ///
    /// Only safe while no other process consumes the same keys.
    pub async fn recover_orphans(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        for stage in Stage::ALL {
            let keys = self.keys(stage);
            loop {
                let moved: Option<String> = redis::cmd("RPOPLPUSH")
                    .arg(&keys.processing)
                    .arg(&keys.pending)
                    .query_async(&mut conn)
                    .await?;
                if moved.is_none() {
                    break;
                }
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn promote_due(&self, keys: &StageKeys) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&keys.delayed)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await?;

        for raw in due {
            // ZREM decides which consumer owns the promotion.
            let removed: i64 = redis::cmd("ZREM")
                .arg(&keys.delayed)
                .arg(&raw)
                .query_async(&mut conn)
                .await?;
            if removed == 1 {
                redis::cmd("LPUSH")
                    .arg(&keys.pending)
                    .arg(&raw)
                    .query_async::<()>(&mut conn)
                    .await?;
            }
        }
        Ok(())
    }

    async fn claim(&self, keys: &StageKeys) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(&keys.pending)
            .arg(&keys.processing)
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<QueuedJob>(&raw) {
            Ok(mut job) => {
                job.receipt = Some(raw);
                Ok(Some(job))
            }
            Err(e) => {
                error!(key = %keys.processing, "Dropping undecodable job: {}", e);
                redis::pipe()
                    .atomic()
                    .cmd("LREM")
                    .arg(&keys.processing)
                    .arg(1)
                    .arg(&raw)
                    .ignore()
                    .cmd("LPUSH")
                    .arg(&keys.failed)
                    .arg(&raw)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await?;
                Ok(None)
            }
        }
    }

    fn receipt(job: &QueuedJob) -> Result<String, QueueError> {
        match &job.receipt {
            Some(raw) => Ok(raw.clone()),
            None => Ok(serde_json::to_string(job)?),
        }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError> {
        let queued = QueuedJob::new(job);
        let raw = serde_json::to_string(&queued)?;
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(self.keys(queued.stage()).pending)
            .arg(raw)
            .query_async::<()>(&mut conn)
            .await?;
        debug!(job_id = %queued.id, stage = %queued.stage(), "Job enqueued");
        Ok(queued.id)
    }

    async fn dequeue(&self, stage: Stage, wait: Duration) -> Result<Option<QueuedJob>, QueueError> {
        let keys = self.keys(stage);
        let deadline = Instant::now() + wait;

        loop {
            if let Err(e) = self.promote_due(&keys).await {
                warn!(stage = %stage, "Failed to promote delayed jobs: {}", e);
            }
            if let Some(job) = self.claim(&keys).await? {
                return Ok(Some(job));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("LREM")
            .arg(self.keys(job.stage()).processing)
            .arg(1)
            .arg(Self::receipt(job)?)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry(&self, job: &QueuedJob, delay: Duration) -> Result<(), QueueError> {
        let keys = self.keys(job.stage());
        let next = serde_json::to_string(&job.next_attempt())?;
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&keys.delayed)
            .arg(due)
            .arg(next)
            .ignore()
            .cmd("LREM")
            .arg(&keys.processing)
            .arg(1)
            .arg(Self::receipt(job)?)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<(), QueueError> {
        let keys = self.keys(job.stage());
        let entry = serde_json::to_string(&FailedJob {
            job: QueuedJob {
                receipt: None,
                ..job.clone()
            },
            error: error.to_string(),
            failed_at: Utc::now(),
        })?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(&keys.failed)
            .arg(entry)
            .ignore()
            .cmd("LTRIM")
            .arg(&keys.failed)
            .arg(0)
            .arg(self.failed_retention as isize - 1)
            .ignore()
            .cmd("LREM")
            .arg(&keys.processing)
            .arg(1)
            .arg(Self::receipt(job)?)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn failed(&self, stage: Stage, limit: usize) -> Result<Vec<FailedJob>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys(stage).failed)
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str::<FailedJob>(entry) {
                Ok(failed) => Some(failed),
                Err(e) => {
                    debug!("Skipping undecodable failed entry: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_per_stage() {
        let keys = StageKeys::new("rag-messenger", Stage::Deliver);
        assert_eq!(keys.pending, "rag-messenger:deliver:pending");
        assert_eq!(keys.processing, "rag-messenger:deliver:processing");
        assert_eq!(keys.delayed, "rag-messenger:deliver:delayed");
        assert_eq!(keys.failed, "rag-messenger:deliver:failed");
        assert_ne!(StageKeys::new("rag-messenger", Stage::Ingest), keys);
    }

    #[tokio::test]
    async fn connect_to_unreachable_redis_fails_fast() {
        let config = QueueConfig {
            redis_url: "redis://127.0.0.1:1".into(),
            ..QueueConfig::default()
        };
        let started = std::time::Instant::now();
        assert!(RedisQueue::connect(&config).await.is_err());
        assert!(started.elapsed() < CONNECT_TIMEOUT + Duration::from_secs(1));
    }
}
