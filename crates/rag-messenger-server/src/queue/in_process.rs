use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flume::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

use super::{FailedJob, Job, JobQueue, QueueError, QueuedJob, Stage};

struct Lane {
    tx: Sender<QueuedJob>,
    rx: Receiver<QueuedJob>,
    failed: Mutex<VecDeque<FailedJob>>,
}

impl Lane {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            failed: Mutex::new(VecDeque::new()),
        }
    }
}

/// Process-local queue on flume channels.
///
/// Nothing survives a restart; jobs in flight when the process dies are lost.
pub struct InProcessQueue {
    lanes: [Lane; 3],
    failed_retention: usize,
}

impl InProcessQueue {
    pub fn new(failed_retention: usize) -> Self {
        Self {
            lanes: [Lane::new(), Lane::new(), Lane::new()],
            failed_retention: failed_retention.max(1),
        }
    }

    fn lane(&self, stage: Stage) -> &Lane {
        match stage {
            Stage::Ingest => &self.lanes[0],
            Stage::Reply => &self.lanes[1],
            Stage::Deliver => &self.lanes[2],
        }
    }

    /// Jobs waiting in `stage`, delayed retries excluded.
    pub fn pending(&self, stage: Stage) -> usize {
        self.lane(stage).rx.len()
    }
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait]
impl JobQueue for InProcessQueue {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError> {
        let queued = QueuedJob::new(job);
        let id = queued.id;
        self.lane(queued.stage())
            .tx
            .send_async(queued)
            .await
            .map_err(|_| QueueError::Closed)?;
        Ok(id)
    }

    async fn dequeue(&self, stage: Stage, wait: Duration) -> Result<Option<QueuedJob>, QueueError> {
        match tokio::time::timeout(wait, self.lane(stage).rx.recv_async()).await {
            Ok(Ok(job)) => Ok(Some(job)),
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => Ok(None),
        }
    }

    async fn ack(&self, _job: &QueuedJob) -> Result<(), QueueError> {
        Ok(())
    }

    async fn retry(&self, job: &QueuedJob, delay: Duration) -> Result<(), QueueError> {
        let next = job.next_attempt();
        let tx = self.lane(next.stage()).tx.clone();
        debug!(job_id = %next.id, attempt = next.attempts, ?delay, "Scheduling retry");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tx.send_async(next).await {
                error!("Failed to re-queue job after delay: {}", e);
            }
        });
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<(), QueueError> {
        let mut failed = self.lane(job.stage()).failed.lock();
        failed.push_front(FailedJob {
            job: QueuedJob {
                receipt: None,
                ..job.clone()
            },
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        failed.truncate(self.failed_retention);
        Ok(())
    }

    async fn failed(&self, stage: Stage, limit: usize) -> Result<Vec<FailedJob>, QueueError> {
        Ok(self
            .lane(stage)
            .failed
            .lock()
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DeliverJob, ReplyJob};

    fn reply(n: u128) -> Job {
        Job::Reply(ReplyJob {
            conversation_id: Uuid::from_u128(n),
            trigger_message_id: Uuid::from_u128(n),
        })
    }

    fn deliver() -> Job {
        Job::Deliver(DeliverJob {
            channel_id: "pg1".into(),
            recipient_id: "psid1".into(),
            text: "hello".into(),
            message_id: Uuid::new_v4(),
        })
    }

    #[tokio::test]
    async fn stages_are_independent_fifo_lanes() {
        let queue = InProcessQueue::default();
        queue.enqueue(reply(1)).await.unwrap();
        queue.enqueue(deliver()).await.unwrap();
        queue.enqueue(reply(2)).await.unwrap();

        let wait = Duration::from_millis(10);
        let first = queue.dequeue(Stage::Reply, wait).await.unwrap().unwrap();
        let second = queue.dequeue(Stage::Reply, wait).await.unwrap().unwrap();
        assert_eq!(first.job, reply(1));
        assert_eq!(second.job, reply(2));
        assert!(queue.dequeue(Stage::Reply, wait).await.unwrap().is_none());
        assert_eq!(queue.pending(Stage::Deliver), 1);
        assert_eq!(queue.pending(Stage::Ingest), 0);
    }

    #[tokio::test]
    async fn retry_redelivers_after_delay_with_attempt_bumped() {
        let queue = InProcessQueue::default();
        queue.enqueue(deliver()).await.unwrap();
        let job = queue
            .dequeue(Stage::Deliver, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        queue.retry(&job, Duration::from_millis(30)).await.unwrap();
        assert!(queue
            .dequeue(Stage::Deliver, Duration::from_millis(5))
            .await
            .unwrap()
            .is_none());

        let again = queue
            .dequeue(Stage::Deliver, Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn failed_list_is_newest_first_and_bounded() {
        let queue = InProcessQueue::new(2);
        for n in 0..3 {
            let job = QueuedJob::new(reply(n));
            queue.fail(&job, &format!("error {n}")).await.unwrap();
        }

        let failed = queue.failed(Stage::Reply, 10).await.unwrap();
        let errors: Vec<_> = failed.iter().map(|f| f.error.as_str()).collect();
        assert_eq!(errors, ["error 2", "error 1"]);
        assert!(queue.failed(Stage::Deliver, 10).await.unwrap().is_empty());
    }
}
