//! Three-stage reply pipeline: ingest, generate reply, deliver.
//!
//! Each stage handler takes one job and returns the follow-up job, if any.
//! Workers enqueue the follow-up before acknowledging, so a crash in between
//! redelivers the job; the handlers are idempotent against that.

mod deliver;
mod ingest;
mod reply;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::database::{ConversationStore, StoreError};
use crate::queue::{DeliverJob, Job, JobQueue, QueueError, QueuedJob, Stage};
use crate::services::{
    publish_for, Broadcaster, PlatformClient, PlatformError, RagError, RagService, RealtimeEvent,
};
use crate::vault::{CredentialVault, VaultError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("channel {0} is not connected")]
    ChannelNotFound(String),

    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("message {0} not found")]
    MessageNotFound(Uuid),

    #[error("tenant {0} has no generation config")]
    MissingGenerationConfig(Uuid),

    #[error("invalid generation config: {0}")]
    InvalidGenerationConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("credential error: {0}")]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Rag(#[from] RagError),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Platform(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Everything the stage handlers need, injected once at startup.
pub struct PipelineDeps {
    pub store: Arc<dyn ConversationStore>,
    pub queue: Arc<dyn JobQueue>,
    pub rag: Arc<RagService>,
    pub platform: Arc<dyn PlatformClient>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub vault: CredentialVault,
    pub config: PipelineConfig,
    /// How long one dequeue call blocks before the worker checks for shutdown.
    pub dequeue_wait: Duration,
}

/// How a submitted job was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued(Uuid),
    /// The queue was unavailable and the job ran to completion in place.
    Inline,
}

#[derive(Clone)]
pub struct Pipeline {
    deps: Arc<PipelineDeps>,
}

/// Running workers; dropping it leaves them running until the runtime stops.
pub struct PipelineHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Signals every worker and waits for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Pipeline worker panicked: {}", e);
            }
        }
        info!("Pipeline workers stopped");
    }
}

impl Pipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.deps.queue
    }

    /// Spawns the configured number of workers per stage. Call once at boot.
    pub fn start(&self) -> PipelineHandle {
        let (shutdown, rx) = watch::channel(false);
        let config = &self.deps.config;
        let mut workers = Vec::new();

        for (stage, count) in [
            (Stage::Ingest, config.ingest_workers),
            (Stage::Reply, config.reply_workers),
            (Stage::Deliver, config.deliver_workers),
        ] {
            for worker_id in 0..count.max(1) {
                let pipeline = self.clone();
                let rx = rx.clone();
                workers.push(tokio::spawn(async move {
                    pipeline.worker_loop(stage, worker_id, rx).await;
                }));
            }
        }

        info!(
            "Pipeline started on {} queue: {} ingest, {} reply, {} deliver workers",
            self.deps.queue.backend(),
            config.ingest_workers.max(1),
            config.reply_workers.max(1),
            config.deliver_workers.max(1)
        );

        PipelineHandle { shutdown, workers }
    }

    /// Enqueues `job`, or runs it and its follow-ups in place when the queue is down.
    pub async fn submit(&self, job: Job) -> Result<Submission, PipelineError> {
        match self.deps.queue.enqueue(job.clone()).await {
            Ok(id) => Ok(Submission::Queued(id)),
            Err(e) => {
                warn!(stage = %job.stage(), error = %e, "Queue unavailable, processing inline");
                self.run_inline(job).await?;
                Ok(Submission::Inline)
            }
        }
    }

    /// Runs `job` and every follow-up synchronously, deliver retries included.
    pub async fn run_inline(&self, job: Job) -> Result<(), PipelineError> {
        let mut next = Some(job);
        while let Some(job) = next.take() {
            next = match &job {
                Job::Deliver(deliver) => self.deliver_with_retries(deliver).await?,
                other => self.handle(other).await?,
            };
        }
        Ok(())
    }

    /// Runs one stage handler.
    pub async fn handle(&self, job: &Job) -> Result<Option<Job>, PipelineError> {
        match job {
            Job::Ingest(job) => ingest::run(&self.deps, job).await,
            Job::Reply(job) => reply::run(&self.deps, job).await,
            Job::Deliver(job) => deliver::run(&self.deps, job).await,
        }
    }

    async fn worker_loop(&self, stage: Stage, worker_id: usize, shutdown: watch::Receiver<bool>) {
        info!("{} worker {} started", stage, worker_id);

        while !*shutdown.borrow() {
            match self.deps.queue.dequeue(stage, self.deps.dequeue_wait).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(stage = %stage, worker_id, error = %e, "Dequeue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("{} worker {} shutting down", stage, worker_id);
    }

    /// Handles one dequeued job and settles it with the queue.
    pub async fn process(&self, job: QueuedJob) {
        debug!(job_id = %job.id, stage = %job.stage(), attempt = job.attempts, "Processing job");

        match self.handle(&job.job).await {
            Ok(follow_up) => {
                if let Some(next) = follow_up {
                    self.forward(next).await;
                }
                if let Err(e) = self.deps.queue.ack(&job).await {
                    warn!(job_id = %job.id, error = %e, "Ack failed, job may be redelivered");
                }
            }
            Err(e) => self.settle_failure(job, e).await,
        }
    }

    async fn forward(&self, next: Job) {
        if let Err(e) = self.deps.queue.enqueue(next.clone()).await {
            warn!(stage = %next.stage(), error = %e, "Enqueue of follow-up failed, running inline");
            if let Err(e) = self.run_inline(next).await {
                error!(error = %e, "Inline follow-up failed");
            }
        }
    }

    async fn settle_failure(&self, job: QueuedJob, err: PipelineError) {
        let stage = job.stage();
        let max_attempts = self.deps.config.deliver_max_attempts;

        if stage == Stage::Deliver && err.is_transient() && job.attempts + 1 < max_attempts {
            let delay = backoff_delay(&self.deps.config, job.attempts);
            warn!(
                job_id = %job.id,
                attempt = job.attempts + 1,
                max_attempts,
                ?delay,
                error = %err,
                "Delivery failed, retrying"
            );
            if let Err(e) = self.deps.queue.retry(&job, delay).await {
                error!(job_id = %job.id, error = %e, "Could not schedule retry");
            }
            return;
        }

        let message = err.to_string();
        error!(job_id = %job.id, stage = %stage, attempts = job.attempts + 1, error = %message, "Job failed");
        if let Err(e) = self.deps.queue.fail(&job, &message).await {
            error!(job_id = %job.id, error = %e, "Could not dead-letter job");
        }
        if let Job::Deliver(deliver) = &job.job {
            self.surface_delivery_failure(deliver, &message).await;
        }
    }

    async fn deliver_with_retries(&self, job: &DeliverJob) -> Result<Option<Job>, PipelineError> {
        let mut attempts = 0;
        loop {
            match deliver::run(&self.deps, job).await {
                Ok(next) => return Ok(next),
                Err(e) if e.is_transient() && attempts + 1 < self.deps.config.deliver_max_attempts => {
                    let delay = backoff_delay(&self.deps.config, attempts);
                    warn!(message_id = %job.message_id, ?delay, error = %e, "Inline delivery failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempts += 1;
                }
                Err(e) => {
                    error!(message_id = %job.message_id, error = %e, "Inline delivery failed");
                    self.surface_delivery_failure(job, &e.to_string()).await;
                    return Err(e);
                }
            }
        }
    }

    async fn surface_delivery_failure(&self, job: &DeliverJob, error: &str) {
        let store = &self.deps.store;
        if let Err(e) = store.record_delivery_failure(job.message_id, error).await {
            warn!(message_id = %job.message_id, error = %e, "Could not record delivery failure");
        }

        let conversation = match store.message(job.message_id).await {
            Ok(Some(message)) => store.conversation(message.conversation_id).await.ok().flatten(),
            _ => None,
        };
        if let Some(conversation) = conversation {
            publish_for(
                self.deps.broadcaster.as_ref(),
                &conversation,
                RealtimeEvent::MessageFailed {
                    message_id: job.message_id,
                    error: error.to_string(),
                },
            );
        }
    }
}

/// `base * 2^attempts`, capped.
pub fn backoff_delay(config: &PipelineConfig, attempts: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempts.min(32));
    let delay = config.deliver_backoff_base_ms.saturating_mul(factor);
    Duration::from_millis(delay.min(config.deliver_backoff_max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let config = PipelineConfig {
            deliver_backoff_base_ms: 1_000,
            deliver_backoff_max_ms: 5_000,
            ..PipelineConfig::default()
        };
        let delays: Vec<u64> = (0..5)
            .map(|a| backoff_delay(&config, a).as_millis() as u64)
            .collect();
        assert_eq!(delays, [1_000, 2_000, 4_000, 5_000, 5_000]);
        assert_eq!(backoff_delay(&config, u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn only_transient_platform_errors_retry() {
        let transient = PipelineError::Platform(PlatformError::Api {
            status: 503,
            message: "unavailable".into(),
        });
        let permanent = PipelineError::Platform(PlatformError::Api {
            status: 400,
            message: "bad recipient".into(),
        });
        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
        assert!(!PipelineError::MissingGenerationConfig(Uuid::nil()).is_transient());
    }
}
