use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound text to persist. `channel_id` is the platform page id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestJob {
    pub channel_id: String,
    pub sender_id: String,
    pub text: String,
    /// Platform event time, epoch ms.
    pub source_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyJob {
    pub conversation_id: Uuid,
    pub trigger_message_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverJob {
    pub channel_id: String,
    pub recipient_id: String,
    pub text: String,
    pub message_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Ingest,
    Reply,
    Deliver,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Ingest, Stage::Reply, Stage::Deliver];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Reply => "reply",
            Self::Deliver => "deliver",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ingest" => Ok(Self::Ingest),
            "reply" => Ok(Self::Reply),
            "deliver" => Ok(Self::Deliver),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "payload", rename_all = "lowercase")]
pub enum Job {
    Ingest(IngestJob),
    Reply(ReplyJob),
    Deliver(DeliverJob),
}

impl Job {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Ingest(_) => Stage::Ingest,
            Self::Reply(_) => Stage::Reply,
            Self::Deliver(_) => Stage::Deliver,
        }
    }
}

impl From<IngestJob> for Job {
    fn from(job: IngestJob) -> Self {
        Self::Ingest(job)
    }
}

impl From<ReplyJob> for Job {
    fn from(job: ReplyJob) -> Self {
        Self::Reply(job)
    }
}

impl From<DeliverJob> for Job {
    fn from(job: DeliverJob) -> Self {
        Self::Deliver(job)
    }
}

/// A job as held by a queue backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: Uuid,
    pub job: Job,
    /// Failed attempts so far.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Backend handle used to acknowledge this delivery.
    #[serde(skip)]
    pub receipt: Option<String>,
}

impl QueuedJob {
    pub fn new(job: Job) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            attempts: 0,
            enqueued_at: Utc::now(),
            receipt: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.job.stage()
    }

    /// Copy for the next attempt, without the delivery handle.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempts: self.attempts + 1,
            receipt: None,
            ..self.clone()
        }
    }
}

/// Dead-lettered job and the error that put it there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub job: QueuedJob,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_payloads_use_camel_case() {
        let job = Job::from(IngestJob {
            channel_id: "pg1".into(),
            sender_id: "psid1".into(),
            text: "hi".into(),
            source_timestamp: 1_700_000_000_000,
        });
        assert_eq!(
            serde_json::to_value(&job).unwrap(),
            json!({
                "stage": "ingest",
                "payload": {
                    "channelId": "pg1",
                    "senderId": "psid1",
                    "text": "hi",
                    "sourceTimestamp": 1_700_000_000_000i64
                }
            })
        );
    }

    #[test]
    fn queued_job_survives_the_wire_without_receipt() {
        let mut queued = QueuedJob::new(Job::Reply(ReplyJob {
            conversation_id: Uuid::new_v4(),
            trigger_message_id: Uuid::new_v4(),
        }));
        queued.receipt = Some("raw".into());

        let raw = serde_json::to_string(&queued).unwrap();
        let parsed: QueuedJob = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.stage(), Stage::Reply);
        assert_eq!(parsed.id, queued.id);
        assert!(parsed.receipt.is_none());

        let next = queued.next_attempt();
        assert_eq!(next.attempts, 1);
        assert_eq!(next.id, queued.id);
    }

    #[test]
    fn stage_parses_case_insensitively() {
        assert_eq!("Deliver".parse::<Stage>(), Ok(Stage::Deliver));
        assert!("publish".parse::<Stage>().is_err());
    }
}
