use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::payload::{classify, parse_envelope, Entry, MessagingEvent};
use super::verification::{verify_subscription, SignatureVerifier};
use super::WebhookError;
use crate::database::{ConversationStore, Receipt};
use crate::models::timestamp_from_millis;
use crate::pipeline::{Pipeline, Submission};
use crate::queue::{IngestJob, Job};
use crate::services::{publish_for, Broadcaster, RealtimeEvent};
use crate::vault::CredentialVault;

/// Per-delivery tally, logged and returned to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub queued: usize,
    pub inline: usize,
    pub receipts: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Verifies, classifies and dispatches inbound platform webhooks.
pub struct WebhookService {
    store: Arc<dyn ConversationStore>,
    vault: CredentialVault,
    pipeline: Pipeline,
    broadcaster: Arc<dyn Broadcaster>,
    verifier: SignatureVerifier,
    platform_object: String,
    fallback_verify_token: Option<String>,
}

impl WebhookService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        vault: CredentialVault,
        pipeline: Pipeline,
        broadcaster: Arc<dyn Broadcaster>,
        app_secret: Option<String>,
        platform_object: String,
        fallback_verify_token: Option<String>,
    ) -> Self {
        Self {
            store,
            vault,
            pipeline,
            broadcaster,
            verifier: SignatureVerifier::new(app_secret),
            platform_object,
            fallback_verify_token,
        }
    }

    pub async fn verify_subscription(
        &self,
        mode: Option<&str>,
        token: Option<&str>,
        challenge: Option<&str>,
    ) -> Result<String, WebhookError> {
        let result = verify_subscription(
            self.store.as_ref(),
            &self.vault,
            self.fallback_verify_token.as_deref(),
            mode,
            token,
            challenge,
        )
        .await;
        match &result {
            Ok(_) => info!("Webhook subscription verified"),
            Err(e) => warn!("Webhook subscription rejected: {}", e),
        }
        result
    }

    /// Handles one POSTed delivery. Failures of single events are logged and
    /// counted; only signature and envelope problems fail the whole call.
    pub async fn handle_event(
        &self,
        body: &[u8],
        sha256_signature: Option<&str>,
        sha1_signature: Option<&str>,
    ) -> Result<EventSummary, WebhookError> {
        self.verifier.verify(body, sha256_signature, sha1_signature)?;
        let entries = parse_envelope(body, &self.platform_object)?;

        let mut summary = EventSummary::default();
        for entry in &entries {
            for raw in &entry.events {
                let Some(event) = classify(raw) else {
                    debug!(page_id = %entry.page_id, "Skipping unrecognised event");
                    summary.skipped += 1;
                    continue;
                };
                self.dispatch(entry, event, &mut summary).await;
            }
        }

        info!(
            entries = entries.len(),
            queued = summary.queued,
            inline = summary.inline,
            receipts = summary.receipts,
            skipped = summary.skipped,
            failed = summary.failed,
            "Webhook processed"
        );
        Ok(summary)
    }

    async fn dispatch(&self, entry: &Entry, event: MessagingEvent, summary: &mut EventSummary) {
        let page_id = entry.page_id.as_str();
        let outcome = match event {
            MessagingEvent::Message {
                sender_id,
                text,
                timestamp,
            }
            | MessagingEvent::Postback {
                sender_id,
                text,
                timestamp,
            } => {
                let job = IngestJob {
                    channel_id: page_id.to_string(),
                    sender_id,
                    text,
                    source_timestamp: source_timestamp(timestamp, entry),
                };
                match self.pipeline.submit(Job::Ingest(job)).await {
                    Ok(Submission::Queued(_)) => {
                        summary.queued += 1;
                        Ok(())
                    }
                    Ok(Submission::Inline) => {
                        summary.inline += 1;
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                }
            }
            MessagingEvent::Delivery {
                sender_id,
                mids,
                watermark,
            } => self
                .apply_receipt(page_id, &sender_id, Receipt::Delivered { mids, watermark })
                .await
                .map(|_| summary.receipts += 1),
            MessagingEvent::Read {
                sender_id,
                watermark,
            } => self
                .apply_receipt(page_id, &sender_id, Receipt::Read { watermark })
                .await
                .map(|_| summary.receipts += 1),
        };

        if let Err(e) = outcome {
            warn!(page_id, error = %e, "Webhook event failed");
            summary.failed += 1;
        }
    }

    async fn apply_receipt(
        &self,
        page_id: &str,
        sender_id: &str,
        receipt: Receipt,
    ) -> Result<(), String> {
        let store = &self.store;
        let channel = store
            .channel_by_page_id(page_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("channel {page_id} is not connected"))?;
        let Some(conversation) = store
            .find_conversation(channel.id, sender_id)
            .await
            .map_err(|e| e.to_string())?
        else {
            debug!(page_id, sender_id, "Receipt for unknown conversation");
            return Ok(());
        };

        let now = Utc::now();
        let touched = store
            .record_receipt(conversation.id, &receipt, now)
            .await
            .map_err(|e| e.to_string())?;
        debug!(conversation_id = %conversation.id, touched = touched.len(), ?receipt, "Receipt applied");

        if let Receipt::Read { watermark } = receipt {
            publish_for(
                self.broadcaster.as_ref(),
                &conversation,
                RealtimeEvent::ConversationRead {
                    conversation_id: conversation.id,
                    user_id: sender_id.to_string(),
                    timestamp: timestamp_from_millis(watermark),
                },
            );
        }
        Ok(())
    }
}

/// Part of the dedupe key, so it must not change when the platform redelivers.
/// Falls back to the entry time; the clock is the last resort.
fn source_timestamp(event_timestamp: Option<i64>, entry: &Entry) -> i64 {
    event_timestamp.or(entry.time).unwrap_or_else(|| {
        warn!(page_id = %entry.page_id, "Event and entry carry no timestamp, using receive time");
        Utc::now().timestamp_millis()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(time: Option<i64>) -> Entry {
        Entry {
            page_id: "pg1".into(),
            time,
            events: Vec::new(),
        }
    }

    #[test]
    fn source_timestamp_prefers_event_then_entry_time() {
        assert_eq!(source_timestamp(Some(10), &entry(Some(20))), 10);
        assert_eq!(source_timestamp(None, &entry(Some(20))), 20);
        assert!(source_timestamp(None, &entry(None)) > 0);
    }
}
