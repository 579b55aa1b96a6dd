use chrono::Utc;
use tracing::{debug, error, info};

use super::{PipelineDeps, PipelineError};
use crate::queue::{DeliverJob, Job};
use crate::services::{publish_for, RealtimeEvent};

/// Sends a stored reply through the platform and records its platform id.
pub(super) async fn run(deps: &PipelineDeps, job: &DeliverJob) -> Result<Option<Job>, PipelineError> {
    let store = &deps.store;
    let message = store
        .message(job.message_id)
        .await?
        .ok_or(PipelineError::MessageNotFound(job.message_id))?;
    if message.is_sent() {
        debug!(message_id = %message.id, "Already delivered");
        return Ok(None);
    }

    let channel = store
        .channel_by_page_id(&job.channel_id)
        .await?
        .ok_or_else(|| PipelineError::ChannelNotFound(job.channel_id.clone()))?;
    let token = deps.vault.decrypt(&channel.access_token)?;

    let platform_message_id = deps
        .platform
        .send_text(&token, &job.recipient_id, &job.text)
        .await?;
    let sent_at = Utc::now();
    // The user already has the reply; a failed write must not mark it FAILED.
    match store
        .record_delivery(message.id, &platform_message_id, sent_at)
        .await
    {
        Ok(()) => {
            info!(message_id = %message.id, platform_message_id = %platform_message_id, "Reply delivered")
        }
        Err(e) => error!(
            message_id = %message.id,
            platform_message_id = %platform_message_id,
            error = %e,
            "Reply delivered but not recorded"
        ),
    }

    if let Some(conversation) = store.conversation(message.conversation_id).await? {
        publish_for(
            deps.broadcaster.as_ref(),
            &conversation,
            RealtimeEvent::MessageSent {
                message_id: message.id,
                platform_message_id,
                sent_at,
            },
        );
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::config::{LlmConfig, MemoryConfig, PipelineConfig, RetrievalConfig};
    use crate::database::{ConversationStore, MemoryStore, MockConversationStore, StoreError};
    use crate::models::{ChannelConnection, NewMessage};
    use crate::queue::InProcessQueue;
    use crate::services::conversation::MemoryManager;
    use crate::services::embedding_service::MockEmbeddingProvider;
    use crate::services::platform::MockPlatformClient;
    use crate::services::{EventBus, LlmGateway, RagService, RealtimeEvent, Topic, VectorRetrievalService};
    use crate::utils::Limiters;
    use crate::vault::CredentialVault;

    fn deps(
        store: MockConversationStore,
        platform: MockPlatformClient,
        events: Arc<EventBus>,
        vault: CredentialVault,
    ) -> PipelineDeps {
        let scratch = Arc::new(MemoryStore::new());
        let limiters = Arc::new(Limiters::default());
        let gateway = Arc::new(LlmGateway::new(LlmConfig::default(), limiters.clone()).unwrap());
        let retrieval = Arc::new(VectorRetrievalService::new(
            Arc::new(MockEmbeddingProvider::new()),
            scratch.clone(),
            scratch.clone(),
            limiters,
        ));
        let memory = Arc::new(MemoryManager::new(
            scratch,
            gateway.clone(),
            MemoryConfig::default(),
        ));
        PipelineDeps {
            store: Arc::new(store),
            queue: Arc::new(InProcessQueue::default()),
            rag: Arc::new(RagService::new(
                retrieval,
                gateway,
                memory,
                RetrievalConfig::default(),
            )),
            platform: Arc::new(platform),
            broadcaster: events,
            vault,
            config: PipelineConfig::default(),
            dequeue_wait: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn sent_reply_is_reported_even_when_recording_fails() {
        let vault = CredentialVault::new(&[5u8; 32]).unwrap();
        let channel = ChannelConnection {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            page_id: "pg1".into(),
            access_token: vault.encrypt("page-token").unwrap(),
            verify_token: None,
            auto_reply_default: true,
        };
        let seed = MemoryStore::new();
        let (conversation, _) = seed
            .find_or_create_conversation(&channel, "psid1")
            .await
            .unwrap();
        let (message, _) = seed
            .insert_message(NewMessage::bot(conversation.id, "We open at 9.", "openai"))
            .await
            .unwrap();

        let mut store = MockConversationStore::new();
        let stored = message.clone();
        store
            .expect_message()
            .returning(move |_| Ok(Some(stored.clone())));
        let connected = channel.clone();
        store
            .expect_channel_by_page_id()
            .returning(move |_| Ok(Some(connected.clone())));
        store
            .expect_record_delivery()
            .times(1)
            .returning(|_, _, _| Err(StoreError::Unavailable("connection reset".into())));
        store.expect_record_delivery_failure().never();
        let thread = conversation.clone();
        store
            .expect_conversation()
            .returning(move |_| Ok(Some(thread.clone())));

        let mut platform = MockPlatformClient::new();
        platform
            .expect_send_text()
            .times(1)
            .returning(|_, _, _| Ok("m_sent".to_string()));

        let events = Arc::new(EventBus::new(8));
        let mut feed = events.subscribe(Topic::Conversation(conversation.id));
        let deps = deps(store, platform, events, vault);

        let job = DeliverJob {
            channel_id: "pg1".into(),
            recipient_id: "psid1".into(),
            text: message.text.clone(),
            message_id: message.id,
        };
        assert!(run(&deps, &job).await.unwrap().is_none());

        match feed.try_recv().unwrap() {
            RealtimeEvent::MessageSent {
                message_id,
                platform_message_id,
                ..
            } => {
                assert_eq!(message_id, message.id);
                assert_eq!(platform_message_id, "m_sent");
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }
}
