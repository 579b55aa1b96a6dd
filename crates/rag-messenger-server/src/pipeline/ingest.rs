use tracing::{debug, info, warn};

use super::{PipelineDeps, PipelineError};
use crate::models::{timestamp_from_millis, ChannelConnection, Conversation, NewMessage};
use crate::queue::{IngestJob, Job, ReplyJob};
use crate::services::{publish_for, RealtimeEvent};

/// Persists an inbound message and claims it for an auto-reply.
pub(super) async fn run(deps: &PipelineDeps, job: &IngestJob) -> Result<Option<Job>, PipelineError> {
    let store = &deps.store;
    let channel = store
        .channel_by_page_id(&job.channel_id)
        .await?
        .ok_or_else(|| PipelineError::ChannelNotFound(job.channel_id.clone()))?;

    let (mut conversation, created) = store
        .find_or_create_conversation(&channel, &job.sender_id)
        .await?;
    if created {
        info!(
            conversation_id = %conversation.id,
            channel = %channel.page_id,
            "New conversation"
        );
        load_profile(deps, &channel, &mut conversation).await;
        publish_for(
            deps.broadcaster.as_ref(),
            &conversation,
            RealtimeEvent::ConversationNew {
                conversation: conversation.clone(),
            },
        );
    }

    let (message, inserted) = store
        .insert_message(NewMessage::user(
            conversation.id,
            job.text.clone(),
            job.source_timestamp,
        ))
        .await?;
    if !inserted {
        debug!(message_id = %message.id, "Duplicate inbound message, reusing stored record");
    }

    let activity = store
        .touch_conversation(conversation.id, timestamp_from_millis(job.source_timestamp))
        .await?;
    conversation.last_message_at = Some(activity.last_message_at);

    if inserted {
        publish_for(
            deps.broadcaster.as_ref(),
            &conversation,
            RealtimeEvent::MessageNew {
                message: message.clone(),
                conversation: conversation.clone(),
            },
        );
    }
    publish_for(
        deps.broadcaster.as_ref(),
        &conversation,
        RealtimeEvent::ConversationUpdated {
            conversation_id: conversation.id,
            last_message_at: activity.last_message_at,
            message_count: activity.message_count,
        },
    );

    if !conversation.auto_reply {
        return Ok(None);
    }
    if !store.claim_reply(message.id).await? {
        debug!(message_id = %message.id, "Reply already enqueued");
        return Ok(None);
    }

    Ok(Some(Job::Reply(ReplyJob {
        conversation_id: conversation.id,
        trigger_message_id: message.id,
    })))
}

/// Best-effort profile lookup for a brand new conversation.
async fn load_profile(deps: &PipelineDeps, channel: &ChannelConnection, conversation: &mut Conversation) {
    let token = match deps.vault.decrypt(&channel.access_token) {
        Ok(token) => token,
        Err(e) => {
            warn!(channel = %channel.page_id, error = %e, "Cannot decrypt page token for profile lookup");
            return;
        }
    };

    match deps.platform.fetch_profile(&token, &conversation.sender_id).await {
        Ok(profile) => {
            if let Err(e) = deps
                .store
                .update_customer_profile(conversation.id, &profile)
                .await
            {
                warn!(conversation_id = %conversation.id, error = %e, "Failed to store customer profile");
            }
            conversation.customer = profile;
        }
        Err(e) => {
            warn!(conversation_id = %conversation.id, error = %e, "Profile lookup failed");
        }
    }
}
