use chrono::Utc;
use tracing::{debug, info};

use super::{PipelineDeps, PipelineError};
use crate::models::{Conversation, Message, NewMessage, TenantGenerationConfig};
use crate::queue::{DeliverJob, Job, ReplyJob};
use crate::services::llm::{GenerationConfig, Provider};
use crate::services::{publish_for, RealtimeEvent};
use crate::vault::CredentialVault;

const BOT_USER_ID: &str = "bot";

/// Generates, stores and hands off the reply to one USER message.
pub(super) async fn run(deps: &PipelineDeps, job: &ReplyJob) -> Result<Option<Job>, PipelineError> {
    let store = &deps.store;
    let conversation = store
        .conversation(job.conversation_id)
        .await?
        .ok_or(PipelineError::ConversationNotFound(job.conversation_id))?;
    let trigger = store
        .message(job.trigger_message_id)
        .await?
        .ok_or(PipelineError::MessageNotFound(job.trigger_message_id))?;

    if let Some(existing) = store.bot_reply_for(trigger.id).await? {
        if existing.is_sent() {
            info!(trigger_id = %trigger.id, "Trigger already answered and delivered");
            return Ok(None);
        }
        info!(trigger_id = %trigger.id, reply_id = %existing.id, "Resuming delivery of stored reply");
        return deliver_job(deps, &conversation, &existing).await.map(Some);
    }

    let tenant_config = store
        .generation_config(conversation.tenant_id)
        .await?
        .ok_or(PipelineError::MissingGenerationConfig(conversation.tenant_id))?;
    let generation = generation_config(&deps.vault, tenant_config)?;

    typing(deps, &conversation, true);
    let reply = deps
        .rag
        .generate_reply(&conversation, &trigger, generation)
        .await;
    typing(deps, &conversation, false);
    let reply = reply?;

    let since = Utc::now()
        - chrono::Duration::seconds(deps.config.bot_duplicate_window_secs as i64);
    if let Some(duplicate) = store
        .recent_bot_message_with_text(conversation.id, &reply.text, since)
        .await?
    {
        info!(
            conversation_id = %conversation.id,
            duplicate_id = %duplicate.id,
            "Identical reply stored moments ago, skipping"
        );
        return Ok(None);
    }

    let mut new_message = NewMessage::bot(conversation.id, reply.text, reply.provider.as_str());
    new_message.metadata.trigger_message_id = Some(trigger.id);
    new_message.metadata.usage = reply.usage;
    let (message, _) = store.insert_message(new_message).await?;
    debug!(
        message_id = %message.id,
        sources = reply.sources.len(),
        "Reply stored"
    );

    publish_for(
        deps.broadcaster.as_ref(),
        &conversation,
        RealtimeEvent::MessageNew {
            message: message.clone(),
            conversation: conversation.clone(),
        },
    );

    deliver_job(deps, &conversation, &message).await.map(Some)
}

async fn deliver_job(
    deps: &PipelineDeps,
    conversation: &Conversation,
    message: &Message,
) -> Result<Job, PipelineError> {
    let channel = deps
        .store
        .channel(conversation.channel_id)
        .await?
        .ok_or_else(|| PipelineError::ChannelNotFound(conversation.channel_id.to_string()))?;

    Ok(Job::Deliver(DeliverJob {
        channel_id: channel.page_id,
        recipient_id: conversation.sender_id.clone(),
        text: message.text.clone(),
        message_id: message.id,
    }))
}

fn generation_config(
    vault: &CredentialVault,
    stored: TenantGenerationConfig,
) -> Result<GenerationConfig, PipelineError> {
    let provider: Provider = stored
        .provider
        .parse()
        .map_err(PipelineError::InvalidGenerationConfig)?;

    Ok(GenerationConfig {
        provider,
        api_key: vault.decrypt(&stored.api_key)?,
        model: stored.model,
        temperature: stored.temperature,
        max_tokens: stored.max_tokens,
        system_prompt: stored.system_prompt,
    })
}

fn typing(deps: &PipelineDeps, conversation: &Conversation, started: bool) {
    let user_id = BOT_USER_ID.to_string();
    let event = if started {
        RealtimeEvent::TypingStart {
            user_id,
            conversation_id: conversation.id,
        }
    } else {
        RealtimeEvent::TypingStop {
            user_id,
            conversation_id: conversation.id,
        }
    };
    publish_for(deps.broadcaster.as_ref(), conversation, event);
}
