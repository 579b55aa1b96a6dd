use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::models::{Conversation, Message};

/// Subscription key: one conversation or every conversation of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum Topic {
    Conversation(Uuid),
    Tenant(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum RealtimeEvent {
    #[serde(rename = "conversation:new")]
    ConversationNew { conversation: Conversation },

    #[serde(rename = "conversation:updated")]
    ConversationUpdated {
        conversation_id: Uuid,
        last_message_at: DateTime<Utc>,
        message_count: i64,
    },

    #[serde(rename = "message:new")]
    MessageNew {
        message: Message,
        conversation: Conversation,
    },

    #[serde(rename = "message:sent")]
    MessageSent {
        message_id: Uuid,
        platform_message_id: String,
        sent_at: DateTime<Utc>,
    },

    #[serde(rename = "message:failed")]
    MessageFailed { message_id: Uuid, error: String },

    #[serde(rename = "conversation:read")]
    ConversationRead {
        conversation_id: Uuid,
        user_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "typing:start")]
    TypingStart {
        user_id: String,
        conversation_id: Uuid,
    },

    #[serde(rename = "typing:stop")]
    TypingStop {
        user_id: String,
        conversation_id: Uuid,
    },

    #[serde(rename = "presence:update")]
    PresenceUpdate { user_id: String, status: String },
}

impl RealtimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConversationNew { .. } => "conversation:new",
            Self::ConversationUpdated { .. } => "conversation:updated",
            Self::MessageNew { .. } => "message:new",
            Self::MessageSent { .. } => "message:sent",
            Self::MessageFailed { .. } => "message:failed",
            Self::ConversationRead { .. } => "conversation:read",
            Self::TypingStart { .. } => "typing:start",
            Self::TypingStop { .. } => "typing:stop",
            Self::PresenceUpdate { .. } => "presence:update",
        }
    }
}

/// Fire-and-forget fan-out of realtime events.
#[cfg_attr(test, mockall::automock)]
pub trait Broadcaster: Send + Sync {
    fn publish(&self, topic: Topic, event: RealtimeEvent);
}

/// Publishes to the conversation topic and to its tenant's topic.
pub fn publish_for(broadcaster: &dyn Broadcaster, conversation: &Conversation, event: RealtimeEvent) {
    broadcaster.publish(Topic::Conversation(conversation.id), event.clone());
    broadcaster.publish(Topic::Tenant(conversation.tenant_id), event);
}

/// In-process broadcaster with one channel per topic.
///
/// Channels are created on first subscribe and dropped once the last
/// [`Subscription`] goes away; events for topics nobody watches are discarded.
pub struct EventBus {
    topics: Arc<DashMap<Topic, broadcast::Sender<RealtimeEvent>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let receiver = self
            .topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Subscription {
            topic,
            receiver: Some(receiver),
            topics: self.topics.clone(),
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// Receiver for one topic. Dropping the last one for a topic removes its channel.
pub struct Subscription {
    topic: Topic,
    receiver: Option<broadcast::Receiver<RealtimeEvent>>,
    topics: Arc<DashMap<Topic, broadcast::Sender<RealtimeEvent>>>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub async fn recv(&mut self) -> Result<RealtimeEvent, broadcast::error::RecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => Err(broadcast::error::RecvError::Closed),
        }
    }

    pub fn try_recv(&mut self) -> Result<RealtimeEvent, broadcast::error::TryRecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.try_recv(),
            None => Err(broadcast::error::TryRecvError::Closed),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // the receiver must be gone before the count is checked
        drop(self.receiver.take());
        if self
            .topics
            .remove_if(&self.topic, |_, tx| tx.receiver_count() == 0)
            .is_some()
        {
            trace!(topic = ?self.topic, "Last subscriber gone, topic removed");
        }
    }
}

impl Broadcaster for EventBus {
    fn publish(&self, topic: Topic, event: RealtimeEvent) {
        let name = event.name();
        let Some(tx) = self.topics.get(&topic).map(|tx| tx.clone()) else {
            trace!(?topic, event = name, "No subscribers, event dropped");
            return;
        };

        if tx.send(event).is_err() {
            self.topics.remove_if(&topic, |_, tx| tx.receiver_count() == 0);
            debug!(?topic, event = name, "Last subscriber gone, topic removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_to_topic_subscribers_only() {
        let bus = EventBus::new(16);
        let conversation_id = Uuid::new_v4();
        let mut watching = bus.subscribe(Topic::Conversation(conversation_id));
        let mut other = bus.subscribe(Topic::Conversation(Uuid::new_v4()));

        bus.publish(
            Topic::Conversation(conversation_id),
            RealtimeEvent::MessageFailed {
                message_id: Uuid::nil(),
                error: "boom".into(),
            },
        );

        let event = watching.recv().await.unwrap();
        assert_eq!(event.name(), "message:failed");
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(4);
        bus.publish(
            Topic::Tenant(Uuid::new_v4()),
            RealtimeEvent::PresenceUpdate {
                user_id: "agent-1".into(),
                status: "online".into(),
            },
        );
        assert_eq!(bus.topic_count(), 0);

        let topic = Topic::Tenant(Uuid::new_v4());
        drop(bus.subscribe(topic));
        bus.publish(
            topic,
            RealtimeEvent::PresenceUpdate {
                user_id: "agent-1".into(),
                status: "away".into(),
            },
        );
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn dropped_subscriptions_release_their_topics() {
        let bus = EventBus::new(8);
        for _ in 0..1_000 {
            drop(bus.subscribe(Topic::Conversation(Uuid::new_v4())));
        }
        assert_eq!(bus.topic_count(), 0);

        let topic = Topic::Tenant(Uuid::new_v4());
        let first = bus.subscribe(topic);
        let mut second = bus.subscribe(topic);
        drop(first);
        assert_eq!(bus.topic_count(), 1);

        bus.publish(
            topic,
            RealtimeEvent::PresenceUpdate {
                user_id: "agent-2".into(),
                status: "online".into(),
            },
        );
        assert!(second.try_recv().is_ok());
        drop(second);
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn aborted_forwarder_releases_its_topic() {
        let bus = EventBus::new(8);
        let mut subscription = bus.subscribe(Topic::Conversation(Uuid::new_v4()));
        let task = tokio::spawn(async move {
            let _ = subscription.recv().await;
        });
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn wire_format_uses_event_names_and_camel_case() {
        let id = Uuid::nil();
        let value = serde_json::to_value(RealtimeEvent::TypingStart {
            user_id: "agent-7".into(),
            conversation_id: id,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "event": "typing:start",
                "data": {"userId": "agent-7", "conversationId": id}
            })
        );

        let parsed: RealtimeEvent = serde_json::from_value(json!({
            "event": "presence:update",
            "data": {"userId": "agent-7", "status": "online"}
        }))
        .unwrap();
        assert!(matches!(parsed, RealtimeEvent::PresenceUpdate { .. }));
    }
}
