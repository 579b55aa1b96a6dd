//! WebSocket feed of realtime events for dashboard sessions.
//!
//! Clients subscribe with `?tenantId=` and/or `?conversationId=` and receive
//! `{"event": ..., "data": ...}` frames. Typing, presence and read frames sent
//! by the client are re-broadcast to the matching topics.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::{Broadcaster, RealtimeEvent, Subscription, Topic};
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeQuery {
    pub tenant_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
}

impl SubscribeQuery {
    fn topics(&self) -> Vec<Topic> {
        self.tenant_id
            .map(Topic::Tenant)
            .into_iter()
            .chain(self.conversation_id.map(Topic::Conversation))
            .collect()
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
) -> Result<Response, ApiError> {
    let topics = query.topics();
    if topics.is_empty() {
        return Err(ApiError::BadRequest(
            "tenantId or conversationId is required".to_string(),
        ));
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, topics)))
}

async fn handle_socket(socket: WebSocket, state: AppState, topics: Vec<Topic>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let forwarders: Vec<_> = topics
        .iter()
        .map(|topic| {
            let subscription = state.events.subscribe(*topic);
            tokio::spawn(forward(subscription, tx.clone()))
        })
        .collect();
    drop(tx);

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => {
                let text_str: &str = &text;
                match serde_json::from_str::<RealtimeEvent>(text_str) {
                    Ok(event) => rebroadcast(&state, &topics, event),
                    Err(e) => warn!("Invalid realtime frame: {}", e),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // aborted forwarders drop their subscriptions, which releases idle topics
    for forwarder in forwarders {
        forwarder.abort();
        let _ = forwarder.await;
    }
    sender_task.abort();
    debug!(?topics, "Realtime session closed");
}

async fn forward(mut subscription: Subscription, tx: mpsc::Sender<String>) {
    let topic = subscription.topic();
    loop {
        match subscription.recv().await {
            Ok(event) => {
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Failed to encode {} event: {}", event.name(), e);
                        continue;
                    }
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(?topic, skipped, "Realtime subscriber lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Client frames the dashboard may publish; everything else is ignored.
fn rebroadcast(state: &AppState, topics: &[Topic], event: RealtimeEvent) {
    match &event {
        RealtimeEvent::TypingStart { conversation_id, .. }
        | RealtimeEvent::TypingStop { conversation_id, .. }
        | RealtimeEvent::ConversationRead { conversation_id, .. } => {
            state.events.publish(Topic::Conversation(*conversation_id), event);
        }
        RealtimeEvent::PresenceUpdate { .. } => {
            for topic in topics.iter().filter(|t| matches!(t, Topic::Tenant(_))) {
                state.events.publish(*topic, event.clone());
            }
        }
        other => debug!("Ignoring client-sent {} event", other.name()),
    }
}
