use serde::Deserialize;
use serde_json::Value;

use super::WebhookError;

/// One `entry` of a webhook delivery: the page it belongs to and its raw events.
#[derive(Debug, Clone)]
pub struct Entry {
    pub page_id: String,
    /// Entry `time` (epoch ms), stable across redeliveries of the same payload.
    pub time: Option<i64>,
    pub events: Vec<Value>,
}

/// Inbound platform event, classified by shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagingEvent {
    Message {
        sender_id: String,
        text: String,
        timestamp: Option<i64>,
    },
    Delivery {
        sender_id: String,
        mids: Vec<String>,
        watermark: i64,
    },
    Read {
        sender_id: String,
        watermark: i64,
    },
    Postback {
        sender_id: String,
        text: String,
        timestamp: Option<i64>,
    },
}

#[derive(Debug, Deserialize)]
struct Party {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    sender: Option<Party>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    delivery: Option<RawDelivery>,
    #[serde(default)]
    read: Option<RawRead>,
    #[serde(default)]
    postback: Option<RawPostback>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    is_echo: bool,
}

#[derive(Debug, Deserialize)]
struct RawDelivery {
    #[serde(default)]
    mids: Vec<String>,
    #[serde(default)]
    watermark: i64,
}

#[derive(Debug, Deserialize)]
struct RawRead {
    #[serde(default)]
    watermark: i64,
}

#[derive(Debug, Deserialize)]
struct RawPostback {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

/// Checks the envelope and splits it into entries.
///
/// `object` must equal `expected_object` and `entry` must be an array.
/// Entries without an id are dropped; events are left raw for per-event
/// classification.
pub fn parse_envelope(body: &[u8], expected_object: &str) -> Result<Vec<Entry>, WebhookError> {
    let envelope: Value = serde_json::from_slice(body)
        .map_err(|e| WebhookError::Malformed(format!("invalid JSON: {e}")))?;

    let object = envelope.get("object").and_then(Value::as_str);
    if object != Some(expected_object) {
        return Err(WebhookError::Malformed(format!(
            "unexpected object {:?}",
            object.unwrap_or("<missing>")
        )));
    }

    let entries = envelope
        .get("entry")
        .and_then(Value::as_array)
        .ok_or_else(|| WebhookError::Malformed("entry must be an array".into()))?;

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let page_id = match entry.get("id")? {
                Value::String(id) => id.clone(),
                Value::Number(id) => id.to_string(),
                _ => return None,
            };
            let time = entry.get("time").and_then(Value::as_i64);
            let events = entry
                .get("messaging")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Some(Entry {
                page_id,
                time,
                events,
            })
        })
        .collect())
}

/// `None` for echoes, attachments-only messages and unknown shapes.
pub fn classify(event: &Value) -> Option<MessagingEvent> {
    let raw: RawEvent = serde_json::from_value(event.clone()).ok()?;
    let sender_id = raw.sender?.id;

    if let Some(message) = raw.message {
        return match message.text {
            Some(text) if !message.is_echo && !text.trim().is_empty() => {
                Some(MessagingEvent::Message {
                    sender_id,
                    text,
                    timestamp: raw.timestamp,
                })
            }
            _ => None,
        };
    }

    if let Some(delivery) = raw.delivery {
        return Some(MessagingEvent::Delivery {
            sender_id,
            mids: delivery.mids,
            watermark: delivery.watermark,
        });
    }

    if let Some(read) = raw.read {
        return Some(MessagingEvent::Read {
            sender_id,
            watermark: read.watermark,
        });
    }

    if let Some(postback) = raw.postback {
        let text = postback
            .title
            .filter(|t| !t.trim().is_empty())
            .or(postback.payload)
            .filter(|t| !t.trim().is_empty())?;
        return Some(MessagingEvent::Postback {
            sender_id,
            text,
            timestamp: raw.timestamp,
        });
    }

    None
}
