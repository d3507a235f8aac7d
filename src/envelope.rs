//! Wire messages.
//!
//! - `JobEnvelope`: `{"job": "<name>", "payload": <any>}` on work queues
//! - `BridgeEvent`: `{"type": "join"|"leave"|"message", ...}` on the bridge exchange
//! - `ClientFrame`: what connected clients receive

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a JSON object")]
    NotAnObject,

    #[error("Missing or non-string field \"{0}\"")]
    MissingField(&'static str),

    #[error("Unrecognized message shape: {0}")]
    UnknownShape(Value),
}

/// Unit of work on a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job: String,
    #[serde(default)]
    pub payload: Value,
}

impl JobEnvelope {
    pub fn new(job: impl Into<String>, payload: Value) -> Self {
        Self {
            job: job.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(body)?;
        let mut object = match value {
            Value::Object(object) => object,
            _ => return Err(DecodeError::NotAnObject),
        };

        let job = match object.remove("job") {
            Some(Value::String(job)) => job,
            _ => return Err(DecodeError::MissingField("job")),
        };
        let payload = object.remove("payload").unwrap_or(Value::Null);

        Ok(Self { job, payload })
    }
}

/// Event carried on the bridge exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgeEvent {
    Join { name: String },
    Leave { name: String },
    Message { name: String, text: String },
}

impl BridgeEvent {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(body)?;
        Self::from_value(value)
    }

    /// Interpret an already-parsed JSON value.
    ///
    /// Empty `name` or `text` strings count as missing.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let field = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let kind = value.get("type").and_then(Value::as_str).map(str::to_string);
        let event = match (kind.as_deref(), field("name"), field("text")) {
            (Some("join"), Some(name), _) => Some(BridgeEvent::Join { name }),
            (Some("leave"), Some(name), _) => Some(BridgeEvent::Leave { name }),
            (Some("message"), Some(name), Some(text)) => {
                Some(BridgeEvent::Message { name, text })
            }
            _ => None,
        };
        event.ok_or(DecodeError::UnknownShape(value))
    }

    /// What connected clients see for this event.
    pub fn to_frame(&self) -> ClientFrame {
        match self {
            BridgeEvent::Join { name } => ClientFrame::System {
                text: format!("{} entered", name),
            },
            BridgeEvent::Leave { name } => ClientFrame::System {
                text: format!("{} left", name),
            },
            BridgeEvent::Message { name, text } => ClientFrame::Message {
                name: name.clone(),
                text: text.clone(),
            },
        }
    }
}

/// Frame broadcast to every connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    System { text: String },
    Message { name: String, text: String },
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        // Both variants are plain string fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
