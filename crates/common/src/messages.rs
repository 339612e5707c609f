//! Wire protocol for the fleet streaming channel.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": {...}}`. Emits that want an acknowledgement
//! carry an extra `"ack": <id>`, and the server answers with an `ack` frame
//! carrying the same id.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Control event names that are not tied to a topic.
pub mod events {
    pub const AUTHENTICATE: &str = "authenticate";
    pub const AUTHENTICATION_SUCCESS: &str = "authentication_success";
    pub const AUTHENTICATION_FAILED: &str = "authentication_failed";
    pub const ERROR: &str = "error";
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ACK: &str = "ack";
    pub const COMMAND_SEND: &str = "drone_command_send";
}

/// A single frame on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name (e.g. `drone_position_update`).
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
    /// Acknowledgement id, present on acknowledged emits and on `ack` replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack: None,
        }
    }

    pub fn with_ack(mut self, id: u64) -> Self {
        self.ack = Some(id);
        self
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// Client → Server payloads
// ============================================================================

/// `authenticate {token}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub token: String,
}

/// `<topic>_subscribe {entityIds[] | subscribeAll}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub subscribe_all: bool,
}

impl SubscribeRequest {
    pub fn entities(ids: Vec<String>) -> Self {
        Self {
            entity_ids: Some(ids),
            subscribe_all: false,
        }
    }

    pub fn all() -> Self {
        Self {
            entity_ids: None,
            subscribe_all: true,
        }
    }
}

/// `<topic>_unsubscribe {}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnsubscribeRequest {}

/// `ping {sendTimestamp}`, echoed back by the server as `pong`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub send_timestamp: i64,
}

/// `drone_command_send {entityId, ...command}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub entity_id: String,
    #[serde(flatten)]
    pub command: Map<String, Value>,
}

// ============================================================================
// Server → Client payloads
// ============================================================================

/// Payload of `authentication_failed`, `error` and `validation_error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerNotice {
    #[serde(default)]
    pub message: String,
}
