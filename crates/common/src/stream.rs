//! Streamed topics and their update payloads.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A named category of streamed data.
///
/// Each topic owns one subscribe/unsubscribe pair and one inbound update event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "position-updates")]
    Positions,
    #[serde(rename = "status-updates")]
    Statuses,
    #[serde(rename = "command-responses")]
    CommandResponses,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Positions, Topic::Statuses, Topic::CommandResponses];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Positions => "position-updates",
            Topic::Statuses => "status-updates",
            Topic::CommandResponses => "command-responses",
        }
    }

    pub fn subscribe_event(&self) -> &'static str {
        match self {
            Topic::Positions => "drone_position_subscribe",
            Topic::Statuses => "drone_status_subscribe",
            Topic::CommandResponses => "drone_command_subscribe",
        }
    }

    pub fn unsubscribe_event(&self) -> &'static str {
        match self {
            Topic::Positions => "drone_position_unsubscribe",
            Topic::Statuses => "drone_status_unsubscribe",
            Topic::CommandResponses => "drone_command_unsubscribe",
        }
    }

    pub fn update_event(&self) -> &'static str {
        match self {
            Topic::Positions => "drone_position_update",
            Topic::Statuses => "drone_status_update",
            Topic::CommandResponses => "drone_command_update",
        }
    }

    /// Whether records of this topic are subject to age-based eviction.
    /// Command responses are only ever replaced by a newer response.
    pub fn is_evictable(&self) -> bool {
        !matches!(self, Topic::CommandResponses)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "position-updates" | "positions" => Ok(Topic::Positions),
            "status-updates" | "statuses" => Ok(Topic::Statuses),
            "command-responses" | "commands" => Ok(Topic::CommandResponses),
            other => Err(Error::Generic(format!("Unknown topic: {}", other))),
        }
    }
}

/// Position fix for a drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
    #[serde(default)]
    pub heading: f64,
    #[serde(default)]
    pub speed: f64,
}

/// Flight and link status for a drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub flight_status: String,
    pub battery_level: f64,
    #[serde(default)]
    pub signal_strength: f64,
    #[serde(default)]
    pub is_connected: bool,
}

/// Outcome of a command previously sent to a drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub command_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Topic-specific payload of a stream event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamPayload {
    Position(Position),
    Status(Status),
    CommandResponse(CommandResponse),
}

impl StreamPayload {
    pub fn topic(&self) -> Topic {
        match self {
            StreamPayload::Position(_) => Topic::Positions,
            StreamPayload::Status(_) => Topic::Statuses,
            StreamPayload::CommandResponse(_) => Topic::CommandResponses,
        }
    }
}

/// A partial update for one entity, stamped with its origin time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub entity_id: String,
    pub payload: StreamPayload,
    /// Event-origin time (epoch millis), not arrival time.
    pub timestamp: i64,
}

/// Inbound `<topic>_update {entityId, ...payload, timestamp}` frame.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateFrame<P> {
    entity_id: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    timestamp: i64,
    #[serde(flatten)]
    payload: P,
}

impl StreamEvent {
    pub fn new(entity_id: impl Into<String>, payload: StreamPayload, timestamp: i64) -> Self {
        Self {
            entity_id: entity_id.into(),
            payload,
            timestamp,
        }
    }

    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }

    /// Key of the canonical record this event folds into: the command id for
    /// command responses, the entity id otherwise.
    pub fn record_key(&self) -> &str {
        match &self.payload {
            StreamPayload::CommandResponse(resp) => &resp.command_id,
            _ => &self.entity_id,
        }
    }

    /// Parse the data of an inbound update frame for `topic`.
    pub fn from_update(topic: Topic, data: &Value) -> Result<Self> {
        match topic {
            Topic::Positions => parse_frame(topic, data, StreamPayload::Position),
            Topic::Statuses => parse_frame(topic, data, StreamPayload::Status),
            Topic::CommandResponses => parse_frame(topic, data, StreamPayload::CommandResponse),
        }
    }
}

fn parse_frame<P: DeserializeOwned>(
    topic: Topic,
    data: &Value,
    wrap: fn(P) -> StreamPayload,
) -> Result<StreamEvent> {
    let frame = UpdateFrame::<P>::deserialize(data).map_err(|e| Error::InvalidUpdate {
        topic: topic.as_str(),
        reason: e.to_string(),
    })?;
    Ok(StreamEvent {
        entity_id: frame.entity_id,
        payload: wrap(frame.payload),
        timestamp: frame.timestamp,
    })
}

/// Parse a timestamp given either as epoch millis or as an RFC 3339 string.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok().or_else(|| {
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|dt| dt.timestamp_millis())
    })
}

/// Serde helper accepting epoch millis (integer or float) or an RFC 3339 string.
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(v),
        Raw::Float(v) => Ok(v as i64),
        Raw::Text(s) => {
            parse_timestamp(&s).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {}", s)))
        }
    }
}
