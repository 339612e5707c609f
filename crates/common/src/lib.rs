//! Common types for the fleet streaming client: errors, wire protocol, and
//! streamed payloads.

pub mod error;
pub mod messages;
pub mod stream;

pub use error::{Error, Result};
pub use messages::{events, Envelope};
pub use stream::{
    now_ms, CommandResponse, Position, Status, StreamEvent, StreamPayload, Topic,
};
