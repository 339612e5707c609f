//! Declarative topic subscriptions over a managed connection.
//!
//! [`SubscriptionRegistry`] remembers which topics the consumer wants,
//! issues the subscribe frames once the connection is authenticated, replays
//! them after every re-authentication, and routes each topic's inbound
//! update frames to an [`EventSink`].

pub mod descriptor;
pub mod registry;
pub mod sink;

pub use descriptor::{Scope, SubscriptionDescriptor};
pub use registry::SubscriptionRegistry;
pub use sink::EventSink;
