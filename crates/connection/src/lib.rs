//! Managed real-time connection to the fleet server.
//!
//! [`ConnectionManager`] drives one logical channel through connect,
//! authenticate, heartbeat and reconnect. The wire itself sits behind the
//! [`Transport`] trait: [`WsTransport`] for WebSocket servers and
//! [`MemoryTransport`] for in-process servers.

pub mod backoff;
pub mod bus;
pub mod config;
pub mod manager;
pub mod memory;
pub mod state;
pub mod stats;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use bus::{EventBus, Unsubscribe};
pub use config::ConnectionConfig;
pub use manager::{ConnectionEvent, ConnectionManager, ErrorKind};
pub use memory::{MemoryPeer, MemoryTransport};
pub use state::ConnectionState;
pub use stats::ConnectionStats;
pub use transport::{Transport, TransportEvent, TransportLink, WsTransport};
