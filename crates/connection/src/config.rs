//! Connection manager configuration.

use std::time::Duration;

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Transport endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Call `connect()` immediately on construction.
    pub auto_connect: bool,
    /// Enable the reconnection edges of the state machine on transport errors.
    pub auto_reconnect: bool,
    /// Base delay for exponential backoff.
    pub reconnect_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_reconnect_delay: Duration,
    /// Number of consecutive transport failures before the manager gives up.
    pub max_reconnect_attempts: u32,
    /// Connection establishment timeout.
    pub timeout: Duration,
    /// Default credential for `authenticate()`; sent automatically on connect.
    pub auth_token: Option<String>,
    /// Period of the heartbeat ping.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws".to_string(),
            auto_connect: false,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            timeout: Duration::from_secs(20),
            auth_token: None,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    /// Create config with a custom endpoint.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}
