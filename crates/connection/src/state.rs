//! Connection lifecycle state machine.

use serde::Serialize;
use std::fmt;

/// Lifecycle state of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether the transport is open (authenticated or not).
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Authenticated)
    }

    /// Whether `self → next` is an edge of the lifecycle state machine.
    ///
    /// `disconnect()` may move any state to `Disconnected`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (*self, next) {
            (_, Disconnected) => true,
            (Disconnected | Failed | Reconnecting, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Authenticated) => true,
            (Connecting | Connected | Authenticated, Reconnecting) => true,
            (Connecting | Connected | Authenticated | Reconnecting, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    const ALL: [ConnectionState; 6] = [
        Disconnected,
        Connecting,
        Connected,
        Authenticated,
        Reconnecting,
        Failed,
    ];

    #[test]
    fn test_happy_path_edges() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Authenticated));
        assert!(Authenticated.can_transition_to(Disconnected));
    }

    #[test]
    fn test_reconnect_edges() {
        assert!(Connecting.can_transition_to(Reconnecting));
        assert!(Authenticated.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Reconnecting.can_transition_to(Failed));
        assert!(!Reconnecting.can_transition_to(Connected));
        assert!(!Reconnecting.can_transition_to(Authenticated));
    }

    #[test]
    fn test_terminal_states_need_connect() {
        for next in ALL {
            let allowed = matches!(next, Disconnected | Connecting);
            assert_eq!(Failed.can_transition_to(next), allowed, "failed -> {}", next);
            assert_eq!(Disconnected.can_transition_to(next), allowed, "disconnected -> {}", next);
        }
    }

    #[test]
    fn test_no_shortcut_to_authenticated() {
        for from in ALL {
            assert_eq!(from.can_transition_to(Authenticated), from == Connected);
        }
    }
}
