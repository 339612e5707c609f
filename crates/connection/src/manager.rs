//! Connection manager.
//!
//! Owns one logical channel to the fleet server and drives it through the
//! [`ConnectionState`] machine: connect with timeout, automatic
//! authentication, heartbeat latency sampling, and exponential-backoff
//! reconnection after transport failures.
//!
//! Every spawned task carries the connection generation it was started for.
//! `connect()`, `disconnect()` and each retry bump the generation, so
//! callbacks from a superseded channel are ignored.

use crate::backoff::ReconnectPolicy;
use crate::bus::{EventBus, Unsubscribe};
use crate::config::ConnectionConfig;
use crate::state::ConnectionState;
use crate::stats::{ConnectionStats, LatencyWindow};
use crate::transport::{Transport, TransportEvent, TransportLink};
use common::error::{Error, Result};
use common::messages::{events, AuthenticateRequest, Envelope, Heartbeat, ServerNotice};
use common::stream::now_ms;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Category of a reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Open failure, timeout, or abrupt loss of the channel.
    Transport,
    /// Rejected or missing credentials.
    Authentication,
    /// Server `error` frames and undecodable frames.
    Protocol,
    /// Server `validation_error` frames.
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Validation => "validation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notification delivered to [`ConnectionManager::on_event`] handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected,
    Authenticated,
    Disconnected {
        reason: Option<String>,
    },
    ReconnectScheduled {
        /// 1-based number of the failure that triggered this retry.
        attempt: u32,
        delay: Duration,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

type AckCallback = Box<dyn FnOnce(&Value) + Send>;

/// Acknowledgements awaited at once; the oldest is dropped beyond this.
const MAX_PENDING_ACKS: usize = 1024;

#[derive(Default)]
struct Tasks {
    connection: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [
            self.connection.take(),
            self.reconnect.take(),
            self.heartbeat.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Core {
    state: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    tasks: Tasks,
    last_error: Option<String>,
    auth_token: Option<String>,
    next_ack: u64,
    /// Keyed by increasing id, so the first entry is the oldest.
    pending_acks: BTreeMap<u64, AckCallback>,
}

struct Inner {
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    core: Mutex<Core>,
    stats: Mutex<ConnectionStats>,
    latency: Mutex<LatencyWindow>,
    state_tx: watch::Sender<ConnectionState>,
    messages: EventBus<String, Value>,
    lifecycle: EventBus<(), ConnectionEvent>,
}

/// Handle to a managed connection. Cloning shares the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager over `transport`. Connects immediately when
    /// `config.auto_connect` is set (requires a tokio runtime).
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let manager = Self {
            inner: Arc::new(Inner {
                policy: ReconnectPolicy::from_config(&config),
                core: Mutex::new(Core {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    outbound: None,
                    tasks: Tasks::default(),
                    last_error: None,
                    auth_token: config.auth_token.clone(),
                    next_ack: 0,
                    pending_acks: BTreeMap::new(),
                }),
                config,
                transport,
                stats: Mutex::new(ConnectionStats::default()),
                latency: Mutex::new(LatencyWindow::new()),
                state_tx,
                messages: EventBus::new(),
                lifecycle: EventBus::new(),
            }),
        };

        if manager.inner.config.auto_connect {
            manager.connect();
        }
        manager
    }

    /// Start connecting. A no-op (with a warning) while already connecting or
    /// open. While a retry is pending, cancels the timer and connects now.
    pub fn connect(&self) {
        let mut pending = Vec::new();
        {
            let mut core = self.inner.core.lock();
            if matches!(
                core.state,
                ConnectionState::Connecting
                    | ConnectionState::Connected
                    | ConnectionState::Authenticated
            ) {
                warn!("connect() ignored: connection is already {}", core.state);
                return;
            }
            if let Some(timer) = core.tasks.reconnect.take() {
                timer.abort();
            }
            self.inner.begin_attempt(&mut core, &mut pending);
        }
        self.inner.dispatch(pending);
    }

    /// Close the channel and cancel heartbeat, pending retries and pending
    /// acknowledgements. Ends in `Disconnected`.
    pub fn disconnect(&self) {
        let mut pending = Vec::new();
        let connection = {
            let mut core = self.inner.core.lock();
            core.generation += 1;
            let connection = self.inner.teardown(&mut core);
            let was = core.state;
            self.inner
                .transition(&mut core, ConnectionState::Disconnected, &mut pending);
            if was != ConnectionState::Disconnected {
                pending.push(ConnectionEvent::Disconnected {
                    reason: Some("client disconnect".to_string()),
                });
            }
            connection
        };
        if let Some(task) = connection {
            task.abort();
        }
        info!("Disconnected from {}", self.inner.config.url);
        self.inner.dispatch(pending);
    }

    /// Send an `authenticate` frame with `token`, or with the token previously
    /// supplied or configured. Returns false if no token is available or the
    /// channel is not open.
    pub fn authenticate(&self, token: Option<&str>) -> bool {
        self.inner.authenticate(token)
    }

    /// Send `payload` as event `event`. Fails with [`Error::NotConnected`]
    /// unless the channel is open; nothing is queued.
    pub fn emit<P: Serialize + ?Sized>(&self, event: &str, payload: &P) -> Result<()> {
        let data = serde_json::to_value(payload)?;
        self.inner.send(Envelope::new(event, data))
    }

    /// Like [`emit`](Self::emit), but `on_ack` runs with the payload of the
    /// server's matching `ack` frame. Returns the acknowledgement id.
    pub fn emit_with_ack<P, F>(&self, event: &str, payload: &P, on_ack: F) -> Result<u64>
    where
        P: Serialize + ?Sized,
        F: FnOnce(&Value) + Send + 'static,
    {
        let data = serde_json::to_value(payload)?;
        let id = {
            let mut core = self.inner.core.lock();
            if !core.state.is_open() {
                return Err(Error::NotConnected);
            }
            core.next_ack += 1;
            let id = core.next_ack;
            core.pending_acks.insert(id, Box::new(on_ack));
            if core.pending_acks.len() > MAX_PENDING_ACKS {
                if let Some((oldest, _)) = core.pending_acks.pop_first() {
                    warn!("Dropping unacknowledged message {}", oldest);
                }
            }
            id
        };

        if let Err(e) = self.inner.send(Envelope::new(event, data).with_ack(id)) {
            self.inner.core.lock().pending_acks.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Register `handler` for inbound frames named `event`.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Unsubscribe
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.messages.subscribe(event.to_string(), handler)
    }

    /// Register `handler` for lifecycle notifications.
    pub fn on_event<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.lifecycle.listen(handler)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    /// Receiver that observes every state the manager settles in.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.lock().clone()
    }

    /// Message of the most recent transport or authentication error.
    pub fn last_error(&self) -> Option<String> {
        self.inner.core.lock().last_error.clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    // ========================================================================
    // State machine
    // ========================================================================

    fn transition(
        &self,
        core: &mut Core,
        next: ConnectionState,
        pending: &mut Vec<ConnectionEvent>,
    ) {
        let from = core.state;
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            warn!("Ignoring illegal state transition {} -> {}", from, next);
            return;
        }
        core.state = next;
        self.state_tx.send_replace(next);
        debug!("Connection state {} -> {}", from, next);
        pending.push(ConnectionEvent::StateChanged { from, to: next });
    }

    fn dispatch(&self, pending: Vec<ConnectionEvent>) {
        for event in &pending {
            self.lifecycle.emit(event);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.core.lock().generation == generation
    }

    /// Drop the channel and cancel everything tied to it. Returns the
    /// connection task handle so the caller decides whether to abort it.
    fn teardown(&self, core: &mut Core) -> Option<JoinHandle<()>> {
        core.outbound = None;
        core.pending_acks.clear();
        if let Some(heartbeat) = core.tasks.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(timer) = core.tasks.reconnect.take() {
            timer.abort();
        }

        let mut stats = self.stats.lock();
        stats.connected_at = None;
        stats.last_heartbeat = None;
        stats.average_latency_ms = 0.0;
        self.latency.lock().clear();

        core.tasks.connection.take()
    }

    // ========================================================================
    // Connection attempts
    // ========================================================================

    fn begin_attempt(self: &Arc<Self>, core: &mut Core, pending: &mut Vec<ConnectionEvent>) {
        core.generation += 1;
        let generation = core.generation;
        self.transition(core, ConnectionState::Connecting, pending);
        info!("Connecting to {}", self.config.url);

        let task = tokio::spawn(run_connection(
            Arc::downgrade(self),
            self.transport.clone(),
            self.config.url.clone(),
            self.config.timeout,
            generation,
        ));
        if let Some(previous) = core.tasks.connection.replace(task) {
            previous.abort();
        }
    }

    fn on_open(self: &Arc<Self>, generation: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut pending = Vec::new();
        let has_token = {
            let mut core = self.core.lock();
            if core.generation != generation || core.state != ConnectionState::Connecting {
                return false;
            }
            core.outbound = Some(outbound);
            core.last_error = None;
            {
                let mut stats = self.stats.lock();
                stats.connected_at = Some(now_ms());
                stats.reconnect_attempts = 0;
            }
            self.transition(&mut core, ConnectionState::Connected, &mut pending);
            pending.push(ConnectionEvent::Connected);
            self.start_heartbeat(&mut core, generation);
            core.auth_token.is_some()
        };

        info!("Connected to {}", self.config.url);
        counter!("fleet_connection_connects_total").increment(1);
        self.dispatch(pending);

        if has_token {
            self.authenticate(None);
        }
        true
    }

    fn on_close(&self, generation: u64, reason: Option<String>) {
        let mut pending = Vec::new();
        {
            let mut core = self.core.lock();
            if core.generation != generation {
                return;
            }
            drop(self.teardown(&mut core));
            self.transition(&mut core, ConnectionState::Disconnected, &mut pending);
            pending.push(ConnectionEvent::Disconnected {
                reason: reason.clone(),
            });
        }
        info!(
            "Server closed the connection: {}",
            reason.as_deref().unwrap_or("no reason")
        );
        self.dispatch(pending);
    }

    /// Open failure, timeout, or abrupt loss. Follows the reconnection edges.
    fn on_transport_error(self: &Arc<Self>, generation: u64, message: String) {
        let mut pending = Vec::new();
        {
            let mut core = self.core.lock();
            if core.generation != generation
                || !matches!(
                    core.state,
                    ConnectionState::Connecting
                        | ConnectionState::Connected
                        | ConnectionState::Authenticated
                )
            {
                return;
            }
            drop(self.teardown(&mut core));
            core.last_error = Some(message.clone());
            pending.push(ConnectionEvent::Error {
                kind: ErrorKind::Transport,
                message: message.clone(),
            });
            warn!("Transport error on {}: {}", self.config.url, message);
            counter!("fleet_connection_errors_total", "kind" => ErrorKind::Transport.as_str())
                .increment(1);

            if !self.config.auto_reconnect {
                self.transition(&mut core, ConnectionState::Failed, &mut pending);
            } else {
                let attempts = {
                    let mut stats = self.stats.lock();
                    stats.reconnect_attempts += 1;
                    stats.reconnect_attempts
                };
                self.transition(&mut core, ConnectionState::Reconnecting, &mut pending);

                if self.policy.is_exhausted(attempts) {
                    error!(
                        "Giving up on {} after {} consecutive failures",
                        self.config.url, attempts
                    );
                    self.transition(&mut core, ConnectionState::Failed, &mut pending);
                } else {
                    let delay = self.policy.delay_for(attempts - 1);
                    info!("Reconnecting in {:?} (attempt {})", delay, attempts);
                    counter!("fleet_connection_reconnects_total").increment(1);
                    pending.push(ConnectionEvent::ReconnectScheduled {
                        attempt: attempts,
                        delay,
                    });
                    self.schedule_reconnect(&mut core, delay, generation);
                }
            }
        }
        self.dispatch(pending);
    }

    fn schedule_reconnect(self: &Arc<Self>, core: &mut Core, delay: Duration, generation: u64) {
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.retry(generation);
            }
        });
        if let Some(previous) = core.tasks.reconnect.replace(timer) {
            previous.abort();
        }
    }

    fn retry(self: &Arc<Self>, generation: u64) {
        let mut pending = Vec::new();
        {
            let mut core = self.core.lock();
            if core.generation != generation || core.state != ConnectionState::Reconnecting {
                return;
            }
            // Running inside the timer task itself.
            core.tasks.reconnect = None;
            self.begin_attempt(&mut core, &mut pending);
        }
        self.dispatch(pending);
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    fn start_heartbeat(self: &Arc<Self>, core: &mut Core, generation: u64) {
        let period = self.config.heartbeat_interval;
        if period.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First ping one full period after connect
            ticker.reset();
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.is_current(generation) {
                    break;
                }
                let ping = Heartbeat {
                    send_timestamp: now_ms(),
                };
                match serde_json::to_value(ping) {
                    Ok(data) => {
                        if let Err(e) = inner.send(Envelope::new(events::PING, data)) {
                            debug!("Heartbeat skipped: {}", e);
                        }
                    }
                    Err(e) => debug!("Heartbeat encode failed: {}", e),
                }
            }
        });
        if let Some(previous) = core.tasks.heartbeat.replace(task) {
            previous.abort();
        }
    }

    fn on_pong(&self, data: &Value) {
        let heartbeat: Heartbeat = match serde_json::from_value(data.clone()) {
            Ok(h) => h,
            Err(e) => {
                warn!("Malformed pong payload: {}", e);
                return;
            }
        };
        let now = now_ms();
        let average = self.latency.lock().push(now - heartbeat.send_timestamp);

        let mut stats = self.stats.lock();
        stats.average_latency_ms = average;
        stats.last_heartbeat = Some(now);
        gauge!("fleet_connection_latency_ms").set(average);
    }

    // ========================================================================
    // Frames
    // ========================================================================

    fn send(&self, envelope: Envelope) -> Result<()> {
        let text = envelope.encode()?;
        {
            let core = self.core.lock();
            if !core.state.is_open() {
                return Err(Error::NotConnected);
            }
            let outbound = core.outbound.as_ref().ok_or(Error::NotConnected)?;
            outbound.send(text).map_err(|_| Error::ConnectionClosed)?;
        }
        self.stats.lock().messages_sent += 1;
        counter!("fleet_connection_messages_sent_total").increment(1);
        Ok(())
    }

    fn authenticate(&self, token: Option<&str>) -> bool {
        let token = {
            let mut core = self.core.lock();
            if let Some(token) = token {
                core.auth_token = Some(token.to_string());
            }
            core.auth_token.clone()
        };

        let Some(token) = token else {
            warn!("authenticate() called without a token");
            self.report(ErrorKind::Authentication, Error::MissingCredentials.to_string());
            return false;
        };

        let data = match serde_json::to_value(AuthenticateRequest { token }) {
            Ok(data) => data,
            Err(e) => {
                warn!("Cannot encode authenticate request: {}", e);
                return false;
            }
        };
        match self.send(Envelope::new(events::AUTHENTICATE, data)) {
            Ok(()) => {
                debug!("Authentication requested");
                true
            }
            Err(e) => {
                warn!("Cannot authenticate: {}", e);
                false
            }
        }
    }

    fn on_authenticated(&self) {
        let mut pending = Vec::new();
        {
            let mut core = self.core.lock();
            if core.state != ConnectionState::Connected {
                debug!("Ignoring authentication_success while {}", core.state);
                return;
            }
            self.transition(&mut core, ConnectionState::Authenticated, &mut pending);
            pending.push(ConnectionEvent::Authenticated);
        }
        info!("Authenticated with {}", self.config.url);
        self.dispatch(pending);
    }

    fn on_ack(&self, id: Option<u64>, data: &Value) {
        let Some(id) = id else {
            warn!("ack frame without an id");
            return;
        };
        let callback = self.core.lock().pending_acks.remove(&id);
        match callback {
            Some(callback) => callback(data),
            None => debug!("No pending acknowledgement {}", id),
        }
    }

    /// Surface a non-fatal error to observers. Transport and authentication
    /// errors are also retained as `last_error`.
    fn report(&self, kind: ErrorKind, message: String) {
        if matches!(kind, ErrorKind::Transport | ErrorKind::Authentication) {
            self.core.lock().last_error = Some(message.clone());
        }
        counter!("fleet_connection_errors_total", "kind" => kind.as_str()).increment(1);
        self.lifecycle.emit(&ConnectionEvent::Error { kind, message });
    }

    fn on_frame(&self, text: &str) {
        self.stats.lock().messages_received += 1;
        counter!("fleet_connection_messages_received_total").increment(1);

        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                self.report(ErrorKind::Protocol, format!("Malformed frame: {}", e));
                return;
            }
        };

        match envelope.event.as_str() {
            events::AUTHENTICATION_SUCCESS => self.on_authenticated(),
            events::AUTHENTICATION_FAILED => {
                let notice = notice_of(&envelope.data);
                warn!("Authentication failed: {}", notice);
                self.report(ErrorKind::Authentication, notice);
            }
            events::ERROR => {
                let notice = notice_of(&envelope.data);
                warn!("Server error: {}", notice);
                self.report(ErrorKind::Protocol, notice);
            }
            events::VALIDATION_ERROR => {
                let notice = notice_of(&envelope.data);
                warn!("Server validation error: {}", notice);
                self.report(ErrorKind::Validation, notice);
            }
            events::PONG => self.on_pong(&envelope.data),
            events::ACK => self.on_ack(envelope.ack, &envelope.data),
            _ => {}
        }

        self.messages.publish(&envelope.event, &envelope.data);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.core.get_mut().tasks.abort_all();
    }
}

fn notice_of(data: &Value) -> String {
    match serde_json::from_value::<ServerNotice>(data.clone()) {
        Ok(notice) if !notice.message.is_empty() => notice.message,
        _ => data.to_string(),
    }
}

/// Open the channel and pump inbound events until it ends.
async fn run_connection(
    weak: Weak<Inner>,
    transport: Arc<dyn Transport>,
    url: String,
    timeout: Duration,
    generation: u64,
) {
    let opened = tokio::time::timeout(timeout, transport.open(&url)).await;
    let Some(inner) = weak.upgrade() else { return };

    let TransportLink {
        outbound,
        mut inbound,
    } = match opened {
        Ok(Ok(link)) => link,
        Ok(Err(e)) => {
            inner.on_transport_error(generation, e.to_string());
            return;
        }
        Err(_) => {
            inner.on_transport_error(generation, Error::Timeout(timeout).to_string());
            return;
        }
    };

    if !inner.on_open(generation, outbound) {
        return;
    }
    drop(inner);

    while let Some(event) = inbound.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        if !inner.is_current(generation) {
            return;
        }
        match event {
            TransportEvent::Message(text) => inner.on_frame(&text),
            TransportEvent::Closed(reason) => {
                inner.on_close(generation, reason);
                return;
            }
            TransportEvent::Error(message) => {
                inner.on_transport_error(generation, message);
                return;
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        inner.on_transport_error(generation, "Transport ended without a close".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryPeer, MemoryTransport};
    use serde_json::json;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://fleet.test/ws".to_string(),
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_attempts: 3,
            ..Default::default()
        }
    }

    fn manager_with(config: ConnectionConfig) -> (ConnectionManager, MemoryTransport) {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(config, Arc::new(transport.clone()));
        (manager, transport)
    }

    fn record_events(manager: &ConnectionManager) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _ = manager.on_event(move |e| sink.lock().push(e.clone()));
        seen
    }

    async fn wait_for(manager: &ConnectionManager, state: ConnectionState) {
        let mut rx = manager.state_changes();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    async fn connected(config: ConnectionConfig) -> (ConnectionManager, MemoryTransport, MemoryPeer) {
        let (manager, transport) = manager_with(config);
        manager.connect();
        let peer = transport.accept().await;
        wait_for(&manager, ConnectionState::Connected).await;
        (manager, transport, peer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_then_authenticate_automatically() {
        let (manager, _transport, mut peer) =
            connected(test_config().with_auth_token("secret")).await;

        let auth = peer.recv_event(events::AUTHENTICATE).await.unwrap();
        assert_eq!(auth.data["token"], "secret");
        assert_eq!(manager.state(), ConnectionState::Connected);

        peer.send(events::AUTHENTICATION_SUCCESS, json!({}));
        wait_for(&manager, ConnectionState::Authenticated).await;

        let stats = manager.stats();
        assert!(stats.connected_at.is_some());
        assert_eq!(stats.reconnect_attempts, 0);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let (manager, transport, _peer) = connected(test_config()).await;
        manager.connect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticate_without_token_fails_locally() {
        let (manager, _transport, mut peer) = connected(test_config()).await;
        let seen = record_events(&manager);

        assert!(!manager.authenticate(None));
        assert!(peer.drain().is_empty());
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(seen.lock().iter().any(|e| matches!(
            e,
            ConnectionEvent::Error {
                kind: ErrorKind::Authentication,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_failure_keeps_state() {
        let (manager, _transport, peer) = connected(test_config().with_auth_token("bad")).await;
        let seen = record_events(&manager);

        peer.send(events::AUTHENTICATION_FAILED, json!({"message": "invalid token"}));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.last_error().as_deref(), Some("invalid token"));
        assert!(seen.lock().contains(&ConnectionEvent::Error {
            kind: ErrorKind::Authentication,
            message: "invalid token".to_string(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_requires_open_channel() {
        let (manager, _transport) = manager_with(test_config());
        let err = manager.emit("drone_position_subscribe", &json!({})).unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert_eq!(manager.stats().messages_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_reaches_server() {
        let (manager, _transport, mut peer) = connected(test_config()).await;
        manager
            .emit("drone_status_subscribe", &json!({"subscribeAll": true}))
            .unwrap();

        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.event, "drone_status_subscribe");
        assert_eq!(frame.data["subscribeAll"], true);
        assert_eq!(manager.stats().messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_with_ack_runs_callback() {
        let (manager, _transport, mut peer) = connected(test_config()).await;
        let acked = Arc::new(Mutex::new(None));
        let slot = acked.clone();

        let id = manager
            .emit_with_ack("drone_command_send", &json!({"entityId": "d1"}), move |data| {
                *slot.lock() = Some(data.clone());
            })
            .unwrap();

        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.ack, Some(id));
        peer.ack(id, json!({"accepted": true}));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*acked.lock(), Some(json!({"accepted": true})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_acks_are_bounded() {
        let (manager, _transport, mut peer) = connected(test_config()).await;
        let fired = Arc::new(Mutex::new(Vec::new()));

        let mut ids = Vec::new();
        for _ in 0..=MAX_PENDING_ACKS {
            let sink = fired.clone();
            let id = manager
                .emit_with_ack("drone_command_send", &json!({"entityId": "d1"}), move |_| {
                    sink.lock().push(true);
                })
                .unwrap();
            ids.push(id);
        }
        assert_eq!(manager.inner.core.lock().pending_acks.len(), MAX_PENDING_ACKS);
        peer.drain();

        peer.ack(ids[0], json!({}));
        peer.ack(ids[MAX_PENDING_ACKS], json!({}));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_frames_reach_handlers() {
        let (manager, _transport, peer) = connected(test_config()).await;
        let hits = Arc::new(Mutex::new(Vec::new()));

        let h1 = hits.clone();
        let first = manager.subscribe("drone_status_update", move |data| {
            h1.lock().push(("first", data["entityId"].clone()));
        });
        let h2 = hits.clone();
        let _second = manager.subscribe("drone_status_update", move |data| {
            h2.lock().push(("second", data["entityId"].clone()));
        });

        peer.send("drone_status_update", json!({"entityId": "d1"}));
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.unsubscribe();
        peer.send("drone_status_update", json!({"entityId": "d2"}));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *hits.lock(),
            vec![
                ("first", json!("d1")),
                ("second", json!("d1")),
                ("second", json!("d2")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_are_reported_not_fatal() {
        let (manager, _transport, peer) = connected(test_config()).await;
        let seen = record_events(&manager);

        peer.send(events::VALIDATION_ERROR, json!({"message": "entityIds required"}));
        peer.send(events::ERROR, json!({"message": "boom"}));
        peer.send_raw("not json");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let kinds: Vec<ErrorKind> = seen
            .lock()
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Error { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![ErrorKind::Validation, ErrorKind::Protocol, ErrorKind::Protocol]
        );
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.last_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let (manager, transport) = manager_with(test_config());
        transport.refuse_connections(true);
        let seen = record_events(&manager);

        manager.connect();
        wait_for(&manager, ConnectionState::Failed).await;

        assert_eq!(transport.open_count(), 3);
        assert_eq!(manager.stats().reconnect_attempts, 3);
        assert!(manager.last_error().is_some());

        let delays: Vec<Duration> = seen
            .lock()
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::ReconnectScheduled { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(100), Duration::from_millis(150)]
        );

        // Stays failed until connect() is called again
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 3);
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_recovers_from_failed() {
        let (manager, transport) = manager_with(test_config());
        transport.refuse_connections(true);
        manager.connect();
        wait_for(&manager, ConnectionState::Failed).await;

        transport.refuse_connections(false);
        manager.connect();
        let _peer = transport.accept().await;
        wait_for(&manager, ConnectionState::Connected).await;
        assert_eq!(manager.stats().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_successful_reconnect() {
        let (manager, transport) = manager_with(test_config());
        let seen = record_events(&manager);
        transport.fail_next("refused");
        transport.fail_next("refused");

        manager.connect();
        let peer = transport.accept().await;
        wait_for(&manager, ConnectionState::Connected).await;
        assert_eq!(manager.stats().reconnect_attempts, 0);

        // Next loss starts again from the base delay
        peer.fail("connection reset");
        let _peer = transport.accept().await;
        wait_for(&manager, ConnectionState::Connected).await;

        let scheduled: Vec<(u32, Duration)> = seen
            .lock()
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::ReconnectScheduled { attempt, delay } => Some((*attempt, *delay)),
                _ => None,
            })
            .collect();
        assert_eq!(
            scheduled,
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(150)),
                (1, Duration::from_millis(100)),
            ]
        );
        assert_eq!(transport.open_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_does_not_reconnect() {
        let (manager, transport, peer) = connected(test_config()).await;
        peer.close(Some("server shutdown"));
        wait_for(&manager, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(manager.stats().connected_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_without_auto_reconnect_fails() {
        let config = ConnectionConfig {
            auto_reconnect: false,
            ..test_config()
        };
        let (manager, transport, peer) = connected(config).await;
        peer.fail("connection reset");
        wait_for(&manager, ConnectionState::Failed).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(manager.last_error().as_deref(), Some("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        let config = ConnectionConfig {
            timeout: Duration::from_secs(1),
            max_reconnect_attempts: 1,
            ..test_config()
        };
        let (manager, transport) = manager_with(config);
        transport.stall_connections(true);

        manager.connect();
        wait_for(&manager, ConnectionState::Failed).await;
        assert!(manager.last_error().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let (manager, transport) = manager_with(test_config());
        transport.refuse_connections(true);

        manager.connect();
        wait_for(&manager, ConnectionState::Reconnecting).await;
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_releases_channel() {
        let (manager, _transport, peer) = connected(test_config()).await;
        manager.disconnect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(peer.is_client_gone());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(
            manager.emit("ping", &json!({})),
            Err(Error::NotConnected)
        ));
    }

    fn pings(peer: &mut MemoryPeer) -> usize {
        peer.drain().iter().filter(|f| f.event == events::PING).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_follows_connection_lifecycle() {
        let config = ConnectionConfig {
            heartbeat_interval: Duration::from_secs(1),
            ..test_config()
        };
        let (manager, transport, mut first) = connected(config).await;

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(pings(&mut first), 2);

        first.fail("connection reset");
        let mut second = transport.accept().await;
        wait_for(&manager, ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(pings(&mut second), 2);
        assert_eq!(pings(&mut first), 0);

        manager.disconnect();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(pings(&mut second), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_samples_latency() {
        let (manager, _transport, mut peer) = connected(test_config()).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        let ping = peer.recv_event(events::PING).await.unwrap();
        let sent: Heartbeat = serde_json::from_value(ping.data).unwrap();

        peer.send(events::PONG, json!({"sendTimestamp": sent.send_timestamp}));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = manager.stats();
        assert!(stats.last_heartbeat.is_some());
        assert!(stats.average_latency_ms >= 0.0);
    }
}
