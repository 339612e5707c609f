//! Subscription registry.
//!
//! Desired descriptors are kept per topic and survive disconnects. A
//! descriptor is *active* once its subscribe frame went out on the current
//! authenticated session; leaving `authenticated` clears every active flag,
//! and the next `Authenticated` event replays whatever is inactive.

use crate::descriptor::{Scope, SubscriptionDescriptor};
use crate::sink::EventSink;
use common::error::{Error, Result};
use common::messages::{events, CommandRequest, UnsubscribeRequest};
use common::stream::{StreamEvent, Topic};
use connection::{ConnectionEvent, ConnectionManager, ConnectionState, Unsubscribe};
use metrics::counter;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

struct Entry {
    descriptor: SubscriptionDescriptor,
    active: bool,
    route: Option<Unsubscribe>,
}

struct RegistryInner {
    connection: ConnectionManager,
    sink: Arc<dyn EventSink>,
    entries: Mutex<BTreeMap<Topic, Entry>>,
    lifecycle: Mutex<Option<Unsubscribe>>,
}

/// Registry of desired topic subscriptions on one connection.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    /// Create a registry routing parsed updates into `sink`.
    pub fn new(connection: ConnectionManager, sink: Arc<dyn EventSink>) -> Self {
        let inner = Arc::new(RegistryInner {
            connection,
            sink,
            entries: Mutex::new(BTreeMap::new()),
            lifecycle: Mutex::new(None),
        });

        let weak: Weak<RegistryInner> = Arc::downgrade(&inner);
        let listener = inner.connection.on_event(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_event(event);
            }
        });
        *inner.lifecycle.lock() = Some(listener);

        Self { inner }
    }

    /// Want `topic` with `scope`.
    ///
    /// Sends the subscribe frame if authenticated and returns true. While not
    /// authenticated the descriptor is recorded, the call returns false, and
    /// the frame goes out on the next authentication. An equivalent
    /// descriptor that is already active is a no-op.
    pub fn subscribe(&self, topic: Topic, scope: Scope) -> bool {
        if scope.is_empty() {
            warn!("Refusing {} subscription with an empty entity list", topic);
            return false;
        }

        let mut entries = self.inner.entries.lock();
        let entry = entries.entry(topic).or_insert_with(|| Entry {
            descriptor: SubscriptionDescriptor::new(topic, scope.clone()),
            active: false,
            route: Some(self.inner.route(topic)),
        });

        if entry.descriptor.scope == scope && entry.active {
            debug!("{} already subscribed ({})", topic, scope);
            return true;
        }
        if entry.descriptor.scope != scope {
            entry.descriptor.scope = scope;
            entry.active = false;
        }

        if !self.inner.connection.is_authenticated() {
            warn!(
                "Not authenticated; {} subscription deferred until authentication",
                topic
            );
            return false;
        }

        self.inner.activate(entry)
    }

    /// Stop wanting `topic`. Idempotent.
    pub fn unsubscribe(&self, topic: Topic) {
        let removed = self.inner.entries.lock().remove(&topic);
        let Some(entry) = removed else {
            debug!("{} was not subscribed", topic);
            return;
        };

        if let Some(route) = entry.route {
            route.unsubscribe();
        }
        if self.inner.connection.is_authenticated() {
            if let Err(e) = self
                .inner
                .connection
                .emit(topic.unsubscribe_event(), &UnsubscribeRequest::default())
            {
                warn!("Failed to send {} unsubscribe: {}", topic, e);
            }
        }
        info!("Unsubscribed from {}", topic);
    }

    /// Send `drone_command_send {entityId, ...command}`.
    pub fn send_command(&self, entity_id: &str, command: Map<String, Value>) -> Result<()> {
        if !self.inner.connection.is_authenticated() {
            return Err(Error::NotAuthenticated);
        }
        self.inner.connection.emit(
            events::COMMAND_SEND,
            &CommandRequest {
                entity_id: entity_id.to_string(),
                command,
            },
        )?;
        counter!("fleet_subscription_commands_sent_total").increment(1);
        Ok(())
    }

    /// Every descriptor the consumer currently wants, in topic order.
    pub fn desired(&self) -> Vec<SubscriptionDescriptor> {
        self.inner
            .entries
            .lock()
            .values()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Whether the subscribe frame for `topic` went out on this session.
    pub fn is_active(&self, topic: Topic) -> bool {
        self.inner
            .entries
            .lock()
            .get(&topic)
            .map(|e| e.active)
            .unwrap_or(false)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Release every handler this registry registered on the connection.
    /// Desired descriptors are forgotten; nothing is sent to the server.
    pub fn close(&self) {
        let entries = std::mem::take(&mut *self.inner.entries.lock());
        for route in entries.into_values().filter_map(|e| e.route) {
            route.unsubscribe();
        }
        if let Some(listener) = self.inner.lifecycle.lock().take() {
            listener.unsubscribe();
        }
    }
}

impl RegistryInner {
    fn route(&self, topic: Topic) -> Unsubscribe {
        let sink = self.sink.clone();
        self.connection
            .subscribe(topic.update_event(), move |data| {
                match StreamEvent::from_update(topic, data) {
                    Ok(event) => {
                        counter!("fleet_subscription_events_total", "topic" => topic.as_str())
                            .increment(1);
                        sink.ingest(event);
                    }
                    Err(e) => {
                        warn!("Dropping {} frame: {}", topic.update_event(), e);
                        counter!("fleet_subscription_malformed_total", "topic" => topic.as_str())
                            .increment(1);
                    }
                }
            })
    }

    fn activate(&self, entry: &mut Entry) -> bool {
        let descriptor = &entry.descriptor;
        match self.connection.emit(
            descriptor.topic.subscribe_event(),
            &descriptor.scope.to_request(),
        ) {
            Ok(()) => {
                info!("Subscribed to {} ({})", descriptor.topic, descriptor.scope);
                entry.active = true;
                true
            }
            Err(e) => {
                warn!("Failed to subscribe to {}: {}", descriptor.topic, e);
                false
            }
        }
    }

    fn on_connection_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { from, .. } if *from == ConnectionState::Authenticated => {
                let mut entries = self.entries.lock();
                for entry in entries.values_mut() {
                    entry.active = false;
                }
                debug!("Cleared {} active subscriptions", entries.len());
            }
            ConnectionEvent::Authenticated => self.replay(),
            _ => {}
        }
    }

    fn replay(&self) {
        let mut entries = self.entries.lock();
        let mut replayed = 0u64;
        for entry in entries.values_mut().filter(|e| !e.active) {
            if self.activate(entry) {
                replayed += 1;
            }
        }
        if replayed > 0 {
            info!("Replayed {} subscriptions after authentication", replayed);
            counter!("fleet_subscription_replays_total").increment(replayed);
        }
    }
}
