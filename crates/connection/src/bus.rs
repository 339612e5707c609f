//! Typed event bus: key → list of handler references.
//!
//! Handlers are snapshotted before dispatch, so a handler may subscribe,
//! unsubscribe or publish on the same bus without deadlocking.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared handler reference.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by every `subscribe`.
///
/// Dropping it does NOT remove the handler; call [`Unsubscribe::unsubscribe`].
#[must_use = "the handler stays registered until `unsubscribe` is called"]
pub struct Unsubscribe {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Unsubscribe {
    pub(crate) fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Remove the handler. Idempotent with respect to the bus: removing an
    /// already-removed handler is a no-op.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("pending", &self.remove.is_some())
            .finish()
    }
}

struct BusInner<K, T> {
    next_id: AtomicU64,
    handlers: DashMap<K, Vec<(u64, Handler<T>)>>,
}

/// Event bus keyed by `K` delivering `&T` to every handler of a key.
pub struct EventBus<K, T> {
    inner: Arc<BusInner<K, T>>,
}

impl<K, T> Clone for EventBus<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, T> EventBus<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                handlers: DashMap::new(),
            }),
        }
    }

    /// Register `handler` for `key`. Multiple handlers per key are allowed.
    pub fn subscribe<F>(&self, key: K, handler: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                let now_empty = match inner.handlers.get_mut(&key) {
                    Some(mut list) => {
                        list.retain(|(hid, _)| *hid != id);
                        list.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    inner.handlers.remove_if(&key, |_, list| list.is_empty());
                }
            }
        })
    }

    /// Deliver `event` to every handler registered for `key`.
    /// Returns the number of handlers invoked.
    pub fn publish(&self, key: &K, event: &T) -> usize {
        let handlers: Vec<Handler<T>> = match self.inner.handlers.get(key) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn handler_count(&self, key: &K) -> usize {
        self.inner.handlers.get(key).map(|l| l.len()).unwrap_or(0)
    }
}

impl<T: 'static> EventBus<(), T> {
    /// Register a handler on a keyless bus.
    pub fn listen<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe((), handler)
    }

    /// Deliver to every handler on a keyless bus.
    pub fn emit(&self, event: &T) -> usize {
        self.publish(&(), event)
    }
}

impl<K, T> Default for EventBus<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
