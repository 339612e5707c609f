//! In-process transport.
//!
//! Each successful `open` hands the far end of the channel to whoever is
//! waiting in [`MemoryTransport::accept`]. The far end ([`MemoryPeer`]) plays
//! the server: it reads client frames and pushes events, clean closes, or
//! abrupt failures.

use crate::transport::{Transport, TransportEvent, TransportLink};
use async_trait::async_trait;
use common::error::{Error, Result};
use common::messages::Envelope;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

#[derive(Default)]
struct MemoryInner {
    refusing: AtomicBool,
    stalled: AtomicBool,
    opens: AtomicUsize,
    failures: Mutex<VecDeque<String>>,
    peers: Mutex<VecDeque<MemoryPeer>>,
    accepted: Notify,
}

/// Transport whose server side lives in the same process.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every connection attempt until called again with `false`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refusing.store(refuse, Ordering::SeqCst);
    }

    /// Make `open` hang forever, so that the connect timeout fires.
    pub fn stall_connections(&self, stall: bool) {
        self.inner.stalled.store(stall, Ordering::SeqCst);
    }

    /// Fail exactly the next connection attempt with `reason`.
    pub fn fail_next(&self, reason: impl Into<String>) {
        self.inner.failures.lock().push_back(reason.into());
    }

    /// Number of `open` calls so far.
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Wait for the next successfully opened channel.
    pub async fn accept(&self) -> MemoryPeer {
        loop {
            if let Some(peer) = self.inner.peers.lock().pop_front() {
                return peer;
            }
            self.inner.accepted.notified().await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        let queued = self.inner.failures.lock().pop_front();
        if let Some(reason) = queued {
            return Err(Error::ConnectionRefused(reason));
        }
        if self.inner.refusing.load(Ordering::SeqCst) {
            return Err(Error::ConnectionRefused(format!("{} refused the connection", url)));
        }
        if self.inner.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        debug!("Memory transport accepted a connection to {}", url);
        self.inner.peers.lock().push_back(MemoryPeer {
            frames: outbound_rx,
            events: inbound_tx,
        });
        self.inner.accepted.notify_one();

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Server end of an in-memory channel.
pub struct MemoryPeer {
    frames: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    /// Next frame sent by the client, or `None` once the client dropped the link.
    pub async fn recv(&mut self) -> Option<Envelope> {
        while let Some(text) = self.frames.recv().await {
            match Envelope::decode(&text) {
                Ok(envelope) => return Some(envelope),
                Err(e) => debug!("Memory peer skipping undecodable frame: {}", e),
            }
        }
        None
    }

    /// Next frame named `event`, skipping any others.
    pub async fn recv_event(&mut self, event: &str) -> Option<Envelope> {
        while let Some(envelope) = self.recv().await {
            if envelope.event == event {
                return Some(envelope);
            }
        }
        None
    }

    /// All frames already sent by the client.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut frames = Vec::new();
        while let Ok(text) = self.frames.try_recv() {
            if let Ok(envelope) = Envelope::decode(&text) {
                frames.push(envelope);
            }
        }
        frames
    }

    /// Push a server event. Returns false if the client end is gone.
    pub fn send(&self, event: &str, data: Value) -> bool {
        match Envelope::new(event, data).encode() {
            Ok(text) => self.send_raw(text),
            Err(_) => false,
        }
    }

    /// Push an acknowledgement for the acked emit `id`.
    pub fn ack(&self, id: u64, data: Value) -> bool {
        match Envelope::new(common::events::ACK, data).with_ack(id).encode() {
            Ok(text) => self.send_raw(text),
            Err(_) => false,
        }
    }

    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.events.send(TransportEvent::Message(text.into())).is_ok()
    }

    /// Close the channel cleanly.
    pub fn close(&self, reason: Option<&str>) {
        let _ = self
            .events
            .send(TransportEvent::Closed(reason.map(str::to_string)));
    }

    /// Break the channel abruptly.
    pub fn fail(&self, message: &str) {
        let _ = self.events.send(TransportEvent::Error(message.to_string()));
    }

    /// Whether the client has released its end of the channel.
    pub fn is_client_gone(&self) -> bool {
        self.events.is_closed()
    }
}
