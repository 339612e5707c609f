//! Connection statistics and heartbeat latency sampling.

use serde::Serialize;
use std::collections::VecDeque;

/// Number of heartbeat round-trips averaged into `average_latency_ms`.
pub const LATENCY_WINDOW: usize = 10;

/// Snapshot of connection health counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Epoch millis of the last successful connect; `None` while disconnected.
    pub connected_at: Option<i64>,
    /// Consecutive transport failures since the last successful connect.
    pub reconnect_attempts: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Mean of the last [`LATENCY_WINDOW`] heartbeat round-trips.
    pub average_latency_ms: f64,
    /// Epoch millis of the last heartbeat acknowledgement.
    pub last_heartbeat: Option<i64>,
}

/// Fixed-size sliding window of round-trip samples.
#[derive(Debug, Clone, Default)]
pub struct LatencyWindow {
    samples: VecDeque<i64>,
}

impl LatencyWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }

    /// Push a sample and return the new mean.
    pub fn push(&mut self, rtt_ms: i64) -> f64 {
        if self.samples.len() == LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms.max(0));
        self.average()
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<i64>() as f64 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
