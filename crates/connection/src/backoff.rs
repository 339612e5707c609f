//! Exponential reconnection backoff.

use crate::config::ConnectionConfig;
use std::time::Duration;

/// Growth factor between consecutive retry delays.
pub const BACKOFF_FACTOR: f64 = 1.5;

/// Reconnection policy: `base × 1.5^n`, clamped to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            base_delay: config.reconnect_delay,
            max_delay: config.max_reconnect_delay,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before retry `n` (0-based).
    pub fn delay_for(&self, n: u32) -> Duration {
        let factor = BACKOFF_FACTOR.powi(n.min(i32::MAX as u32) as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Whether `attempts` consecutive failures exhaust the retry budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
