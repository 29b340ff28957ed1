//! Process-wide failure throttle.
//!
//! Every failed handshake sleeps while holding one shared gate, so failing
//! attempts are serialised across all connections and cannot be run in
//! parallel to get around the per-attempt delay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

/// Shared delay gate applied once per failed handshake.
#[derive(Debug, Default)]
pub struct FailureThrottle {
    gate: Mutex<()>,
    /// Replaces the per-role delay when set.
    delay_override: Option<Duration>,
    penalties: AtomicU64,
}

impl FailureThrottle {
    /// Create a throttle using each role's own delay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a throttle that always sleeps for `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay_override: Some(delay),
            ..Self::default()
        }
    }

    /// Sleep for the penalty while holding the gate.
    ///
    /// Returns the delay actually applied.
    pub async fn penalize(&self, role_delay: Duration) -> Duration {
        let delay = self.delay_override.unwrap_or(role_delay);
        let _gate = self.gate.lock().await;
        debug!(delay_ms = delay.as_millis() as u64, "Applying authentication failure delay");
        tokio::time::sleep(delay).await;
        self.penalties.fetch_add(1, Ordering::Relaxed);
        delay
    }

    /// Number of penalties applied so far.
    pub fn penalties(&self) -> u64 {
        self.penalties.load(Ordering::Relaxed)
    }
}
