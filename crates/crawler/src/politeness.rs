//! Per-host request spacing.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio::time::Instant;

/// Minimum delay between consecutive requests to the same host.
pub const DEFAULT_CRAWL_DELAY: Duration = Duration::from_millis(200);

/// Gate that spaces requests per host. The gate is per-host, not global:
/// two workers hitting different hosts never wait on each other.
pub struct HostGate {
    min_delay: Duration,
    next_allowed: Mutex<HashMap<String, Instant>>,
}

impl Default for HostGate {
    fn default() -> Self {
        Self::new(DEFAULT_CRAWL_DELAY)
    }
}

impl HostGate {
    #[must_use]
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            next_allowed: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for this host's slot, claiming the next one atomically so
    /// concurrent workers queue behind each other.
    pub async fn acquire(&self, host: &str) {
        let wait_until = {
            let mut slots = self
                .next_allowed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = Instant::now();
            let slot = slots.get(host).copied().unwrap_or(now).max(now);
            slots.insert(host.to_string(), slot + self.min_delay);
            slot
        };

        tokio::time::sleep_until(wait_until).await;
    }
}
