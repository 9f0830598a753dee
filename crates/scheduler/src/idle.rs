//! Idle detection for scale-to-zero.
//!
//! Two activity axes: in-flight HTTP requests (probe paths excluded by the
//! caller) and a background-work hint held while any job runs. When both
//! are zero for the configured quiet period, the shutdown token fires.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use {
    tokio::time::Instant,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

pub struct IdleMonitor {
    timeout: Duration,
    inflight: AtomicI64,
    background: AtomicI64,
    last_activity: Mutex<Instant>,
    shutdown: CancellationToken,
}

/// RAII guard; activity ends when it drops.
pub struct ActivityGuard {
    monitor: Arc<IdleMonitor>,
    counter: &'static str,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let counter = match self.counter {
            "inflight" => &self.monitor.inflight,
            _ => &self.monitor.background,
        };
        counter.fetch_sub(1, Ordering::SeqCst);
        self.monitor.touch();
    }
}

impl IdleMonitor {
    #[must_use]
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            inflight: AtomicI64::new(0),
            background: AtomicI64::new(0),
            last_activity: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token closed once the service has been quiet for the timeout.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Track one in-flight HTTP request.
    #[must_use]
    pub fn request(self: &Arc<Self>) -> ActivityGuard {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        ActivityGuard {
            monitor: self.clone(),
            counter: "inflight",
        }
    }

    /// Hold while a claimed job is running.
    #[must_use]
    pub fn background_work(self: &Arc<Self>) -> ActivityGuard {
        self.background.fetch_add(1, Ordering::SeqCst);
        self.touch();
        ActivityGuard {
            monitor: self.clone(),
            counter: "background",
        }
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }

    fn is_active(&self) -> bool {
        self.inflight.load(Ordering::SeqCst) > 0 || self.background.load(Ordering::SeqCst) > 0
    }

    fn quiet_for(&self) -> Duration {
        Instant::now()
            - *self
                .last_activity
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Check period: timeout/6 clamped to [5s, 30s].
    #[must_use]
    pub fn check_period(&self) -> Duration {
        (self.timeout / 6).clamp(Duration::from_secs(5), Duration::from_secs(30))
    }

    /// Watch until quiet, then close the shutdown token.
    pub fn spawn_watch(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.check_period();
            info!(timeout_secs = self.timeout.as_secs(), "idle monitor started");
            loop {
                tokio::select! {
                    () = tokio::time::sleep(period) => {},
                    () = cancel.cancelled() => return,
                }
                if self.is_active() {
                    debug!("idle check: active");
                    continue;
                }
                if self.quiet_for() >= self.timeout {
                    info!("idle timeout reached, signalling shutdown");
                    self.shutdown.cancel();
                    return;
                }
            }
        })
    }
}
