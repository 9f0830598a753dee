//! Retention cleanup: periodically cascade-delete old jobs.

use std::{sync::Arc, time::Duration};

use {
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use quarry_store::{JobStore, types::now_ms};

/// Jobs older than this are deleted, results and deliveries included.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub struct CleanupLoop {
    jobs: Arc<dyn JobStore>,
    interval: Duration,
    retention: Duration,
}

impl CleanupLoop {
    #[must_use]
    pub fn new(jobs: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self {
            jobs,
            interval,
            retention: DEFAULT_RETENTION,
        }
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// One deletion pass.
    pub async fn run_once(&self) -> quarry_store::Result<u64> {
        let cutoff = now_ms() - self.retention.as_millis() as i64;
        let deleted = self.jobs.delete_jobs_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, "cleanup removed expired jobs");
        }
        Ok(deleted)
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "cleanup loop started");
            loop {
                tokio::select! {
                    () = tokio::time::sleep(self.interval) => {},
                    () = cancel.cancelled() => break,
                }
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "cleanup pass failed");
                }
            }
        })
    }
}
