//! Claim-and-run worker loops.
//!
//! N workers poll `claim_pending` on an interval. A claimed crawl job runs
//! through the crawl engine; every page outcome persists as a `JobResult`
//! row, and the terminal job row plus webhook fan-out are written when the
//! crawl returns. Only `crawl` jobs are claimed; `extract`/`analyze` run
//! synchronously in the HTTP layer.

use std::{sync::Arc, time::Duration};

use {
    anyhow::{Context, Result},
    tokio::task::JoinSet,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
    url::Url,
};

use {
    quarry_crawler::{
        BalanceCheckFn, CrawlCallbacks, CrawlEngine, CrawlJob, CrawlOptions, PageOutcome,
        PageOutcomeKind, StopReason,
    },
    quarry_llm::AttemptConfig,
    quarry_store::{
        JobStore,
        types::{CrawlStatus, Job, JobOutcome, JobStatus, NewJobResult, now_ms},
    },
    quarry_webhooks::WebhookDispatcher,
};

use crate::idle::IdleMonitor;

/// Boot sweep treats anything running longer than this as abandoned.
pub const BOOT_STALE_AGE: Duration = Duration::from_secs(60 * 60);
/// How often the periodic stale sweep runs.
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Message written onto swept jobs.
pub const STALE_JOB_MESSAGE: &str = "job abandoned after server restart or timeout";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub stale_job_age: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            poll_interval: Duration::from_secs(5),
            stale_job_age: Duration::from_secs(30 * 60),
        }
    }
}

pub struct Scheduler {
    jobs: Arc<dyn JobStore>,
    engine: Arc<CrawlEngine>,
    dispatcher: Arc<WebhookDispatcher>,
    config: SchedulerConfig,
    idle: Option<Arc<IdleMonitor>>,
    check_balance: Option<BalanceCheckFn>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        engine: Arc<CrawlEngine>,
        dispatcher: Arc<WebhookDispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            engine,
            dispatcher,
            config,
            idle: None,
            check_balance: None,
        }
    }

    /// Report busy/idle transitions to the idle monitor.
    #[must_use]
    pub fn with_idle_monitor(mut self, idle: Arc<IdleMonitor>) -> Self {
        self.idle = Some(idle);
        self
    }

    /// Install the balance probe consulted before each non-BYOK extract.
    #[must_use]
    pub fn with_balance_check(mut self, check: BalanceCheckFn) -> Self {
        self.check_balance = Some(check);
        self
    }

    /// Boot sweep, then spawn the worker loops and the periodic sweep.
    /// Resolves once every loop has drained after cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let swept = self
            .jobs
            .fail_stale(now_ms() - BOOT_STALE_AGE.as_millis() as i64, STALE_JOB_MESSAGE)
            .await
            .context("boot stale sweep")?;
        if swept > 0 {
            warn!(count = swept, "boot sweep failed stale running jobs");
        }

        let mut set = JoinSet::new();
        for worker in 0..self.config.workers.max(1) {
            let scheduler = self.clone();
            let cancel = cancel.clone();
            set.spawn(async move { scheduler.worker_loop(worker, cancel).await });
        }
        {
            let scheduler = self.clone();
            let cancel = cancel.clone();
            set.spawn(async move { scheduler.sweep_loop(cancel).await });
        }
        info!(workers = self.config.workers, "scheduler started");

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "scheduler task panicked");
            }
        }
        info!("scheduler drained");
        Ok(())
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        debug!(worker, "scheduler worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.run_once(&cancel).await {
                // Claimed and ran a job: immediately look for the next one.
                Ok(true) => continue,
                Ok(false) => {},
                Err(e) => warn!(worker, error = %e, "scheduler pass failed"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {},
                () = cancel.cancelled() => break,
            }
        }
        debug!(worker, "scheduler worker stopped");
    }

    async fn sweep_loop(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(STALE_SWEEP_INTERVAL) => {},
                () = cancel.cancelled() => break,
            }
            let cutoff = now_ms() - self.config.stale_job_age.as_millis() as i64;
            match self.jobs.fail_stale(cutoff, STALE_JOB_MESSAGE).await {
                Ok(0) => {},
                Ok(count) => warn!(count, "stale sweep failed running jobs"),
                Err(e) => warn!(error = %e, "stale sweep failed"),
            }
        }
    }

    /// Claim and fully run one job. Returns `false` when nothing was
    /// eligible; that is the quiet path, not an error.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<bool> {
        let stale_cutoff = now_ms() - self.config.stale_job_age.as_millis() as i64;
        let Some(job) = self.jobs.claim_pending(stale_cutoff).await? else {
            return Ok(false);
        };

        info!(job_id = %job.id, user_id = %job.user_id, tier = %job.tier, "claimed crawl job");
        let _busy = self.idle.as_ref().map(|idle| idle.background_work());

        if let Err(e) = self.run_claimed(&job, cancel).await {
            error!(job_id = %job.id, error = %e, "crawl job failed");
            let outcome = JobOutcome::failed(e.to_string(), None);
            if let Err(e) = self.jobs.finish_job(&job.id, outcome).await {
                error!(job_id = %job.id, error = %e, "failed to write terminal job row");
            }
            self.notify(&job.id, "job.failed").await;
        }
        Ok(true)
    }

    async fn run_claimed(&self, job: &Job, cancel: &CancellationToken) -> Result<()> {
        let chain: Vec<AttemptConfig> = serde_json::from_value(job.config_chain.clone())
            .context("corrupt config chain snapshot")?;
        let options: CrawlOptions = serde_json::from_value(job.crawl_options.clone())
            .context("corrupt crawl options")?;
        let start_url = Url::parse(&job.url).context("invalid job URL")?;

        let crawl = CrawlJob {
            start_url,
            schema: job.schema.clone(),
            chain,
            options,
            is_byok: job.is_byok,
        };

        let callbacks = CrawlCallbacks {
            on_result: self.result_sink(job),
            on_urls_queued: Some(self.progress_sink(job)),
            check_balance: self.check_balance.clone(),
        };

        let summary = self
            .engine
            .crawl(crawl, callbacks, cancel.child_token())
            .await?;

        self.jobs
            .set_discovery_method(&job.id, summary.discovery_method)
            .await?;

        let outcome = match summary.stop_reason {
            None | Some(StopReason::MaxPagesReached) => JobOutcome::completed(),
            Some(StopReason::InsufficientBalance) => {
                JobOutcome::failed("insufficient balance", Some("quota_exceeded".into()))
            },
            Some(StopReason::CallbackError) => {
                JobOutcome::failed("failed to persist page results", None)
            },
            Some(StopReason::Cancelled) => {
                JobOutcome::failed("cancelled during shutdown", Some("timeout".into()))
            },
        };
        let failed = outcome.status == JobStatus::Failed;
        self.jobs.finish_job(&job.id, outcome).await?;

        info!(
            job_id = %job.id,
            pages = summary.pages_attempted,
            discovery = summary.discovery_method,
            stop = ?summary.stop_reason,
            "crawl job finished"
        );
        self.notify(&job.id, if failed { "job.failed" } else { "job.completed" })
            .await;
        Ok(())
    }

    /// Persists each page outcome; a storage error stops the crawl.
    fn result_sink(&self, job: &Job) -> quarry_crawler::OnResultFn {
        let jobs = self.jobs.clone();
        let dispatcher = self.dispatcher.clone();
        let job_id = job.id.clone();
        let is_byok = job.is_byok;
        Arc::new(move |outcome: PageOutcome| {
            let jobs = jobs.clone();
            let dispatcher = dispatcher.clone();
            let job_id = job_id.clone();
            Box::pin(async move {
                let new = to_job_result(&job_id, is_byok, outcome);
                jobs.add_result(new).await.context("persist page result")?;

                // Per-page events ride the same delivery machinery as the
                // job lifecycle events.
                if let Ok(Some(job)) = jobs.get_job(&job_id).await
                    && let Err(e) = dispatcher.dispatch_job_event(&job, "page.completed").await
                {
                    warn!(job_id = %job_id, error = %e, "page webhook dispatch failed");
                }
                Ok(())
            })
        })
    }

    fn progress_sink(&self, job: &Job) -> quarry_crawler::OnUrlsQueuedFn {
        let jobs = self.jobs.clone();
        let job_id = job.id.clone();
        Arc::new(move |count| {
            let jobs = jobs.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move {
                if let Err(e) = jobs.set_urls_queued(&job_id, count as i64).await {
                    warn!(job_id = %job_id, error = %e, "urls_queued update failed");
                }
            });
        })
    }

    async fn notify(&self, job_id: &str, event: &str) {
        let job = match self.jobs.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                warn!(job_id, error = %e, "job reload for webhook failed");
                return;
            },
        };
        if let Err(e) = self.dispatcher.dispatch_job_event(&job, event).await {
            warn!(job_id, event, error = %e, "webhook dispatch failed");
        }
    }
}

/// Convert an engine page outcome into a store row.
fn to_job_result(job_id: &str, is_byok: bool, outcome: PageOutcome) -> NewJobResult {
    let mut new = NewJobResult {
        job_id: job_id.to_string(),
        url: outcome.url,
        parent_url: outcome.parent_url,
        depth: i64::from(outcome.depth),
        crawl_status: CrawlStatus::Failed,
        data: None,
        error_message: None,
        error_details: None,
        error_category: None,
        provider: None,
        model: None,
        is_byok,
        retry_count: 0,
        input_tokens: 0,
        output_tokens: 0,
        cost_usd: 0.0,
        llm_cost_usd: 0.0,
        fetch_duration_ms: outcome.fetch_duration_ms,
        extract_duration_ms: outcome.extract_duration_ms,
        discovered_at_ms: outcome.discovered_at_ms,
    };

    match outcome.outcome {
        PageOutcomeKind::Extracted(result) => {
            new.crawl_status = CrawlStatus::Completed;
            new.data = Some(result.extraction.data);
            new.provider = Some(result.provider);
            new.model = Some(result.model);
            new.retry_count = result.retry_count;
            new.input_tokens = result.extraction.input_tokens;
            new.output_tokens = result.extraction.output_tokens;
            new.cost_usd = result.extraction.cost_usd;
            new.llm_cost_usd = result.extraction.llm_cost_usd;
        },
        PageOutcomeKind::FetchFailed(message) => {
            new.error_message = Some("page fetch failed".into());
            new.error_details = Some(message);
        },
        PageOutcomeKind::ExtractFailed(failure) => {
            new.error_message = Some(failure.message);
            new.error_category = Some(failure.category.as_str().to_string());
        },
    }
    new
}
