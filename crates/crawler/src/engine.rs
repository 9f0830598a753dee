//! Bounded-worker crawl engine.
//!
//! Workers pull from the shared frontier, fetch, extract through the
//! fallback executor, and emit one `PageOutcome` per attempted page via a
//! synchronous callback. Emission is serialized so results persist in
//! completion order.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    anyhow::Result,
    tokio::task::JoinSet,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    url::Url,
};

use {
    quarry_extract::{FallbackExecutor, FallbackResult},
    quarry_llm::{AttemptConfig, ExtractFailure, ExtractRequest},
};

use crate::{
    fetch::{FetchMode, Fetcher},
    frontier::{Frontier, QueuedUrl},
    links::extract_links,
    options::CrawlOptions,
    politeness::{DEFAULT_CRAWL_DELAY, HostGate},
    robots::{self, RobotsPolicy},
    sitemap,
};

/// Why a crawl stopped before draining its frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    InsufficientBalance,
    CallbackError,
    Cancelled,
    MaxPagesReached,
}

impl StopReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientBalance => "insufficient_balance",
            Self::CallbackError => "callback_error",
            Self::Cancelled => "cancelled",
            Self::MaxPagesReached => "max_pages_reached",
        }
    }
}

/// Outcome of one attempted page.
#[derive(Debug)]
pub struct PageOutcome {
    pub url: String,
    pub parent_url: Option<String>,
    pub depth: u32,
    pub outcome: PageOutcomeKind,
    pub fetch_duration_ms: i64,
    pub extract_duration_ms: i64,
    pub discovered_at_ms: i64,
}

#[derive(Debug)]
pub enum PageOutcomeKind {
    Extracted(FallbackResult),
    FetchFailed(String),
    ExtractFailed(ExtractFailure),
}

/// Synchronous result callback; an error stops the crawl.
pub type OnResultFn =
    Arc<dyn Fn(PageOutcome) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;
/// Progress callback with the current distinct-URL count.
pub type OnUrlsQueuedFn = Arc<dyn Fn(u64) + Send + Sync>;
/// Pre-extract balance probe for platform tenants; `false` stops the crawl.
pub type BalanceCheckFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<bool>> + Send>> + Send + Sync>;

/// Everything a single crawl needs.
#[derive(Clone)]
pub struct CrawlJob {
    pub start_url: Url,
    pub schema: serde_json::Value,
    pub chain: Vec<AttemptConfig>,
    pub options: CrawlOptions,
    pub is_byok: bool,
}

pub struct CrawlCallbacks {
    pub on_result: OnResultFn,
    pub on_urls_queued: Option<OnUrlsQueuedFn>,
    pub check_balance: Option<BalanceCheckFn>,
}

#[derive(Debug)]
pub struct CrawlSummary {
    /// `"sitemap"` or `"links"`.
    pub discovery_method: &'static str,
    pub stop_reason: Option<StopReason>,
    pub pages_attempted: u64,
}

pub struct CrawlEngine {
    fetcher: Arc<dyn Fetcher>,
    executor: Arc<FallbackExecutor>,
    crawl_delay: Duration,
}

struct CrawlCtx {
    fetcher: Arc<dyn Fetcher>,
    executor: Arc<FallbackExecutor>,
    gate: HostGate,
    frontier: Mutex<Frontier>,
    job: CrawlJob,
    sitemap_mode: bool,
    robots: Option<RobotsPolicy>,
    callbacks: CrawlCallbacks,
    cancel: CancellationToken,
    in_flight: AtomicUsize,
    pages_attempted: AtomicU64,
    /// Serializes emission so per-job results land in completion order.
    emit: tokio::sync::Mutex<()>,
    stop: Mutex<Option<StopReason>>,
}

impl CrawlEngine {
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>, executor: Arc<FallbackExecutor>) -> Self {
        Self {
            fetcher,
            executor,
            crawl_delay: DEFAULT_CRAWL_DELAY,
        }
    }

    /// Override the per-host politeness delay (tests use zero).
    #[must_use]
    pub fn with_crawl_delay(mut self, delay: Duration) -> Self {
        self.crawl_delay = delay;
        self
    }

    /// Run a crawl to completion, early stop, or cancellation. Pages
    /// emitted before a stop are preserved by the caller's callback.
    pub async fn crawl(
        &self,
        mut job: CrawlJob,
        callbacks: CrawlCallbacks,
        cancel: CancellationToken,
    ) -> Result<CrawlSummary> {
        // Discovery: sitemap seeding wins when requested and present.
        let mut sitemap_mode = false;
        let mut frontier = Frontier::new(&job.start_url, &job.options)?;
        if job.options.use_sitemap
            && let Some(seeds) = sitemap::discover(self.fetcher.as_ref(), &job.start_url).await
        {
            info!(count = seeds.len(), "seeding crawl from sitemap");
            job.options = job.options.clone().for_sitemap_mode();
            frontier.seed_from_sitemap(&seeds);
            sitemap_mode = true;
        }

        let robots_policy = if job.options.honour_robots_txt || job.options.honour_crawl_delay {
            Some(robots::fetch(self.fetcher.as_ref(), &job.start_url).await)
        } else {
            None
        };
        let crawl_delay = if job.options.honour_crawl_delay {
            robots_policy
                .as_ref()
                .and_then(|p| p.crawl_delay)
                .map_or(self.crawl_delay, |d| d.max(self.crawl_delay))
        } else {
            self.crawl_delay
        };
        let robots = if job.options.honour_robots_txt {
            robots_policy
        } else {
            None
        };

        let workers = job.options.effective_concurrency();
        let ctx = Arc::new(CrawlCtx {
            fetcher: self.fetcher.clone(),
            executor: self.executor.clone(),
            gate: HostGate::new(crawl_delay),
            frontier: Mutex::new(frontier),
            job,
            sitemap_mode,
            robots,
            callbacks,
            cancel,
            in_flight: AtomicUsize::new(0),
            pages_attempted: AtomicU64::new(0),
            emit: tokio::sync::Mutex::new(()),
            stop: Mutex::new(None),
        });

        ctx.report_urls_queued();

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let ctx = ctx.clone();
            set.spawn(async move { ctx.run_worker(worker).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "crawl worker panicked");
            }
        }

        let stop_reason = *lock(&ctx.stop);
        Ok(CrawlSummary {
            discovery_method: if ctx.sitemap_mode { "sitemap" } else { "links" },
            stop_reason,
            pages_attempted: ctx.pages_attempted.load(Ordering::SeqCst),
        })
    }
}

impl CrawlCtx {
    async fn run_worker(self: &Arc<Self>, worker: usize) {
        debug!(worker, "crawl worker started");
        loop {
            if self.cancel.is_cancelled() {
                self.request_stop(StopReason::Cancelled);
                break;
            }
            if lock(&self.stop).is_some() {
                break;
            }

            let item = lock(&self.frontier).pop();
            let Some(item) = item else {
                // Another worker may still discover links; only drain out
                // once nothing is in flight.
                if self.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
                continue;
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let outcome = self.process(item).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Err(reason) = outcome {
                self.request_stop(reason);
                break;
            }
        }
        debug!(worker, "crawl worker finished");
    }

    async fn process(self: &Arc<Self>, item: QueuedUrl) -> Result<(), StopReason> {
        let options = &self.job.options;
        if let Some(robots) = &self.robots
            && !robots.allows(&item.url)
        {
            debug!(url = %item.url, "skipping robots-disallowed url");
            return Ok(());
        }
        let should_extract = options.extract_from_seeds || item.depth > 0;

        if should_extract
            && options.max_pages > 0
            && self.pages_attempted.load(Ordering::SeqCst) >= u64::from(options.max_pages)
        {
            return Err(StopReason::MaxPagesReached);
        }

        if should_extract
            && !self.job.is_byok
            && let Some(check) = &self.callbacks.check_balance
        {
            match check().await {
                Ok(true) => {},
                Ok(false) => return Err(StopReason::InsufficientBalance),
                Err(e) => warn!(error = %e, "balance check failed, proceeding"),
            }
        }

        if let Some(host) = item.url.host_str() {
            self.gate.acquire(host).await;
        }

        let discovered_at_ms = chrono::Utc::now().timestamp_millis();
        let mode = if options.dynamic {
            FetchMode::Dynamic
        } else {
            FetchMode::Static
        };

        let fetch_started = std::time::Instant::now();
        let page = match self.fetcher.fetch(&item.url, mode).await {
            Ok(page) => page,
            Err(e) => {
                let fetch_ms = fetch_started.elapsed().as_millis() as i64;
                debug!(url = %item.url, error = %e, "fetch failed");
                self.emit(PageOutcome {
                    url: item.url.to_string(),
                    parent_url: item.parent.clone(),
                    depth: item.depth,
                    outcome: PageOutcomeKind::FetchFailed(e.to_string()),
                    fetch_duration_ms: fetch_ms,
                    extract_duration_ms: 0,
                    discovered_at_ms,
                })
                .await?;
                return Ok(());
            },
        };
        let fetch_ms = fetch_started.elapsed().as_millis() as i64;

        // Link discovery before extraction: the frontier fills while the
        // (much slower) LLM call runs on this worker.
        if !self.sitemap_mode && item.depth < options.max_depth {
            let links = extract_links(
                &page.content,
                &page.final_url,
                options.follow_selector.as_deref(),
            );
            let mut frontier = lock(&self.frontier);
            for link in links {
                frontier.enqueue(link, &item.url, item.depth + 1);
            }
            drop(frontier);
            self.report_urls_queued();
        }

        if !should_extract {
            return Ok(());
        }
        self.pages_attempted.fetch_add(1, Ordering::SeqCst);

        let request = ExtractRequest {
            url: item.url.to_string(),
            content: page.content,
            schema: self.job.schema.clone(),
        };
        let extract_started = std::time::Instant::now();
        let result = self
            .executor
            .execute(&self.job.chain, &request, &self.cancel)
            .await;
        let extract_ms = extract_started.elapsed().as_millis() as i64;

        let outcome = match result {
            Ok(success) => PageOutcomeKind::Extracted(success),
            Err(failure) => PageOutcomeKind::ExtractFailed(failure),
        };
        self.emit(PageOutcome {
            url: item.url.to_string(),
            parent_url: item.parent.clone(),
            depth: item.depth,
            outcome,
            fetch_duration_ms: fetch_ms,
            extract_duration_ms: extract_ms,
            discovered_at_ms,
        })
        .await?;

        if self.cancel.is_cancelled() {
            return Err(StopReason::Cancelled);
        }
        Ok(())
    }

    async fn emit(&self, outcome: PageOutcome) -> Result<(), StopReason> {
        let _guard = self.emit.lock().await;
        if let Err(e) = (self.callbacks.on_result)(outcome).await {
            warn!(error = %e, "result callback failed, stopping crawl");
            return Err(StopReason::CallbackError);
        }
        Ok(())
    }

    fn report_urls_queued(&self) {
        if let Some(report) = &self.callbacks.on_urls_queued {
            let count = lock(&self.frontier).seen_count();
            report(count);
        }
    }

    fn request_stop(&self, reason: StopReason) {
        let mut stop = lock(&self.stop);
        if stop.is_none() {
            *stop = Some(reason);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
