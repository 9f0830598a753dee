//! Category-aware retry, backoff, and cross-provider fallback.
//!
//! Walks the frozen attempt chain in position order. Each entry gets the
//! initial call plus up to `MAX_RETRY_ATTEMPTS` retries for retryable
//! categories; rate limits suspend the key (shared, exponential) and sleep
//! at least the rate-limit floor. Fallback-worthy failures move to the next
//! entry after a short delay; `content_too_long` and `unknown` are terminal.

use std::{sync::Arc, time::Duration};

use {
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use {
    quarry_llm::{
        AttemptConfig, ErrorCategory, ExtractFailure, ExtractRequest, Extraction, Extractor,
    },
    quarry_store::{SuspensionStore, types::now_ms},
};

/// Retries per entry after the initial call.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;
/// First retry delay; doubles per retry.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
/// Retry delay cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Minimum sleep after a 429.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(5);
/// Pause before moving to the next chain entry.
pub const PROVIDER_FALLBACK_DELAY: Duration = Duration::from_secs(1);

/// Successful extraction plus which entry produced it.
#[derive(Debug, Clone)]
pub struct FallbackResult {
    pub extraction: Extraction,
    pub provider: String,
    pub model: String,
    /// Retries consumed on the winning entry (0 = first call succeeded).
    pub retry_count: i64,
}

pub struct FallbackExecutor {
    extractor: Arc<dyn Extractor>,
    suspensions: Arc<dyn SuspensionStore>,
}

enum EntryOutcome {
    Success(Box<FallbackResult>),
    /// Move on to the next entry, optionally after the fallback delay.
    FallThrough { failure: ExtractFailure, delay: bool },
    Terminal(ExtractFailure),
}

impl FallbackExecutor {
    #[must_use]
    pub fn new(extractor: Arc<dyn Extractor>, suspensions: Arc<dyn SuspensionStore>) -> Self {
        Self {
            extractor,
            suspensions,
        }
    }

    /// Run the chain to completion or terminal failure.
    pub async fn execute(
        &self,
        chain: &[AttemptConfig],
        request: &ExtractRequest,
        cancel: &CancellationToken,
    ) -> Result<FallbackResult, ExtractFailure> {
        if chain.is_empty() {
            return Err(ExtractFailure::new(
                ErrorCategory::InvalidKey,
                "no usable extraction config: chain is empty",
            ));
        }

        let mut last_failure: Option<ExtractFailure> = None;
        for (index, entry) in chain.iter().enumerate() {
            if self.key_suspended(entry).await {
                debug!(provider = %entry.provider, "skipping suspended key");
                continue;
            }

            match self.run_entry(entry, request, cancel).await {
                EntryOutcome::Success(result) => return Ok(*result),
                EntryOutcome::Terminal(failure) => return Err(failure),
                EntryOutcome::FallThrough { failure, delay } => {
                    warn!(
                        provider = %entry.provider,
                        model = %entry.model,
                        category = %failure.category,
                        "chain entry failed, falling through"
                    );
                    last_failure = Some(failure);
                    let not_last = index + 1 < chain.len();
                    if delay && not_last && !sleep_cancellable(PROVIDER_FALLBACK_DELAY, cancel).await
                    {
                        return Err(ExtractFailure::canonical(ErrorCategory::Timeout));
                    }
                },
            }
        }

        Err(last_failure.unwrap_or_else(|| {
            ExtractFailure::new(
                ErrorCategory::InvalidKey,
                "no usable extraction config: all keys suspended",
            )
        }))
    }

    async fn run_entry(
        &self,
        entry: &AttemptConfig,
        request: &ExtractRequest,
        cancel: &CancellationToken,
    ) -> EntryOutcome {
        let mut backoff = INITIAL_BACKOFF;
        let mut retries: u32 = 0;
        let mut failure: ExtractFailure;

        loop {
            if cancel.is_cancelled() {
                return EntryOutcome::Terminal(ExtractFailure::canonical(ErrorCategory::Timeout));
            }

            let attempt = tokio::select! {
                () = cancel.cancelled() => {
                    return EntryOutcome::Terminal(ExtractFailure::canonical(ErrorCategory::Timeout));
                },
                result = self.extractor.extract(entry, request) => result,
            };

            match attempt {
                Ok(extraction) => {
                    // A success ends any suspension window for this key.
                    let _ = self.suspensions.clear_suspension(&entry.api_key_hash).await;
                    return EntryOutcome::Success(Box::new(FallbackResult {
                        extraction,
                        provider: entry.provider.clone(),
                        model: entry.model.clone(),
                        retry_count: i64::from(retries),
                    }));
                },
                Err(f) => failure = f,
            }

            let category = failure.category;
            let can_retry = retries < MAX_RETRY_ATTEMPTS;

            match category {
                ErrorCategory::RateLimit => {
                    if let Err(e) = self
                        .suspensions
                        .record_rate_limit(&entry.api_key_hash, now_ms())
                        .await
                    {
                        warn!(error = %e, "failed to record key suspension");
                    }
                    if !can_retry {
                        break;
                    }
                    // Floor keeps hammered providers breathing room; the
                    // exponential curve only matters once it clears 5s.
                    if !sleep_cancellable(backoff.max(RATE_LIMIT_BACKOFF), cancel).await {
                        return EntryOutcome::Terminal(ExtractFailure::canonical(
                            ErrorCategory::Timeout,
                        ));
                    }
                },
                c if c.retryable_with_same_model() => {
                    if !can_retry {
                        break;
                    }
                    if !sleep_cancellable(backoff, cancel).await {
                        return EntryOutcome::Terminal(ExtractFailure::canonical(
                            ErrorCategory::Timeout,
                        ));
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                },
                _ => break,
            }
            retries += 1;
        }

        self.entry_failure_outcome(entry, failure).await
    }

    /// Decide what a non-retryable (or retries-exhausted) entry failure
    /// means for the rest of the chain.
    async fn entry_failure_outcome(
        &self,
        entry: &AttemptConfig,
        failure: ExtractFailure,
    ) -> EntryOutcome {
        match failure.category {
            c if c.should_fallback() => EntryOutcome::FallThrough {
                failure,
                delay: true,
            },
            ErrorCategory::InvalidKey | ErrorCategory::QuotaExceeded => {
                // A dead key is suspended so later jobs skip it quickly,
                // but only when the tenant owns it; a platform key outage
                // must not lock every tenant out.
                if entry.byok
                    && let Err(e) = self
                        .suspensions
                        .record_rate_limit(&entry.api_key_hash, now_ms())
                        .await
                {
                    warn!(error = %e, "failed to suspend BYOK key");
                }
                EntryOutcome::FallThrough {
                    failure,
                    delay: false,
                }
            },
            _ => EntryOutcome::Terminal(failure),
        }
    }

    async fn key_suspended(&self, entry: &AttemptConfig) -> bool {
        match self.suspensions.suspension(&entry.api_key_hash).await {
            Ok(Some(s)) => s.suspended_until_ms > now_ms(),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "suspension lookup failed, assuming key usable");
                false
            },
        }
    }
}

/// Sleep unless cancelled; returns `false` when the token fired.
async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}
