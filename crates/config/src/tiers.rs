//! Tier limits: hardcoded defaults overlaid by remote `tier_settings.json`.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};

/// Quota/priority bundle bound to a tenant's tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub monthly_extractions: u64,
    pub max_pages_per_crawl: u32,
    /// 0 = unlimited.
    pub max_concurrent_jobs: u32,
    pub job_priority: i64,
    pub requests_per_minute: u32,
}

/// Partial override from `tier_settings.json`; unset fields keep defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TierOverride {
    pub monthly_extractions: Option<u64>,
    pub max_pages_per_crawl: Option<u32>,
    pub max_concurrent_jobs: Option<u32>,
    pub job_priority: Option<i64>,
    pub requests_per_minute: Option<u32>,
}

impl TierLimits {
    fn overlaid(mut self, over: &TierOverride) -> Self {
        if let Some(v) = over.monthly_extractions {
            self.monthly_extractions = v;
        }
        if let Some(v) = over.max_pages_per_crawl {
            self.max_pages_per_crawl = v;
        }
        if let Some(v) = over.max_concurrent_jobs {
            self.max_concurrent_jobs = v;
        }
        if let Some(v) = over.job_priority {
            self.job_priority = v;
        }
        if let Some(v) = over.requests_per_minute {
            self.requests_per_minute = v;
        }
        self
    }
}

/// Built-in tiers. Priorities drive `ClaimPending` ordering.
fn builtin_tiers() -> HashMap<String, TierLimits> {
    HashMap::from([
        ("free".to_string(), TierLimits {
            monthly_extractions: 500,
            max_pages_per_crawl: 10,
            max_concurrent_jobs: 2,
            job_priority: 2,
            requests_per_minute: 10,
        }),
        ("standard".to_string(), TierLimits {
            monthly_extractions: 5_000,
            max_pages_per_crawl: 100,
            max_concurrent_jobs: 5,
            job_priority: 10,
            requests_per_minute: 60,
        }),
        ("pro".to_string(), TierLimits {
            monthly_extractions: 50_000,
            max_pages_per_crawl: 1_000,
            max_concurrent_jobs: 20,
            job_priority: 50,
            requests_per_minute: 300,
        }),
        ("selfhosted".to_string(), TierLimits {
            monthly_extractions: 0,
            max_pages_per_crawl: 0,
            max_concurrent_jobs: 0,
            job_priority: 100,
            requests_per_minute: 0,
        }),
    ])
}

/// Effective tier table.
///
/// Readers take the lock only long enough to clone the `Arc`; the refresh
/// loop is the sole writer and swaps the whole map atomically.
pub struct TierTable {
    inner: RwLock<Arc<HashMap<String, TierLimits>>>,
}

impl Default for TierTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TierTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(builtin_tiers())),
        }
    }

    /// Limits for a tier; unknown tiers get `free` limits.
    #[must_use]
    pub fn get(&self, tier: &str) -> TierLimits {
        let map = self.snapshot();
        map.get(tier)
            .or_else(|| map.get("free"))
            .copied()
            .unwrap_or(TierLimits {
                monthly_extractions: 0,
                max_pages_per_crawl: 10,
                max_concurrent_jobs: 1,
                job_priority: 0,
                requests_per_minute: 10,
            })
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<HashMap<String, TierLimits>> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Rebuild the table as builtin defaults + overrides and swap it in.
    pub fn apply_overrides(&self, overrides: &HashMap<String, TierOverride>) {
        let mut map = builtin_tiers();
        for (tier, over) in overrides {
            let base = map.get(tier).copied().unwrap_or_else(|| {
                // A remote-only tier starts from free defaults.
                map["free"]
            });
            map.insert(tier.clone(), base.overlaid(over));
        }
        *self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(map);
    }
}
