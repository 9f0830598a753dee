//! Per-job crawl options, serialized onto the job row.

use serde::{Deserialize, Serialize};

/// Hard ceiling on per-job worker count.
pub const MAX_CONCURRENCY: usize = 10;
/// Default per-job worker count.
pub const DEFAULT_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlOptions {
    pub max_depth: u32,
    /// Cap on distinct URLs entering the frontier.
    pub max_urls: u32,
    /// Cap on extracted pages; 0 = unlimited.
    pub max_pages: u32,
    pub same_domain_only: bool,
    pub use_sitemap: bool,
    /// Only links matching this regex are enqueued.
    pub follow_pattern: Option<String>,
    /// Only anchors matching this CSS selector contribute candidates.
    pub follow_selector: Option<String>,
    pub concurrency: usize,
    /// Render pages through the dynamic (browser) fetcher.
    pub dynamic: bool,
    /// Run extraction on seed URLs themselves (always on in sitemap mode).
    pub extract_from_seeds: bool,
    // Off by default to match observed production behavior; exposed so
    // general-purpose crawls can opt in.
    pub honour_robots_txt: bool,
    pub honour_crawl_delay: bool,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_urls: 100,
            max_pages: 0,
            same_domain_only: true,
            use_sitemap: false,
            follow_pattern: None,
            follow_selector: None,
            concurrency: DEFAULT_CONCURRENCY,
            dynamic: false,
            extract_from_seeds: true,
            honour_robots_txt: false,
            honour_crawl_delay: false,
        }
    }
}

impl CrawlOptions {
    /// Worker count clamped to `1..=MAX_CONCURRENCY`.
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    /// Sitemap mode is batch single-page extraction: no link discovery,
    /// seeds are extracted directly, selectors are ignored.
    #[must_use]
    pub fn for_sitemap_mode(mut self) -> Self {
        self.max_depth = 0;
        self.extract_from_seeds = true;
        self.follow_selector = None;
        self
    }
}
