//! URL discovery and the bounded-concurrency crawl engine.

pub mod engine;
pub mod fetch;
pub mod frontier;
pub mod links;
pub mod options;
pub mod politeness;
pub mod robots;
pub mod sitemap;

pub use {
    engine::{
        BalanceCheckFn, CrawlCallbacks, CrawlEngine, CrawlJob, CrawlSummary, OnResultFn,
        OnUrlsQueuedFn, PageOutcome, PageOutcomeKind, StopReason,
    },
    fetch::{FetchError, FetchMode, FetchedPage, Fetcher, HttpFetcher},
    frontier::{Frontier, QueuedUrl, canonicalize},
    options::CrawlOptions,
};
