//! Per-job BFS frontier with a canonicalized seen-set.

use std::collections::{HashSet, VecDeque};

use {regex::Regex, tracing::debug, url::Url};

use crate::options::CrawlOptions;

/// One not-yet-fetched URL.
#[derive(Debug, Clone)]
pub struct QueuedUrl {
    pub url: Url,
    pub parent: Option<String>,
    pub depth: u32,
}

/// Canonical form used for dedup: lowercase scheme+host, no fragment,
/// trailing slash collapsed, query preserved.
#[must_use]
pub fn canonicalize(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);

    let mut out = format!("{}://", url.scheme());
    if let Some(host) = url.host_str() {
        out.push_str(&host.to_lowercase());
    }
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }
    let path = url.path();
    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        // Root "/" and "" are the same page.
        ""
    };
    out.push_str(path);
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// BFS queue + seen-set for one job.
///
/// Not internally synchronized; the engine keeps it behind one mutex so
/// enqueue/dequeue decisions are serialized.
pub struct Frontier {
    queue: VecDeque<QueuedUrl>,
    seen: HashSet<String>,
    root_host: Option<String>,
    max_depth: u32,
    max_urls: u32,
    same_domain_only: bool,
    follow_pattern: Option<Regex>,
}

impl Frontier {
    /// Build a frontier seeded with the start URL at depth 0.
    pub fn new(start: &Url, options: &CrawlOptions) -> Result<Self, regex::Error> {
        let follow_pattern = options
            .follow_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;

        let mut frontier = Self {
            queue: VecDeque::new(),
            seen: HashSet::new(),
            root_host: start.host_str().map(str::to_lowercase),
            max_depth: options.max_depth,
            max_urls: options.max_urls,
            same_domain_only: options.same_domain_only,
            follow_pattern,
        };
        frontier.force_enqueue(start.clone(), None, 0);
        Ok(frontier)
    }

    /// Replace the queue with sitemap seeds at depth 0. Seeds bypass the
    /// follow filters but still respect dedup and `max_urls`.
    pub fn seed_from_sitemap(&mut self, urls: &[Url]) {
        self.queue.clear();
        self.seen.clear();
        self.max_depth = 0;
        for url in urls {
            if self.seen.len() as u32 >= self.max_urls {
                break;
            }
            if self.seen.insert(canonicalize(url)) {
                self.queue.push_back(QueuedUrl {
                    url: url.clone(),
                    parent: None,
                    depth: 0,
                });
            }
        }
    }

    /// Offer a discovered link. Returns `true` if it entered the queue.
    pub fn enqueue(&mut self, url: Url, parent: &Url, depth: u32) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        if depth > self.max_depth {
            return false;
        }
        if self.seen.len() as u32 >= self.max_urls {
            return false;
        }
        if self.same_domain_only {
            let host = url.host_str().map(str::to_lowercase);
            if host != self.root_host {
                return false;
            }
        }
        if let Some(pattern) = &self.follow_pattern
            && !pattern.is_match(url.as_str())
        {
            return false;
        }
        if !self.seen.insert(canonicalize(&url)) {
            return false;
        }

        debug!(url = %url, depth, "frontier enqueue");
        self.queue.push_back(QueuedUrl {
            url,
            parent: Some(parent.to_string()),
            depth,
        });
        true
    }

    fn force_enqueue(&mut self, url: Url, parent: Option<String>, depth: u32) {
        self.seen.insert(canonicalize(&url));
        self.queue.push_back(QueuedUrl { url, parent, depth });
    }

    pub fn pop(&mut self) -> Option<QueuedUrl> {
        self.queue.pop_front()
    }

    /// Distinct URLs ever accepted (queued or fetched).
    #[must_use]
    pub fn seen_count(&self) -> u64 {
        self.seen.len() as u64
    }

    #[must_use]
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn frontier(start: &str, options: CrawlOptions) -> Frontier {
        Frontier::new(&url(start), &options).unwrap()
    }

    #[test]
    fn canonicalization_rules() {
        assert_eq!(
            canonicalize(&url("HTTPS://Example.COM/About/")),
            canonicalize(&url("https://example.com/About"))
        );
        assert_eq!(
            canonicalize(&url("https://example.com/a#section")),
            canonicalize(&url("https://example.com/a"))
        );
        // Query survives.
        assert_ne!(
            canonicalize(&url("https://example.com/a?page=2")),
            canonicalize(&url("https://example.com/a"))
        );
        // Root slash collapses.
        assert_eq!(
            canonicalize(&url("https://example.com/")),
            canonicalize(&url("https://example.com"))
        );
    }

    #[test]
    fn start_url_is_queued_and_deduped() {
        let mut f = frontier("https://example.com", CrawlOptions::default());
        let item = f.pop().unwrap();
        assert_eq!(item.depth, 0);
        assert!(item.parent.is_none());

        // Re-discovering the start URL does nothing.
        assert!(!f.enqueue(url("https://example.com/"), &item.url, 1));
        assert!(f.is_empty());
    }

    #[test]
    fn depth_cap() {
        let mut f = frontier("https://example.com", CrawlOptions {
            max_depth: 1,
            ..CrawlOptions::default()
        });
        let start = f.pop().unwrap();
        assert!(f.enqueue(url("https://example.com/a"), &start.url, 1));
        assert!(!f.enqueue(url("https://example.com/b"), &start.url, 2));
    }

    #[test]
    fn max_urls_cap() {
        let mut f = frontier("https://example.com", CrawlOptions {
            max_urls: 3,
            ..CrawlOptions::default()
        });
        let start = f.pop().unwrap();
        assert!(f.enqueue(url("https://example.com/1"), &start.url, 1));
        assert!(f.enqueue(url("https://example.com/2"), &start.url, 1));
        // Seen set is at the cap (start + 2).
        assert!(!f.enqueue(url("https://example.com/3"), &start.url, 1));
        assert_eq!(f.seen_count(), 3);
    }

    #[test]
    fn same_domain_filter() {
        let mut f = frontier("https://example.com", CrawlOptions::default());
        let start = f.pop().unwrap();
        assert!(!f.enqueue(url("https://other.com/page"), &start.url, 1));
        assert!(!f.enqueue(url("https://sub.example.com/page"), &start.url, 1));
        assert!(f.enqueue(url("https://EXAMPLE.com/page"), &start.url, 1));
    }

    #[test]
    fn cross_domain_allowed_when_disabled() {
        let mut f = frontier("https://example.com", CrawlOptions {
            same_domain_only: false,
            ..CrawlOptions::default()
        });
        let start = f.pop().unwrap();
        assert!(f.enqueue(url("https://other.com/page"), &start.url, 1));
    }

    #[test]
    fn follow_pattern_filters_links() {
        let mut f = frontier("https://example.com", CrawlOptions {
            follow_pattern: Some(r"/blog/".into()),
            ..CrawlOptions::default()
        });
        let start = f.pop().unwrap();
        assert!(f.enqueue(url("https://example.com/blog/post-1"), &start.url, 1));
        assert!(!f.enqueue(url("https://example.com/about"), &start.url, 1));
    }

    #[test]
    fn non_http_schemes_rejected() {
        let mut f = frontier("https://example.com", CrawlOptions::default());
        let start = f.pop().unwrap();
        assert!(!f.enqueue(url("mailto:hi@example.com"), &start.url, 1));
        assert!(!f.enqueue(url("ftp://example.com/file"), &start.url, 1));
    }

    #[test]
    fn sitemap_seeding_replaces_queue() {
        let mut f = frontier("https://example.com", CrawlOptions::default());
        f.seed_from_sitemap(&[
            url("https://example.com/p1"),
            url("https://example.com/p2"),
            url("https://example.com/p1"),
        ]);

        assert_eq!(f.max_depth(), 0);
        let mut urls = Vec::new();
        while let Some(item) = f.pop() {
            assert_eq!(item.depth, 0);
            urls.push(item.url.to_string());
        }
        assert_eq!(urls, vec!["https://example.com/p1", "https://example.com/p2"]);
    }
}
