//! Minimal robots.txt support, applied only when a job opts in.

use std::time::Duration;

use url::Url;

use crate::fetch::{FetchMode, Fetcher};

/// Rules for the `*` user-agent.
#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    disallow: Vec<String>,
    pub crawl_delay: Option<Duration>,
}

impl RobotsPolicy {
    /// Parse the `User-agent: *` group of a robots.txt body.
    #[must_use]
    pub fn parse(body: &str) -> Self {
        let mut policy = Self::default();
        let mut in_star_group = false;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => in_star_group = value == "*",
                "disallow" if in_star_group && !value.is_empty() => {
                    policy.disallow.push(value.to_string());
                },
                "crawl-delay" if in_star_group => {
                    if let Ok(secs) = value.parse::<f64>() {
                        policy.crawl_delay = Some(Duration::from_secs_f64(secs.max(0.0)));
                    }
                },
                _ => {},
            }
        }
        policy
    }

    /// Whether a URL's path is fetchable under the disallow rules.
    #[must_use]
    pub fn allows(&self, url: &Url) -> bool {
        let path = url.path();
        !self.disallow.iter().any(|prefix| path.starts_with(prefix))
    }
}

/// Fetch and parse `{origin}/robots.txt`; absent or unreadable files
/// allow everything.
pub async fn fetch(fetcher: &dyn Fetcher, start: &Url) -> RobotsPolicy {
    let Ok(url) = start.join("/robots.txt") else {
        return RobotsPolicy::default();
    };
    match fetcher.fetch(&url, FetchMode::Static).await {
        Ok(page) => RobotsPolicy::parse(&page.content),
        Err(_) => RobotsPolicy::default(),
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "\
User-agent: googlebot\n\
Disallow: /google-only\n\
\n\
User-agent: *\n\
Disallow: /admin\n\
Disallow: /private/\n\
Crawl-delay: 1.5\n\
# comment\n\
Allow: /admin/public\n";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn star_group_rules_apply() {
        let policy = RobotsPolicy::parse(BODY);
        assert!(!policy.allows(&url("https://example.com/admin")));
        assert!(!policy.allows(&url("https://example.com/private/x")));
        assert!(policy.allows(&url("https://example.com/blog")));
        // Other agents' rules are ignored.
        assert!(policy.allows(&url("https://example.com/google-only")));
    }

    #[test]
    fn crawl_delay_parses() {
        let policy = RobotsPolicy::parse(BODY);
        assert_eq!(policy.crawl_delay, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn empty_body_allows_everything() {
        let policy = RobotsPolicy::parse("");
        assert!(policy.allows(&url("https://example.com/anything")));
        assert!(policy.crawl_delay.is_none());
    }
}
