//! Anchor extraction with optional CSS-selector scoping.

use {
    scraper::{Html, Selector},
    tracing::warn,
    url::Url,
};

/// Extract candidate links from a page.
///
/// With a `follow_selector`, only matching anchors contribute; otherwise
/// every `a[href]` does. Relative hrefs resolve against `base`.
#[must_use]
pub fn extract_links(html: &str, base: &Url, follow_selector: Option<&str>) -> Vec<Url> {
    let document = Html::parse_document(html);

    let selector = match follow_selector {
        Some(raw) => match Selector::parse(raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(selector = raw, error = %e, "invalid follow_selector, no links followed");
                return Vec::new();
            },
        },
        None => match Selector::parse("a[href]") {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        },
    };

    let mut links = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        if let Ok(url) = base.join(href) {
            links.push(url);
        }
    }
    links
}
