//! Sitemap discovery and parsing.

use {
    quick_xml::{Reader, events::Event},
    tracing::debug,
    url::Url,
};

use crate::fetch::{FetchMode, Fetcher};

/// Nested sitemaps followed from a sitemap index.
const MAX_NESTED_SITEMAPS: usize = 5;

/// Try `{origin}/sitemap.xml`; returns the seed URLs when one exists.
pub async fn discover(fetcher: &dyn Fetcher, start: &Url) -> Option<Vec<Url>> {
    let origin = start.join("/sitemap.xml").ok()?;
    let page = fetcher.fetch(&origin, FetchMode::Static).await.ok()?;

    let (urls, nested) = parse(&page.content);
    let mut seeds: Vec<Url> = urls.iter().filter_map(|u| Url::parse(u).ok()).collect();

    // A sitemap index lists further sitemaps instead of pages.
    for sitemap_url in nested.into_iter().take(MAX_NESTED_SITEMAPS) {
        let Ok(url) = Url::parse(&sitemap_url) else {
            continue;
        };
        if let Ok(page) = fetcher.fetch(&url, FetchMode::Static).await {
            let (urls, _) = parse(&page.content);
            seeds.extend(urls.iter().filter_map(|u| Url::parse(u).ok()));
        }
    }

    if seeds.is_empty() {
        debug!(url = %origin, "sitemap fetched but contained no URLs");
        return None;
    }
    Some(seeds)
}

/// Extract `<loc>` values, split into page URLs and nested sitemap URLs.
#[must_use]
pub fn parse(xml: &str) -> (Vec<String>, Vec<String>) {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut pages = Vec::new();
    let mut sitemaps = Vec::new();
    let mut in_loc = false;
    let mut in_sitemap_entry = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"loc" => in_loc = true,
                b"sitemap" => in_sitemap_entry = true,
                _ => {},
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"loc" => in_loc = false,
                b"sitemap" => in_sitemap_entry = false,
                _ => {},
            },
            Ok(Event::Text(text)) if in_loc => {
                if let Ok(value) = text.unescape() {
                    let value = value.trim().to_string();
                    if !value.is_empty() {
                        if in_sitemap_entry {
                            sitemaps.push(value);
                        } else {
                            pages.push(value);
                        }
                    }
                }
            },
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {},
        }
    }

    (pages, sitemaps)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_urlset() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://example.com/</loc><lastmod>2024-01-01</lastmod></url>
              <url><loc>https://example.com/about</loc></url>
              <url><loc> https://example.com/blog </loc></url>
            </urlset>"#;

        let (pages, sitemaps) = parse(xml);
        assert_eq!(pages, vec![
            "https://example.com/",
            "https://example.com/about",
            "https://example.com/blog",
        ]);
        assert!(sitemaps.is_empty());
    }

    #[test]
    fn parses_sitemap_index() {
        let xml = r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <sitemap><loc>https://example.com/sitemap-posts.xml</loc></sitemap>
              <sitemap><loc>https://example.com/sitemap-pages.xml</loc></sitemap>
            </sitemapindex>"#;

        let (pages, sitemaps) = parse(xml);
        assert!(pages.is_empty());
        assert_eq!(sitemaps.len(), 2);
    }

    #[test]
    fn malformed_xml_yields_nothing() {
        let (pages, sitemaps) = parse("this is not xml <loc>");
        assert!(pages.is_empty());
        assert!(sitemaps.is_empty());
    }
}
