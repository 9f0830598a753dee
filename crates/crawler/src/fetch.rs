//! Page fetching. Static mode is a plain GET; dynamic mode proxies
//! through an external rendering service when one is configured.

use std::time::Duration;

use {async_trait::async_trait, serde::Deserialize, thiserror::Error, tracing::debug, url::Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Static,
    Dynamic,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: Url,
    pub status: u16,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out fetching {url}")]
    Timeout { url: String },

    #[error("fetch failed for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url, mode: FetchMode) -> Result<FetchedPage, FetchError>;
}

/// Production fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    /// Dynamic-render service endpoint; `None` degrades dynamic fetches to
    /// static ones.
    render_service_url: Option<String>,
}

const USER_AGENT: &str = concat!("quarry/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct RenderResponse {
    html: String,
    #[serde(default)]
    status: Option<u16>,
}

impl HttpFetcher {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        timeout: Duration,
        render_service_url: Option<String>,
    ) -> Self {
        Self {
            client,
            timeout,
            render_service_url,
        }
    }

    async fn fetch_static(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| to_fetch_error(url, &e))?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        if !(200..300).contains(&status) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        let content = response
            .text()
            .await
            .map_err(|e| to_fetch_error(url, &e))?;
        Ok(FetchedPage {
            final_url,
            status,
            content,
        })
    }

    async fn fetch_dynamic(&self, url: &Url, endpoint: &str) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .json(&serde_json::json!({"url": url.as_str()}))
            .send()
            .await
            .map_err(|e| to_fetch_error(url, &e))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        let rendered: RenderResponse = response.json().await.map_err(|e| to_fetch_error(url, &e))?;
        Ok(FetchedPage {
            final_url: url.clone(),
            status: rendered.status.unwrap_or(200),
            content: rendered.html,
        })
    }
}

fn to_fetch_error(url: &Url, e: &reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, mode: FetchMode) -> Result<FetchedPage, FetchError> {
        match (mode, self.render_service_url.as_deref()) {
            (FetchMode::Dynamic, Some(endpoint)) => self.fetch_dynamic(url, endpoint).await,
            (FetchMode::Dynamic, None) => {
                debug!(url = %url, "no render service configured, fetching statically");
                self.fetch_static(url).await
            },
            (FetchMode::Static, _) => self.fetch_static(url).await,
        }
    }
}
