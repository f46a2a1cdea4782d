//! Client for the upstream posts API.

mod models;
pub mod paginator;

pub use models::*;
pub use paginator::{Page, PageStream, Paginator};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, CONNECTION};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::backoff::backoff_delay;
use crate::config::Config;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request for page {page} failed: {source}")]
    Transport {
        page: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("initial request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("initial response is not a posts listing: {0}")]
    Decode(String),
    #[error("API declares {declared} pages, above the limit of {limit}")]
    PageLimitExceeded { declared: u32, limit: u32 },
    #[error("pagination cancelled")]
    Cancelled,
}

/// What one page request produced, before any pagination decision.
#[derive(Debug)]
pub enum PageResponse {
    /// Success status with a decodable listing body.
    Page(PageBody),
    /// The API says the requested page does not exist.
    InvalidPage,
    /// Success status, but the body is not a posts listing.
    Malformed { status: StatusCode, error: String },
    /// Non-success status with any other body.
    Rejected { status: StatusCode, body: String },
}

/// HTTP client carrying the static request headers the API expects.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    retries: u32,
}

impl ApiClient {
    /// Build a client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let base_url = Url::parse(&config.api_url)?;

        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        // Accept-Encoding is left to reqwest so it can decompress gzip/deflate/br.
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            base_url,
            retries: config.fetch_retries,
        })
    }

    /// URL for a page; `None` is the initial request without a page parameter.
    #[must_use]
    pub fn page_url(&self, page: Option<u32>) -> Url {
        let mut url = self.base_url.clone();
        if let Some(page) = page {
            url.query_pairs_mut().append_pair("page", &page.to_string());
        }
        url
    }

    /// Fetch and classify a single page.
    ///
    /// Transport failures are retried with backoff; HTTP responses never are.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Transport`] once the retries are exhausted.
    pub async fn fetch_page(&self, page: Option<u32>) -> Result<PageResponse, FetchError> {
        let url = self.page_url(page);
        let page_number = page.unwrap_or(1);
        let mut attempt = 0;

        let (status, body) = loop {
            match self.send(&url).await {
                Ok(response) => break response,
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    warn!(
                        page = page_number,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transport error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(FetchError::Transport {
                        page: page_number,
                        source,
                    })
                }
            }
        };

        debug!(page = page_number, %status, bytes = body.len(), "Fetched page");
        Ok(classify(status, &body))
    }

    async fn send(&self, url: &Url) -> Result<(StatusCode, String), reqwest::Error> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }
}

fn classify(status: StatusCode, body: &str) -> PageResponse {
    let parsed = serde_json::from_str::<Value>(body);

    if let Ok(value) = &parsed {
        if is_invalid_page_signal(value) {
            return PageResponse::InvalidPage;
        }
    }

    if !status.is_success() {
        return PageResponse::Rejected {
            status,
            body: body.to_string(),
        };
    }

    match parsed.and_then(serde_json::from_value::<PageBody>) {
        Ok(page) => PageResponse::Page(page),
        Err(e) => PageResponse::Malformed {
            status,
            error: e.to_string(),
        },
    }
}
