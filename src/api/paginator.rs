//! Walks the paginated posts listing until the API runs out of pages.
//!
//! The first request carries no `page` parameter and tells us how many pages
//! the API claims to have. Pages `2..=total_pages` are then requested with a
//! small amount of concurrency but handed out strictly in page order, so
//! termination behaves exactly as a sequential walk would: the first
//! "invalid page" answer ends pagination and anything fetched after it is
//! discarded.

use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{ApiClient, FetchError, PageResponse};
use crate::config::Config;

/// One page of raw records.
#[derive(Debug, Clone)]
pub struct Page {
    pub number: u32,
    pub total_pages: u32,
    pub records: Vec<Value>,
}

pub struct Paginator<'a> {
    client: &'a ApiClient,
    concurrency: usize,
    max_pages: u32,
}

impl<'a> Paginator<'a> {
    #[must_use]
    pub fn new(client: &'a ApiClient, config: &Config) -> Self {
        Self {
            client,
            concurrency: config.fetch_concurrency.max(1),
            max_pages: config.max_pages,
        }
    }

    /// Fetch every page and return all records in page order.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, on a failed initial request, or
    /// when the API declares more pages than the configured limit.
    pub async fn fetch_all(&self) -> Result<Vec<Value>, FetchError> {
        let mut pages = self.open().await?;
        let mut records = Vec::new();
        while let Some(page) = pages.next_page().await? {
            records.extend(page.records);
        }
        Ok(records)
    }

    /// Issue the initial request and return a stream over all pages.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial request fails in any way, or if the
    /// declared page count exceeds the configured limit.
    pub async fn open(&self) -> Result<PageStream<'a>, FetchError> {
        let body = match self.client.fetch_page(None).await? {
            PageResponse::Page(body) => body,
            PageResponse::InvalidPage => {
                info!("API reported an invalid page on the initial request; nothing to fetch");
                return Ok(PageStream::empty());
            }
            PageResponse::Rejected { status, body } => {
                return Err(FetchError::Status { status, body });
            }
            PageResponse::Malformed { error, .. } => return Err(FetchError::Decode(error)),
        };

        let total_pages = body.total_pages.unwrap_or(1);
        if total_pages > self.max_pages {
            return Err(FetchError::PageLimitExceeded {
                declared: total_pages,
                limit: self.max_pages,
            });
        }

        let records = body.posts.unwrap_or_else(|| {
            warn!(page = 1, "No 'posts' key in response, treating page as empty");
            Vec::new()
        });
        info!(total_pages, first_page_records = records.len(), "Starting pagination");

        let client = self.client;
        let rest = stream::iter(2..=total_pages)
            .map(move |number| async move { (number, client.fetch_page(Some(number)).await) })
            .buffered(self.concurrency)
            .boxed();

        Ok(PageStream {
            first: Some(Page {
                number: 1,
                total_pages,
                records,
            }),
            total_pages,
            rest,
            skipped: 0,
            done: false,
        })
    }
}

/// Pages in order, ending at `total_pages` or at the first invalid-page answer.
pub struct PageStream<'a> {
    first: Option<Page>,
    total_pages: u32,
    rest: BoxStream<'a, (u32, Result<PageResponse, FetchError>)>,
    skipped: u32,
    done: bool,
}

impl PageStream<'_> {
    fn empty() -> Self {
        Self {
            first: None,
            total_pages: 0,
            rest: stream::empty().boxed(),
            skipped: 0,
            done: true,
        }
    }

    /// Declared page count from the initial response.
    #[must_use]
    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    /// Pages skipped so far because of error or malformed responses.
    #[must_use]
    pub fn skipped_pages(&self) -> u32 {
        self.skipped
    }

    /// Next page with records, or `None` once pagination has ended.
    ///
    /// A page without a `posts` key is yielded with no records. Pages answered
    /// with any error other than the invalid-page signal are logged and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Transport`] when a request fails after retries;
    /// the stream is finished afterwards.
    pub async fn next_page(&mut self) -> Result<Option<Page>, FetchError> {
        if let Some(first) = self.first.take() {
            return Ok(Some(first));
        }

        while !self.done {
            let Some((number, result)) = self.rest.next().await else {
                self.done = true;
                break;
            };

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            };

            match response {
                PageResponse::Page(body) => {
                    let records = body.posts.unwrap_or_else(|| {
                        warn!(page = number, "No 'posts' key in response, treating page as empty");
                        Vec::new()
                    });
                    debug!(page = number, records = records.len(), "Page received");
                    return Ok(Some(Page {
                        number,
                        total_pages: self.total_pages,
                        records,
                    }));
                }
                PageResponse::InvalidPage => {
                    info!(
                        page = number,
                        total_pages = self.total_pages,
                        "API reported invalid page parameter, stopping pagination"
                    );
                    self.done = true;
                }
                PageResponse::Rejected { status, body } => {
                    self.skipped += 1;
                    warn!(page = number, %status, body = %body, "Error fetching page, skipping");
                }
                PageResponse::Malformed { status, error } => {
                    self.skipped += 1;
                    warn!(page = number, %status, error = %error, "Malformed page body, skipping");
                }
            }
        }

        Ok(None)
    }
}
