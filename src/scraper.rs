//! Listing-source collaborator boundary. The monitor only depends on the
//! [`ListingSource`] trait; `HttpListingSource` talks to an external scraper
//! service over HTTP and stays ignorant of how that service obtains listings.
use crate::config::Search;
use crate::model::Listing;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Pause between per-keyword requests, mimicking a human-paced client.
const KEYWORD_PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("listing source unreachable: {0}")]
    Http(#[from] reqwest::Error),
    #[error("listing source error {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("listing fetch timed out")]
    Timeout,
    #[error("fetch cancelled by shutdown")]
    Cancelled,
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch up to `max_listings` listings matching `criteria`, in source
    /// order. One logical fetch; the caller owns retry policy.
    async fn search(
        &self,
        criteria: &Search,
        max_listings: usize,
    ) -> Result<Vec<Listing>, ScrapeError>;
}

pub struct HttpListingSource {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for HttpListingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpListingSource")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpListingSource {
    pub fn new(base_url: Url, request_timeout: Duration) -> Self {
        let http = Client::builder()
            .user_agent("marketwatch/0.1")
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self { http, base_url }
    }

    fn search_url(
        &self,
        keyword: &str,
        criteria: &Search,
        limit: usize,
    ) -> Result<Url, ScrapeError> {
        let mut url = self
            .base_url
            .join("v1/search")
            .map_err(|_| ScrapeError::Status {
                status: StatusCode::BAD_REQUEST,
                body: "invalid listing source base URL".into(),
            })?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("query", keyword);
            q.append_pair("limit", &limit.to_string());
            if !criteria.location.is_empty() {
                q.append_pair("location", &criteria.location);
                q.append_pair("radius_miles", &criteria.radius_miles.to_string());
            }
            if let Some(min) = criteria.min_price {
                q.append_pair("min_price", &min.to_string());
            }
            if let Some(max) = criteria.max_price {
                q.append_pair("max_price", &max.to_string());
            }
            for category in &criteria.categories {
                q.append_pair("category", category);
            }
        }
        Ok(url)
    }

    async fn fetch_keyword(
        &self,
        keyword: &str,
        criteria: &Search,
        limit: usize,
    ) -> Result<Vec<Listing>, ScrapeError> {
        let url = self.search_url(keyword, criteria, limit)?;
        debug!(%url, "fetching listings");
        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "listing source returned error");
            return Err(ScrapeError::Status { status, body });
        }
        Ok(res.json::<Vec<Listing>>().await?)
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn search(
        &self,
        criteria: &Search,
        max_listings: usize,
    ) -> Result<Vec<Listing>, ScrapeError> {
        let mut combined = Vec::new();
        let mut first_err: Option<ScrapeError> = None;
        let mut succeeded = false;
        let keywords: Vec<&String> = criteria
            .keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .collect();
        for (i, keyword) in keywords.iter().enumerate() {
            match self.fetch_keyword(keyword, criteria, max_listings).await {
                Ok(mut batch) => {
                    succeeded = true;
                    combined.append(&mut batch);
                }
                Err(err) => {
                    // A failing keyword is skipped; the sweep continues.
                    warn!(%keyword, ?err, "keyword fetch failed");
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
            if combined.len() >= max_listings {
                break;
            }
            if i + 1 < keywords.len() {
                tokio::time::sleep(KEYWORD_PAUSE).await;
            }
        }
        if !succeeded {
            if let Some(err) = first_err {
                return Err(err);
            }
        }
        combined.truncate(max_listings);
        Ok(combined)
    }
}
