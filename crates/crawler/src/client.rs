use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use herald_common::types::Source;

/// Failure talking to an upstream source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Timeouts, connection errors, 5xx, undecodable bodies. Retried with
    /// backoff; never abandons the source.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The requested resource does not exist upstream.
    #[error("not found: {0}")]
    PermanentNotFound(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Transient(e.to_string())
    }
}

/// Order in which a source returns listing entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingOrder {
    NewestFirst,
    OldestFirst,
}

/// One page of raw listing entries.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Listing {
    pub entries: Vec<Value>,
    /// Continuation token for the next poll, when the source pages.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Upstream source of raw entries.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source(&self) -> Source;

    /// Both supported sources list newest entries first.
    fn listing_order(&self) -> ListingOrder {
        ListingOrder::NewestFirst
    }

    async fn fetch_listing(&self, cursor: Option<&str>) -> Result<Listing, FetchError>;

    /// Raw detail page of a single entry.
    async fn fetch_detail(&self, external_id: &str) -> Result<Value, FetchError>;
}

/// [`SourceClient`] for a scraper endpoint serving JSON:
/// `GET {base}/listing[?cursor=…]` and `GET {base}/items/{id}`.
pub struct HttpSourceClient {
    source: Source,
    base_url: reqwest::Url,
    http: reqwest::Client,
    order: ListingOrder,
}

impl HttpSourceClient {
    pub fn new(source: Source, base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let base_url = reqwest::Url::parse(&base_url.into())?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("{} cannot serve as a scraper base URL", base_url);
        }
        Ok(Self {
            source,
            base_url,
            http,
            order: ListingOrder::NewestFirst,
        })
    }

    pub fn with_order(mut self, order: ListingOrder) -> Self {
        self.order = order;
        self
    }

    /// Base URL extended by path segments, each percent-encoded on its own.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| FetchError::Transient(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, FetchError> {
        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::PermanentNotFound(what.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!("{} returned HTTP {}", what, status)));
        }
        response
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("undecodable {}: {}", what, e)))
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    fn source(&self) -> Source {
        self.source
    }

    fn listing_order(&self) -> ListingOrder {
        self.order
    }

    async fn fetch_listing(&self, cursor: Option<&str>) -> Result<Listing, FetchError> {
        let mut request = self.http.get(self.endpoint(&["listing"])?);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        self.get_json(request, "listing").await
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<Value, FetchError> {
        let request = self.http.get(self.endpoint(&["items", external_id])?);
        self.get_json(request, &format!("item {}", external_id)).await
    }
}
