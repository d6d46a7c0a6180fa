//! Content-addressed payload cache.
//!
//! Payloads are identified by the lower-case hex SHA-256 of their bytes, so
//! storing the same content twice is a no-op and the hash doubles as a stable
//! download key.

pub mod blob;
pub mod error;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use sha2::{Digest, Sha256};

use herald_common::config::CacheSettings;
use herald_common::types::{PayloadRef, PayloadVariant};

pub use blob::{BlobStore, ByteStream, LocalBlobStore};
#[cfg(any(test, feature = "mock"))]
pub use blob::MemoryBlobStore;
pub use error::{CacheError, Result};

/// Result of [`ContentCache::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    pub content_hash: String,
    pub size_bytes: u64,
    /// `false` when identical content was already cached.
    pub newly_stored: bool,
}

/// Lower-case hex SHA-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether `hash` looks like a value produced by [`content_hash`].
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Payload cache over a [`BlobStore`], with an HTTP client for fetching
/// payloads from their origin.
#[derive(Clone)]
pub struct ContentCache {
    blobs: Arc<dyn BlobStore>,
    http: reqwest::Client,
    settings: CacheSettings,
}

impl ContentCache {
    pub fn new(blobs: Arc<dyn BlobStore>, settings: CacheSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.fetch_timeout)
            .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(blobs, http, settings))
    }

    pub fn with_client(
        blobs: Arc<dyn BlobStore>,
        http: reqwest::Client,
        settings: CacheSettings,
    ) -> Self {
        tracing::info!(backend = blobs.name(), root = %settings.root.display(), "Content cache ready");
        Self {
            blobs,
            http,
            settings,
        }
    }

    /// Store `data`, returning its content hash.
    pub async fn put(&self, data: Bytes) -> Result<Stored> {
        let hash = content_hash(&data);
        let size_bytes = data.len() as u64;
        let newly_stored = self.blobs.put(&hash, data).await?;
        Ok(Stored {
            content_hash: hash,
            size_bytes,
            newly_stored,
        })
    }

    /// Stream the payload stored under `hash`.
    pub async fn get(&self, hash: &str) -> Result<ByteStream> {
        if !is_valid_hash(hash) {
            return Err(CacheError::InvalidHash(hash.to_string()));
        }
        self.blobs.open(hash).await
    }

    pub async fn contains(&self, hash: &str) -> Result<bool> {
        if !is_valid_hash(hash) {
            return Ok(false);
        }
        self.blobs.exists(hash).await
    }

    /// Download a payload variant from its origin and cache it.
    ///
    /// Transient failures are retried up to `fetch_retries` attempts in total,
    /// doubling the delay between attempts.
    pub async fn fetch_and_store(&self, variant: &PayloadVariant) -> Result<PayloadRef> {
        let url = variant.origin_url.as_str();
        let mut attempt = 1;
        let data = loop {
            match self.download(url).await {
                Ok(data) => break data,
                Err(e) if e.is_transient() && attempt < self.settings.fetch_retries => {
                    let delay = self.settings.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        url,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Payload download failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let stored = self.put(data).await?;
        tracing::debug!(
            url,
            hash = %stored.content_hash,
            size = stored.size_bytes,
            new = stored.newly_stored,
            "Payload cached"
        );

        Ok(PayloadRef {
            content_hash: stored.content_hash,
            origin_url: variant.origin_url.clone(),
            quality: variant.quality.clone(),
            size_bytes: stored.size_bytes,
            stored_at: Utc::now(),
        })
    }

    /// Materialize several variants with at most `limit` downloads in flight.
    /// Results are returned in input order.
    pub async fn fetch_all(
        &self,
        variants: &[PayloadVariant],
        limit: usize,
    ) -> Vec<Result<PayloadRef>> {
        let downloads = variants.iter().cloned().map(|variant| {
            let cache = self.clone();
            async move { cache.fetch_and_store(&variant).await }
        });
        futures::stream::iter(downloads)
            .buffered(limit.max(1))
            .collect()
            .await
    }

    /// Single download attempt, bounded in time and size.
    async fn download(&self, url: &str) -> Result<Bytes> {
        let limit = self.settings.max_payload_bytes;
        let attempt = async {
            let mut response = self.http.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(CacheError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let too_large = || CacheError::TooLarge {
                url: url.to_string(),
                limit,
            };
            if let Some(len) = response.content_length()
                && len > limit
            {
                return Err(too_large());
            }

            let mut buf = BytesMut::new();
            while let Some(chunk) = response.chunk().await? {
                if (buf.len() + chunk.len()) as u64 > limit {
                    return Err(too_large());
                }
                buf.extend_from_slice(&chunk);
            }
            Ok(buf.freeze())
        };

        tokio::time::timeout(self.settings.fetch_timeout, attempt)
            .await
            .map_err(|_| CacheError::Timeout(url.to_string()))?
    }
}
