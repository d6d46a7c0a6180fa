//! Blob backends holding payload bytes keyed by content hash.

use std::path::{Path, PathBuf};
#[cfg(any(test, feature = "mock"))]
use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
#[cfg(any(test, feature = "mock"))]
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::error::{CacheError, Result};

/// Streamed payload bytes, as handed to the delivery layer.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Storage for content-addressed blobs.
///
/// Hashes are validated by [`ContentCache`](crate::ContentCache) before they
/// reach a backend.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Backend name, for logging.
    fn name(&self) -> &str;

    async fn exists(&self, hash: &str) -> Result<bool>;

    /// Store `data` under `hash` unless a blob with that hash is already
    /// present. Returns `true` only for the call that actually wrote it.
    async fn put(&self, hash: &str, data: Bytes) -> Result<bool>;

    /// Open a blob for streaming reads.
    async fn open(&self, hash: &str) -> Result<ByteStream>;
}

/// Blobs on the local filesystem, fanned out as `ab/cd/abcd…`.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[0..2]).join(&hash[2..4]).join(hash)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(hash)).await?)
    }

    async fn put(&self, hash: &str, data: Bytes) -> Result<bool> {
        let target = self.path_for(hash);
        if tokio::fs::try_exists(&target).await? {
            return Ok(false);
        }

        let dir = target
            .parent()
            .ok_or_else(|| CacheError::InvalidHash(hash.to_string()))?;
        tokio::fs::create_dir_all(dir).await?;

        // Write privately, then publish with a hard link: the link fails if a
        // racing writer published first, and readers never see partial files.
        let staging = dir.join(format!(".{}.{}.tmp", hash, Uuid::new_v4()));
        let written = tokio::fs::write(&staging, &data).await;
        discard_on_error(&staging, written).await?;

        let linked = tokio::fs::hard_link(&staging, &target).await;
        let removed = tokio::fs::remove_file(&staging).await;
        let published = match linked {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => false,
            Err(e) => return Err(e.into()),
        };
        removed?;

        if published {
            tracing::debug!(hash, size = data.len(), path = %target.display(), "Stored blob");
        }
        Ok(published)
    }

    async fn open(&self, hash: &str) -> Result<ByteStream> {
        match tokio::fs::File::open(self.path_for(hash)).await {
            Ok(file) => Ok(ReaderStream::new(file).boxed()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Remove a partially written staging file when its write failed.
async fn discard_on_error(path: &Path, result: std::io::Result<()>) -> std::io::Result<()> {
    if result.is_err() {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove staging file")
            }
        }
    }
    result
}

/// In-memory blob backend for testing.
#[cfg(any(test, feature = "mock"))]
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

#[cfg(any(test, feature = "mock"))]
impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[cfg(any(test, feature = "mock"))]
#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(hash))
    }

    async fn put(&self, hash: &str, data: Bytes) -> Result<bool> {
        let mut blobs = self.blobs.write().await;
        if blobs.contains_key(hash) {
            return Ok(false);
        }
        blobs.insert(hash.to_string(), data);
        Ok(true)
    }

    async fn open(&self, hash: &str) -> Result<ByteStream> {
        let data = self
            .blobs
            .read()
            .await
            .get(hash)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(hash.to_string()))?;
        Ok(futures::stream::once(async move { Ok(data) }).boxed())
    }
}
