//! Shared application state for the Axum router.

use std::collections::HashMap;
use std::sync::Arc;

use herald_cache::ContentCache;
use herald_common::types::Source;
use herald_crawler::CrawlerHandle;
use herald_store::{DownloadLog, ItemStore};

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub items: Arc<dyn ItemStore>,
    pub downloads: Arc<dyn DownloadLog>,
    pub cache: ContentCache,
    /// Handles of the running crawlers, one per enabled source.
    pub crawlers: Arc<HashMap<Source, CrawlerHandle>>,
    /// Base URL used to build download links.
    pub public_url: String,
}

impl AppState {
    pub fn new(
        items: Arc<dyn ItemStore>,
        downloads: Arc<dyn DownloadLog>,
        cache: ContentCache,
        crawlers: HashMap<Source, CrawlerHandle>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            items,
            downloads,
            cache,
            crawlers: Arc::new(crawlers),
            public_url: public_url.into(),
        }
    }
}
