//! Durable pipeline state.
//!
//! The store is the only place where concurrent crawls meet, so every
//! operation that decides "who goes first" is a single atomic statement:
//! discovery is a compare-and-insert on `(source, external_id)`, announcement
//! is a compare-and-set on the `announced` flag, and payload attachment is
//! idempotent by content hash.

#[cfg(any(test, feature = "mock"))]
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use herald_common::types::{
    DeliveryStatus, DownloadEntry, Item, Notification, PayloadRef, Source, SourceState,
};

#[cfg(any(test, feature = "mock"))]
pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Outcome of [`ItemStore::check_and_record`].
#[derive(Debug, Clone, PartialEq)]
pub enum Discovery {
    /// First sighting; the item was recorded by this call.
    New(Item),
    /// Already recorded by an earlier (or racing) call. Carries the stored
    /// record, which may differ from the freshly canonicalized one.
    Existing(Item),
}

impl Discovery {
    pub fn is_new(&self) -> bool {
        matches!(self, Discovery::New(_))
    }

    pub fn item(&self) -> &Item {
        match self {
            Discovery::New(item) | Discovery::Existing(item) => item,
        }
    }

    pub fn into_item(self) -> Item {
        match self {
            Discovery::New(item) | Discovery::Existing(item) => item,
        }
    }
}

/// Dedup store and item repository.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Atomically record `item` unless `(item.source, item.external_id)` is
    /// already known. Exactly one of any number of racing callers sees `New`.
    async fn check_and_record(&self, item: &Item) -> anyhow::Result<Discovery>;

    /// Attach a cached payload to an item. Idempotent by content hash;
    /// returns `true` when the ref was newly attached.
    async fn append_payload_ref(&self, item_id: Uuid, payload: &PayloadRef)
    -> anyhow::Result<bool>;

    /// Flip the item's `announced` flag. Returns `true` for the single caller
    /// that performed the flip; that caller alone publishes the item.
    async fn claim_announcement(&self, item_id: Uuid) -> anyhow::Result<bool>;

    /// Overwrite the listing metadata (title, episode, publish time) of an
    /// item whose source entry was re-released under the same identifier.
    async fn revise(&self, item_id: Uuid, revised: &Item) -> anyhow::Result<()>;

    async fn get_item(&self, item_id: Uuid) -> anyhow::Result<Option<Item>>;

    /// Most recently discovered announced items of a source, newest first.
    /// Items still waiting for their announcement are left out.
    async fn recent_items(&self, source: Source, limit: i64) -> anyhow::Result<Vec<Item>>;
}

/// Per-source crawl bookkeeping.
#[async_trait]
pub trait SourceStateStore: Send + Sync {
    /// Load the state of `source`, or a fresh one on first crawl.
    async fn load(&self, source: Source) -> anyhow::Result<SourceState>;

    async fn save(&self, state: &SourceState) -> anyhow::Result<()>;
}

/// Delivery bookkeeping for the notification dispatcher.
#[async_trait]
pub trait NotificationLog: Send + Sync {
    /// Create the pending record for `(item_id, channel)`, or return the
    /// existing one untouched.
    async fn begin(&self, item_id: Uuid, channel: &str) -> anyhow::Result<Notification>;

    /// Record the outcome of a delivery attempt. A record already marked
    /// delivered is never changed.
    async fn record_attempt(
        &self,
        item_id: Uuid,
        channel: &str,
        status: DeliveryStatus,
        attempts: i32,
        error: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn get(&self, item_id: Uuid, channel: &str) -> anyhow::Result<Option<Notification>>;
}

/// Access log of payload downloads served by the delivery layer.
#[async_trait]
pub trait DownloadLog: Send + Sync {
    async fn record(&self, entry: &DownloadEntry) -> anyhow::Result<()>;
}
