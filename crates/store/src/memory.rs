//! In-memory store for testing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use herald_common::types::{
    DeliveryStatus, DownloadEntry, Item, Notification, PayloadRef, Source, SourceState,
};

use crate::{Discovery, DownloadLog, ItemStore, NotificationLog, SourceStateStore};

#[derive(Default)]
struct Inner {
    items: HashMap<Uuid, Item>,
    keys: HashMap<(Source, String), Uuid>,
    /// Insertion order, used as a tie-breaker for "most recent".
    order: Vec<Uuid>,
    states: HashMap<Source, SourceState>,
    notifications: HashMap<(Uuid, String), Notification>,
    downloads: Vec<DownloadEntry>,
}

/// Store that keeps everything in a single mutex-guarded map set.
///
/// Every trait method takes the lock once, which makes each operation atomic
/// with respect to concurrent callers, just like the single-statement
/// PostgreSQL implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded items in discovery order.
    pub async fn items(&self) -> Vec<Item> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.items.get(id).cloned())
            .collect()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.inner.lock().await.notifications.values().cloned().collect()
    }

    pub async fn downloads(&self) -> Vec<DownloadEntry> {
        self.inner.lock().await.downloads.clone()
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn check_and_record(&self, item: &Item) -> anyhow::Result<Discovery> {
        let mut inner = self.inner.lock().await;
        let key = (item.source, item.external_id.clone());

        if let Some(existing) = inner.keys.get(&key).and_then(|id| inner.items.get(id)) {
            return Ok(Discovery::Existing(existing.clone()));
        }

        let mut recorded = item.clone();
        recorded.announced = false;
        recorded.payload_refs.clear();

        inner.keys.insert(key, recorded.id);
        inner.order.push(recorded.id);
        inner.items.insert(recorded.id, recorded.clone());
        Ok(Discovery::New(recorded))
    }

    async fn append_payload_ref(
        &self,
        item_id: Uuid,
        payload: &PayloadRef,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let item = inner
            .items
            .get_mut(&item_id)
            .ok_or_else(|| anyhow::anyhow!("unknown item {}", item_id))?;

        if item
            .payload_refs
            .iter()
            .any(|r| r.content_hash == payload.content_hash)
        {
            return Ok(false);
        }
        item.payload_refs.push(payload.clone());
        Ok(true)
    }

    async fn claim_announcement(&self, item_id: Uuid) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let item = inner
            .items
            .get_mut(&item_id)
            .ok_or_else(|| anyhow::anyhow!("unknown item {}", item_id))?;

        if item.announced {
            return Ok(false);
        }
        item.announced = true;
        Ok(true)
    }

    async fn revise(&self, item_id: Uuid, revised: &Item) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let item = inner
            .items
            .get_mut(&item_id)
            .ok_or_else(|| anyhow::anyhow!("unknown item {}", item_id))?;

        item.title = revised.title.clone();
        item.episode = revised.episode;
        item.published_at = revised.published_at;
        Ok(())
    }

    async fn get_item(&self, item_id: Uuid) -> anyhow::Result<Option<Item>> {
        Ok(self.inner.lock().await.items.get(&item_id).cloned())
    }

    async fn recent_items(&self, source: Source, limit: i64) -> anyhow::Result<Vec<Item>> {
        let inner = self.inner.lock().await;
        let mut items: Vec<(usize, &Item)> = inner
            .order
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| inner.items.get(id).map(|item| (pos, item)))
            .filter(|(_, item)| item.source == source && item.announced)
            .collect();
        items.sort_by(|(pa, a), (pb, b)| {
            b.discovered_at
                .cmp(&a.discovered_at)
                .then_with(|| pb.cmp(pa))
        });
        Ok(items
            .into_iter()
            .take(usize::try_from(limit).unwrap_or_default())
            .map(|(_, item)| item.clone())
            .collect())
    }
}

#[async_trait]
impl SourceStateStore for MemoryStore {
    async fn load(&self, source: Source) -> anyhow::Result<SourceState> {
        Ok(self
            .inner
            .lock()
            .await
            .states
            .get(&source)
            .cloned()
            .unwrap_or_else(|| SourceState::new(source)))
    }

    async fn save(&self, state: &SourceState) -> anyhow::Result<()> {
        self.inner
            .lock()
            .await
            .states
            .insert(state.source, state.clone());
        Ok(())
    }
}

#[async_trait]
impl NotificationLog for MemoryStore {
    async fn begin(&self, item_id: Uuid, channel: &str) -> anyhow::Result<Notification> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .notifications
            .entry((item_id, channel.to_string()))
            .or_insert_with(|| Notification {
                item_id,
                channel: channel.to_string(),
                status: DeliveryStatus::Pending,
                attempts: 0,
                last_error: None,
                updated_at: Utc::now(),
            });
        Ok(record.clone())
    }

    async fn record_attempt(
        &self,
        item_id: Uuid,
        channel: &str,
        status: DeliveryStatus,
        attempts: i32,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.notifications.get_mut(&(item_id, channel.to_string()))
            && record.status != DeliveryStatus::Delivered
        {
            record.status = status;
            record.attempts = attempts;
            record.last_error = error.map(str::to_string);
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get(&self, item_id: Uuid, channel: &str) -> anyhow::Result<Option<Notification>> {
        Ok(self
            .inner
            .lock()
            .await
            .notifications
            .get(&(item_id, channel.to_string()))
            .cloned())
    }
}

#[async_trait]
impl DownloadLog for MemoryStore {
    async fn record(&self, entry: &DownloadEntry) -> anyhow::Result<()> {
        self.inner.lock().await.downloads.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use herald_common::types::EpisodeInfo;

    use super::*;

    fn make_item(source: Source, external_id: &str) -> Item {
        Item {
            id: Uuid::new_v4(),
            source,
            external_id: external_id.to_string(),
            title: format!("Release {}", external_id),
            episode: None,
            page_url: None,
            poster_url: None,
            published_at: Utc::now(),
            discovered_at: Utc::now(),
            announced: false,
            payload_refs: Vec::new(),
        }
    }

    fn make_ref(hash: &str) -> PayloadRef {
        PayloadRef {
            content_hash: hash.to_string(),
            origin_url: format!("https://example.org/{}", hash),
            quality: Some("1080p".to_string()),
            size_bytes: 42,
            stored_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_check_and_record_is_new_once() {
        let store = MemoryStore::new();
        let first = make_item(Source::Kinozal, "100");
        let second = make_item(Source::Kinozal, "100");

        let d1 = store.check_and_record(&first).await.unwrap();
        let d2 = store.check_and_record(&second).await.unwrap();

        assert!(d1.is_new());
        assert!(!d2.is_new());
        // The stored identity wins over the fresh canonical one.
        assert_eq!(d2.item().id, first.id);
        assert_eq!(store.items().await.len(), 1);
    }

    #[tokio::test]
    async fn test_same_external_id_in_other_source_is_distinct() {
        let store = MemoryStore::new();
        assert!(store.check_and_record(&make_item(Source::Kinozal, "1")).await.unwrap().is_new());
        assert!(store.check_and_record(&make_item(Source::LostFilm, "1")).await.unwrap().is_new());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_callers_see_exactly_one_new() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .check_and_record(&make_item(Source::LostFilm, "race"))
                    .await
                    .unwrap()
                    .is_new()
            }));
        }

        let mut new_count = 0;
        for handle in handles {
            if handle.await.unwrap() {
                new_count += 1;
            }
        }
        assert_eq!(new_count, 1);
    }

    #[tokio::test]
    async fn test_append_payload_ref_idempotent_by_hash() {
        let store = MemoryStore::new();
        let item = store
            .check_and_record(&make_item(Source::Kinozal, "7"))
            .await
            .unwrap()
            .into_item();

        assert!(store.append_payload_ref(item.id, &make_ref("aa")).await.unwrap());
        assert!(!store.append_payload_ref(item.id, &make_ref("aa")).await.unwrap());
        assert!(store.append_payload_ref(item.id, &make_ref("bb")).await.unwrap());

        let stored = store.get_item(item.id).await.unwrap().unwrap();
        let hashes: Vec<&str> = stored.payload_refs.iter().map(|r| r.content_hash.as_str()).collect();
        assert_eq!(hashes, vec!["aa", "bb"]);
    }

    #[tokio::test]
    async fn test_claim_announcement_once() {
        let store = MemoryStore::new();
        let item = store
            .check_and_record(&make_item(Source::Kinozal, "9"))
            .await
            .unwrap()
            .into_item();

        assert!(store.claim_announcement(item.id).await.unwrap());
        assert!(!store.claim_announcement(item.id).await.unwrap());

        let again = store.check_and_record(&make_item(Source::Kinozal, "9")).await.unwrap();
        assert!(again.item().announced);
    }

    #[tokio::test]
    async fn test_delivered_notification_is_terminal() {
        let store = MemoryStore::new();
        let item_id = Uuid::new_v4();

        let pending = store.begin(item_id, "telegram").await.unwrap();
        assert_eq!(pending.status, DeliveryStatus::Pending);

        store
            .record_attempt(item_id, "telegram", DeliveryStatus::Delivered, 1, None)
            .await
            .unwrap();
        store
            .record_attempt(item_id, "telegram", DeliveryStatus::Failed, 2, Some("late"))
            .await
            .unwrap();

        let record = store.begin(item_id, "telegram").await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts, 1);
    }

    async fn record_announced(store: &MemoryStore, source: Source, external_id: &str) -> Item {
        let item = store
            .check_and_record(&make_item(source, external_id))
            .await
            .unwrap()
            .into_item();
        store.claim_announcement(item.id).await.unwrap();
        item
    }

    #[tokio::test]
    async fn test_recent_items_newest_first() {
        let store = MemoryStore::new();
        for id in ["a", "b", "c"] {
            record_announced(&store, Source::Kinozal, id).await;
        }
        record_announced(&store, Source::LostFilm, "x").await;

        let recent = store.recent_items(Source::Kinozal, 2).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_recent_items_hide_unannounced() {
        let store = MemoryStore::new();
        record_announced(&store, Source::Kinozal, "out").await;
        store
            .check_and_record(&make_item(Source::Kinozal, "deferred"))
            .await
            .unwrap();

        let recent = store.recent_items(Source::Kinozal, 10).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["out"]);
    }

    #[tokio::test]
    async fn test_revise_replaces_listing_metadata() {
        let store = MemoryStore::new();
        let item = record_announced(&store, Source::Kinozal, "pack").await;
        store.append_payload_ref(item.id, &make_ref("aa")).await.unwrap();

        let mut revised = make_item(Source::Kinozal, "pack");
        revised.title = "Foundation (1 сезон: 1-9 серии)".to_string();
        revised.episode = Some(EpisodeInfo {
            season: 1,
            episode_from: Some(1),
            episode_to: Some(9),
        });
        store.revise(item.id, &revised).await.unwrap();

        let stored = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.id, item.id);
        assert_eq!(stored.title, revised.title);
        assert_eq!(stored.episode, revised.episode);
        assert!(stored.announced);
        assert_eq!(stored.payload_refs.len(), 1);
    }

    #[tokio::test]
    async fn test_source_state_defaults_then_persists() {
        let store = MemoryStore::new();
        let mut state = store.load(Source::LostFilm).await.unwrap();
        assert_eq!(state, SourceState::new(Source::LostFilm));

        state.last_cursor = Some("page-2".to_string());
        state.consecutive_failures = 3;
        store.save(&state).await.unwrap();

        assert_eq!(store.load(Source::LostFilm).await.unwrap(), state);
    }
}
