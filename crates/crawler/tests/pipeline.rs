//! End-to-end crawl scenarios against the in-memory store and blob backend,
//! a scripted source client and a local payload server.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde_json::{Value, json};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use herald_cache::{ContentCache, MemoryBlobStore};
use herald_canon::CanonicalizerRegistry;
use herald_common::config::{CacheSettings, CrawlSettings, DispatchSettings};
use herald_common::types::{DeliveryStatus, Item, Notification, Source};
use herald_crawler::{
    CrawlPhase, Crawler, FetchError, Listing, Pipeline, SourceClient, TickError, TriggerOutcome,
};
use herald_notifier::{DeliveryError, Dispatcher, Subscriber};
use herald_store::{MemoryStore, SourceStateStore};

// ───────────────────────────── payload server ─────────────────────────────

#[derive(Default)]
struct Served {
    failing: HashSet<String>,
    /// Re-releases per name; a revised name serves different bytes.
    revisions: HashMap<String, u32>,
}

type Shared = Arc<Mutex<Served>>;

struct PayloadServer {
    addr: SocketAddr,
    served: Shared,
}

impl PayloadServer {
    async fn start() -> Self {
        let served: Shared = Arc::default();
        let app = Router::new()
            .route(
                "/t/{name}",
                get(|State(served): State<Shared>, Path(name): Path<String>| async move {
                    let served = served.lock().unwrap();
                    if served.failing.contains(&name) {
                        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                    }
                    match served.revisions.get(&name) {
                        Some(rev) => format!("torrent:{}:r{}", name, rev).into_response(),
                        None => format!("torrent:{}", name).into_response(),
                    }
                }),
            )
            .with_state(served.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, served }
    }

    fn url(&self, name: &str) -> String {
        format!("http://{}/t/{}", self.addr, name)
    }

    fn fail(&self, name: &str) {
        self.served.lock().unwrap().failing.insert(name.to_string());
    }

    fn heal(&self) {
        self.served.lock().unwrap().failing.clear();
    }

    fn revise(&self, name: &str) {
        *self
            .served
            .lock()
            .unwrap()
            .revisions
            .entry(name.to_string())
            .or_default() += 1;
    }
}

// ───────────────────────────── scripted source ────────────────────────────

struct ScriptedClient {
    source: Source,
    listing: Mutex<Result<Listing, FetchError>>,
    details: Mutex<HashMap<String, Result<Value, FetchError>>>,
    cursors: Mutex<Vec<Option<String>>>,
    listing_calls: AtomicUsize,
    /// When set, every listing fetch waits for a permit.
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedClient {
    fn new(source: Source) -> Self {
        Self {
            source,
            listing: Mutex::new(Ok(Listing::default())),
            details: Mutex::default(),
            cursors: Mutex::default(),
            listing_calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    fn gated(source: Source, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(source)
        }
    }

    fn set_entries(&self, entries: Vec<Value>, next_cursor: Option<&str>) {
        *self.listing.lock().unwrap() = Ok(Listing {
            entries,
            next_cursor: next_cursor.map(str::to_string),
        });
    }

    fn set_failure(&self, error: FetchError) {
        *self.listing.lock().unwrap() = Err(error);
    }

    fn set_detail(&self, external_id: &str, detail: Result<Value, FetchError>) {
        self.details
            .lock()
            .unwrap()
            .insert(external_id.to_string(), detail);
    }
}

#[async_trait]
impl SourceClient for ScriptedClient {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch_listing(&self, cursor: Option<&str>) -> Result<Listing, FetchError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().unwrap().push(cursor.map(str::to_string));
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.listing.lock().unwrap().clone()
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<Value, FetchError> {
        self.details
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::PermanentNotFound(external_id.to_string())))
    }
}

// ───────────────────────────── subscriber ─────────────────────────────────

#[derive(Default)]
struct RecordingSubscriber {
    seen: Mutex<Vec<Item>>,
    /// External id whose first delivery never completes.
    hold: Mutex<Option<String>>,
    held: Notify,
}

impl RecordingSubscriber {
    fn hold(&self, external_id: &str) {
        *self.hold.lock().unwrap() = Some(external_id.to_string());
    }

    fn external_ids(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|item| item.external_id.clone())
            .collect()
    }
}

#[async_trait]
impl Subscriber for RecordingSubscriber {
    fn channel(&self) -> &str {
        "recording"
    }

    async fn on_new_item(&self, item: &Item) -> Result<(), DeliveryError> {
        let stall = {
            let mut hold = self.hold.lock().unwrap();
            if hold.as_deref() == Some(item.external_id.as_str()) {
                hold.take();
                true
            } else {
                false
            }
        };
        if stall {
            self.held.notify_one();
            std::future::pending::<()>().await;
        }
        self.seen.lock().unwrap().push(item.clone());
        Ok(())
    }
}

// ───────────────────────────── harness ────────────────────────────────────

struct Harness {
    store: Arc<MemoryStore>,
    client: Arc<ScriptedClient>,
    subscriber: Arc<RecordingSubscriber>,
    payloads: PayloadServer,
    pipeline: Pipeline,
    crawler: Crawler,
}

fn crawl_settings() -> CrawlSettings {
    CrawlSettings {
        interval: Duration::from_secs(3600),
        jitter: Duration::ZERO,
        poll_deadline: Duration::from_secs(10),
        fetch_timeout: Duration::from_secs(5),
        backoff_base: Duration::from_secs(10),
        backoff_cap: Duration::from_secs(60),
        payload_workers: 2,
        payload_required: true,
    }
}

async fn harness_with(client: ScriptedClient, settings: CrawlSettings) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(client);
    let subscriber = Arc::new(RecordingSubscriber::default());
    let payloads = PayloadServer::start().await;

    let cache = ContentCache::new(
        Arc::new(MemoryBlobStore::new()),
        CacheSettings {
            root: "memory".into(),
            fetch_timeout: Duration::from_secs(5),
            fetch_retries: 1,
            retry_base_delay: Duration::from_millis(1),
            max_payload_bytes: 1024 * 1024,
        },
    )
    .unwrap();

    let dispatcher = Dispatcher::new(
        store.clone(),
        DispatchSettings {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(30),
        },
    )
    .subscribe(subscriber.clone());

    let pipeline = Pipeline {
        canon: Arc::new(CanonicalizerRegistry::new()),
        items: store.clone(),
        states: store.clone(),
        cache,
        dispatcher: Arc::new(dispatcher),
    };
    let crawler = Crawler::new(client.clone(), pipeline.clone(), settings);

    Harness {
        store,
        client,
        subscriber,
        payloads,
        pipeline,
        crawler,
    }
}

async fn harness(source: Source) -> Harness {
    harness_with(ScriptedClient::new(source), crawl_settings()).await
}

impl Harness {
    /// Kinozal-style entry with a direct download link.
    fn kinozal_entry(&self, id: &str) -> Value {
        self.kinozal_entry_titled(id, &format!("Release {} (1080p)", id))
    }

    fn kinozal_entry_titled(&self, id: &str, title: &str) -> Value {
        json!({
            "id": id,
            "title": title,
            "download_url": self.payloads.url(id),
        })
    }

    fn notification_for(notifications: &[Notification], item: &Item) -> Notification {
        notifications
            .iter()
            .find(|n| n.item_id == item.id)
            .cloned()
            .unwrap()
    }
}

// ───────────────────────────── scenarios ──────────────────────────────────

#[tokio::test]
async fn test_new_items_are_published_oldest_first_then_only_new_ones() {
    let mut h = harness(Source::Kinozal).await;

    // Sources list newest first.
    let entries = vec![h.kinozal_entry("C"), h.kinozal_entry("B"), h.kinozal_entry("A")];
    h.client.set_entries(entries, None);

    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.entries, 3);
    assert_eq!(report.new_items, 3);
    assert_eq!(report.published, 3);
    assert_eq!(h.subscriber.external_ids(), vec!["A", "B", "C"]);

    let items = h.store.items().await;
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|item| item.announced && item.payload_refs.len() == 1));

    let entries = vec![
        h.kinozal_entry("D"),
        h.kinozal_entry("C"),
        h.kinozal_entry("B"),
        h.kinozal_entry("A"),
    ];
    h.client.set_entries(entries, None);

    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.new_items, 1);
    assert_eq!(report.published, 1);
    assert_eq!(h.subscriber.external_ids(), vec!["A", "B", "C", "D"]);
}

#[tokio::test]
async fn test_replayed_listing_is_idempotent() {
    let mut h = harness(Source::Kinozal).await;
    h.client
        .set_entries(vec![h.kinozal_entry("2"), h.kinozal_entry("1")], None);

    h.crawler.poll_once().await.unwrap();
    let replay = h.crawler.poll_once().await.unwrap();

    assert_eq!(replay.new_items, 0);
    assert_eq!(replay.published, 0);
    assert_eq!(h.store.items().await.len(), 2);
    assert_eq!(h.subscriber.external_ids().len(), 2);

    let notifications = h.store.notifications().await;
    assert_eq!(notifications.len(), 2);
    assert!(notifications.iter().all(|n| n.status == DeliveryStatus::Delivered));
}

#[tokio::test]
async fn test_malformed_entry_is_skipped() {
    let mut h = harness(Source::Kinozal).await;
    let entries = vec![
        h.kinozal_entry("2"),
        json!({ "title": "an entry without an id" }),
        h.kinozal_entry("1"),
    ];
    h.client.set_entries(entries, None);

    let report = h.crawler.poll_once().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.published, 2);
    assert_eq!(h.subscriber.external_ids(), vec!["1", "2"]);
}

#[tokio::test]
async fn test_failed_payload_defers_announcement_and_holds_cursor() {
    let mut h = harness(Source::Kinozal).await;
    h.payloads.fail("B");
    let entries = vec![h.kinozal_entry("C"), h.kinozal_entry("B"), h.kinozal_entry("A")];
    h.client.set_entries(entries, Some("after-C"));

    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.published, 2);
    assert_eq!(h.subscriber.external_ids(), vec!["A", "C"]);
    assert_eq!(h.crawler.state().last_cursor, None);

    h.payloads.heal();
    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.new_items, 0);
    assert_eq!(report.published, 1);
    assert_eq!(h.subscriber.external_ids(), vec!["A", "C", "B"]);
    assert_eq!(h.crawler.state().last_cursor.as_deref(), Some("after-C"));

    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.published, 0);
    assert_eq!(h.subscriber.external_ids().len(), 3);
}

#[tokio::test]
async fn test_optional_payload_is_attached_later_without_renotifying() {
    let settings = CrawlSettings {
        payload_required: false,
        ..crawl_settings()
    };
    let mut h = harness_with(ScriptedClient::new(Source::LostFilm), settings).await;
    h.payloads.fail("ep-720");
    let entry = json!({
        "id": 9001,
        "series": "Slow Horses",
        "episode_title": "Negotiating with Tigers",
        "season": 4,
        "episode": 2,
        "torrents": [
            { "quality": "1080p", "url": h.payloads.url("ep-1080") },
            { "quality": "720p", "url": h.payloads.url("ep-720") },
        ],
    });
    h.client.set_entries(vec![entry], None);

    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.published, 1);
    let announced = h.subscriber.seen.lock().unwrap()[0].clone();
    assert_eq!(announced.payload_refs.len(), 1);
    assert_eq!(announced.payload_refs[0].quality.as_deref(), Some("1080p"));

    h.payloads.heal();
    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.published, 0);
    assert_eq!(report.variants_added, 1);
    assert_eq!(h.subscriber.external_ids().len(), 1);

    let items = h.store.items().await;
    let qualities: Vec<_> = items[0]
        .payload_refs
        .iter()
        .map(|p| p.quality.as_deref().unwrap_or_default())
        .collect();
    assert_eq!(qualities, vec!["1080p", "720p"]);
}

#[tokio::test]
async fn test_listing_failure_backs_off_and_keeps_cursor() {
    let mut h = harness(Source::Kinozal).await;

    let mut state = h.store.load(Source::Kinozal).await.unwrap();
    state.last_cursor = Some("page-7".to_string());
    h.store.save(&state).await.unwrap();
    h.crawler.restore().await.unwrap();

    h.client
        .set_failure(FetchError::Transient("connection reset".to_string()));

    let err = h.crawler.poll_once().await.unwrap_err();
    assert!(matches!(err, TickError::Fetch(FetchError::Transient(_))));
    assert_eq!(h.crawler.state().consecutive_failures, 1);
    assert_eq!(h.crawler.backoff_delay(), Duration::from_secs(10));

    h.crawler.poll_once().await.unwrap_err();
    assert_eq!(h.crawler.backoff_delay(), Duration::from_secs(20));

    let persisted = h.store.load(Source::Kinozal).await.unwrap();
    assert_eq!(persisted.consecutive_failures, 2);
    assert_eq!(persisted.last_cursor.as_deref(), Some("page-7"));

    h.client.set_entries(vec![h.kinozal_entry("1")], Some("page-8"));
    h.crawler.poll_once().await.unwrap();

    let persisted = h.store.load(Source::Kinozal).await.unwrap();
    assert_eq!(persisted.consecutive_failures, 0);
    assert_eq!(persisted.last_cursor.as_deref(), Some("page-8"));
    assert_eq!(
        *h.client.cursors.lock().unwrap(),
        vec![
            Some("page-7".to_string()),
            Some("page-7".to_string()),
            Some("page-7".to_string())
        ]
    );
}

#[tokio::test]
async fn test_detail_page_supplies_missing_payloads() {
    let mut h = harness(Source::LostFilm).await;
    let entries = vec![
        json!({ "id": "gone", "series": "Andor" }),
        json!({ "id": "ok", "series": "Shogun", "episode_title": "Anjin" }),
    ];
    h.client.set_entries(entries, None);
    h.client.set_detail(
        "ok",
        Ok(json!({ "torrents": [{ "quality": "SD", "url": h.payloads.url("shogun-sd") }] })),
    );

    let report = h.crawler.poll_once().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.published, 1);
    assert_eq!(h.subscriber.external_ids(), vec!["ok"]);
    let announced = h.subscriber.seen.lock().unwrap()[0].clone();
    assert_eq!(announced.title, "Shogun. Anjin");
    assert_eq!(announced.payload_refs[0].quality.as_deref(), Some("SD"));
}

#[tokio::test]
async fn test_transient_detail_failure_fails_the_poll() {
    let mut h = harness(Source::LostFilm).await;
    h.client
        .set_entries(vec![json!({ "id": "7", "series": "Dark" })], Some("next"));
    h.client
        .set_detail("7", Err(FetchError::Transient("timeout".to_string())));

    let err = h.crawler.poll_once().await.unwrap_err();

    assert!(matches!(err, TickError::Fetch(_)));
    assert_eq!(h.crawler.state().last_cursor, None);
    assert!(h.subscriber.external_ids().is_empty());

    // The recorded but unannounced item goes out once the detail page loads.
    h.client.set_detail(
        "7",
        Ok(json!({ "torrents": [{ "quality": "1080p", "url": h.payloads.url("dark") }] })),
    );
    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.new_items, 0);
    assert_eq!(report.published, 1);
}

#[tokio::test]
async fn test_manual_trigger_is_coalesced_while_polling() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(
        ScriptedClient::gated(Source::Kinozal, gate.clone()),
        crawl_settings(),
    )
    .await;
    let mut handle = h.crawler.handle();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.crawler.run(cancel.clone()));

    // The first poll starts immediately and blocks on the gate.
    handle.wait_for(|phase| *phase == CrawlPhase::Polling).await;
    assert_eq!(handle.trigger(), TriggerOutcome::Coalesced);

    gate.add_permits(1);
    handle.wait_for(|phase| *phase == CrawlPhase::Idle).await;

    // Idle with an hour to go: a trigger starts a poll right away.
    assert_eq!(handle.trigger(), TriggerOutcome::Scheduled);
    assert_eq!(handle.trigger(), TriggerOutcome::Coalesced);
    handle.wait_for(|phase| phase.is_busy()).await;

    gate.add_permits(1);
    handle.wait_for(|phase| *phase == CrawlPhase::Idle).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(h.client.listing_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancel_mid_poll_leaves_cursor_unadvanced() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(
        ScriptedClient::gated(Source::Kinozal, gate.clone()),
        crawl_settings(),
    )
    .await;
    h.client.set_entries(vec![h.kinozal_entry("1")], Some("page-2"));

    let mut handle = h.crawler.handle();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.crawler.run(cancel.clone()));

    handle.wait_for(|phase| *phase == CrawlPhase::Polling).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    let state = h.store.load(Source::Kinozal).await.unwrap();
    assert_eq!(state.last_cursor, None);
    assert!(h.subscriber.external_ids().is_empty());
}

#[tokio::test]
async fn test_delivery_cut_by_the_deadline_is_finished_next_poll() {
    let settings = CrawlSettings {
        poll_deadline: Duration::from_millis(300),
        ..crawl_settings()
    };
    let mut h = harness_with(ScriptedClient::new(Source::Kinozal), settings).await;
    h.subscriber.hold("1");
    h.client.set_entries(vec![h.kinozal_entry("1")], Some("page-2"));

    let err = h.crawler.poll_once().await.unwrap_err();
    assert!(matches!(err, TickError::Deadline(_)));
    assert!(h.subscriber.external_ids().is_empty());

    let items = h.store.items().await;
    assert!(items[0].announced);
    let pending = Harness::notification_for(&h.store.notifications().await, &items[0]);
    assert_eq!(pending.status, DeliveryStatus::Pending);
    assert_eq!(pending.attempts, 1);

    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(report.published, 0);
    assert_eq!(h.subscriber.external_ids(), vec!["1"]);

    let delivered = Harness::notification_for(&h.store.notifications().await, &items[0]);
    assert_eq!(delivered.status, DeliveryStatus::Delivered);
    assert_eq!(delivered.attempts, 2);
    assert_eq!(h.crawler.state().last_cursor.as_deref(), Some("page-2"));

    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.resumed, 0);
    assert_eq!(h.subscriber.external_ids(), vec!["1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_mid_processing_neither_drops_nor_repeats_announcements() {
    let h = harness(Source::Kinozal).await;
    h.subscriber.hold("B");
    let entries = vec![h.kinozal_entry("C"), h.kinozal_entry("B"), h.kinozal_entry("A")];
    h.client.set_entries(entries, Some("page-2"));

    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.crawler.run(cancel.clone()));

    // A is out, B is mid-delivery, C has not been looked at.
    h.subscriber.held.notified().await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(h.store.load(Source::Kinozal).await.unwrap().last_cursor, None);
    assert_eq!(h.subscriber.external_ids(), vec!["A"]);
    let items = h.store.items().await;
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|item| item.announced));
    let notifications = h.store.notifications().await;
    assert_eq!(
        Harness::notification_for(&notifications, &items[0]).status,
        DeliveryStatus::Delivered
    );
    assert_eq!(
        Harness::notification_for(&notifications, &items[1]).status,
        DeliveryStatus::Pending
    );

    // A restarted crawler replays the listing.
    let mut crawler = Crawler::new(h.client.clone(), h.pipeline.clone(), crawl_settings());
    crawler.restore().await.unwrap();
    let report = crawler.poll_once().await.unwrap();

    assert_eq!(report.new_items, 1);
    assert_eq!(report.published, 1);
    assert_eq!(report.resumed, 1);
    assert_eq!(h.subscriber.external_ids(), vec!["A", "B", "C"]);

    let notifications = h.store.notifications().await;
    assert_eq!(notifications.len(), 3);
    assert!(notifications.iter().all(|n| n.status == DeliveryStatus::Delivered));
    assert_eq!(crawler.state().last_cursor.as_deref(), Some("page-2"));

    let report = crawler.poll_once().await.unwrap();
    assert_eq!(report.published + report.resumed, 0);
    assert_eq!(h.subscriber.external_ids().len(), 3);
}

#[tokio::test]
async fn test_rereleased_entry_refreshes_its_payload() {
    let mut h = harness(Source::Kinozal).await;
    h.client.set_entries(
        vec![h.kinozal_entry_titled("77", "Foundation (1 сезон: 1-8 серии) (1080p)")],
        None,
    );
    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.published, 1);

    // Same id and URL, one more episode in the torrent.
    h.payloads.revise("77");
    h.client.set_entries(
        vec![h.kinozal_entry_titled("77", "Foundation (1 сезон: 1-9 серии) (1080p)")],
        None,
    );
    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.new_items, 0);
    assert_eq!(report.published, 0);
    assert_eq!(report.variants_added, 1);

    let items = h.store.items().await;
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert!(item.title.contains("1-9"));
    assert_eq!(item.episode.as_ref().and_then(|e| e.episode_to), Some(9));
    assert_eq!(item.payload_refs.len(), 2);
    assert_ne!(item.payload_refs[0].content_hash, item.payload_refs[1].content_hash);
    assert_eq!(h.subscriber.external_ids(), vec!["77"]);

    let report = h.crawler.poll_once().await.unwrap();
    assert_eq!(report.variants_added, 0);
    assert_eq!(h.store.items().await[0].payload_refs.len(), 2);
}
