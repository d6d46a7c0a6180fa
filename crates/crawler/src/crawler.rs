use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use herald_cache::ContentCache;
use herald_canon::CanonicalizerRegistry;
use herald_common::config::CrawlSettings;
use herald_common::types::{Item, PayloadVariant, Source, SourceState};
use herald_notifier::Dispatcher;
use herald_store::{ItemStore, SourceStateStore};

use crate::backoff::{Backoff, idle_delay};
use crate::client::{FetchError, ListingOrder, SourceClient};

/// Where a crawler is in its poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlPhase {
    Idle,
    Polling,
    Processing,
    Backoff,
}

impl CrawlPhase {
    /// A poll is in flight.
    pub fn is_busy(self) -> bool {
        matches!(self, CrawlPhase::Polling | CrawlPhase::Processing)
    }
}

/// Result of [`CrawlerHandle::trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOutcome {
    /// A poll will start as soon as the crawler is free.
    Scheduled,
    /// A poll is already running or pending; the trigger was dropped.
    Coalesced,
}

/// Why a poll cycle failed. Every variant sends the crawler into backoff.
#[derive(Debug, Error)]
pub enum TickError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("poll exceeded its {0:?} deadline")]
    Deadline(Duration),
}

/// Counters for one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub entries: usize,
    pub new_items: usize,
    pub published: usize,
    /// Malformed entries and entries whose detail page is gone.
    pub skipped: usize,
    /// Items held back because a mandatory payload could not be stored.
    pub deferred: usize,
    /// Payloads attached to items that were already announced.
    pub variants_added: usize,
    /// Announced items whose delivery had been cut short and was picked up
    /// again.
    pub resumed: usize,
}

/// Components shared by every crawler.
#[derive(Clone)]
pub struct Pipeline {
    pub canon: Arc<CanonicalizerRegistry>,
    pub items: Arc<dyn ItemStore>,
    pub states: Arc<dyn SourceStateStore>,
    pub cache: ContentCache,
    pub dispatcher: Arc<Dispatcher>,
}

/// Cloneable control surface of a running [`Crawler`].
#[derive(Clone)]
pub struct CrawlerHandle {
    source: Source,
    phase: watch::Receiver<CrawlPhase>,
    triggers: mpsc::Sender<()>,
}

impl CrawlerHandle {
    pub fn source(&self) -> Source {
        self.source
    }

    pub fn phase(&self) -> CrawlPhase {
        *self.phase.borrow()
    }

    /// Request an immediate poll. At most one poll per source is in flight;
    /// triggers arriving while one runs or is already pending are coalesced.
    pub fn trigger(&self) -> TriggerOutcome {
        if self.phase().is_busy() {
            return TriggerOutcome::Coalesced;
        }
        match self.triggers.try_send(()) {
            Ok(()) => {
                tracing::info!(source = %self.source, "Manual poll scheduled");
                TriggerOutcome::Scheduled
            }
            Err(_) => TriggerOutcome::Coalesced,
        }
    }

    /// Wait until the crawler enters a phase matching `f`.
    pub async fn wait_for(&mut self, f: impl FnMut(&CrawlPhase) -> bool) {
        let _ = self.phase.wait_for(f).await;
    }
}

/// Crawl loop for a single source.
pub struct Crawler {
    client: Arc<dyn SourceClient>,
    pipeline: Pipeline,
    settings: CrawlSettings,
    backoff: Backoff,
    state: SourceState,
    phase: watch::Sender<CrawlPhase>,
    triggers: mpsc::Receiver<()>,
    trigger_tx: mpsc::Sender<()>,
}

enum EntryOutcome {
    Done,
    /// A mandatory payload failed; the cursor must not move past this entry.
    Deferred,
}

impl Crawler {
    pub fn new(client: Arc<dyn SourceClient>, pipeline: Pipeline, settings: CrawlSettings) -> Self {
        let source = client.source();
        let (phase, _) = watch::channel(CrawlPhase::Idle);
        let (trigger_tx, triggers) = mpsc::channel(1);
        Self {
            client,
            pipeline,
            backoff: Backoff::new(settings.backoff_base, settings.backoff_cap),
            settings,
            state: SourceState::new(source),
            phase,
            triggers,
            trigger_tx,
        }
    }

    pub fn source(&self) -> Source {
        self.state.source
    }

    pub fn handle(&self) -> CrawlerHandle {
        CrawlerHandle {
            source: self.source(),
            phase: self.phase.subscribe(),
            triggers: self.trigger_tx.clone(),
        }
    }

    pub fn state(&self) -> &SourceState {
        &self.state
    }

    /// Load the persisted state of this crawler's source.
    pub async fn restore(&mut self) -> anyhow::Result<()> {
        self.state = self.pipeline.states.load(self.source()).await?;
        tracing::info!(
            source = %self.source(),
            cursor = ?self.state.last_cursor,
            failures = self.state.consecutive_failures,
            "Crawler state restored"
        );
        Ok(())
    }

    /// Poll until `cancel` fires. The first poll starts immediately.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let source = self.source();

        loop {
            match self.restore().await {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!(source = %source, error = %e, "Failed to load crawler state");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.backoff.delay(0)) => {}
                    }
                }
            }
        }

        tracing::info!(
            source = %source,
            interval_secs = self.settings.interval.as_secs(),
            jitter_secs = self.settings.jitter.as_secs(),
            "Crawler started"
        );

        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                Some(()) = self.triggers.recv() => {
                    tracing::debug!(source = %source, "Manual poll triggered");
                }
            }

            let cycle = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.poll_once() => Some(result),
            };
            let Some(result) = cycle else {
                tracing::info!(source = %source, "Poll cancelled, cursor left unadvanced");
                break;
            };

            delay = match result {
                Ok(_) => idle_delay(self.settings.interval, self.settings.jitter),
                Err(_) => self.backoff_delay(),
            };

            // Triggers that arrived during the poll are already satisfied.
            while self.triggers.try_recv().is_ok() {}
        }

        self.phase.send_replace(CrawlPhase::Idle);
        tracing::info!(source = %source, "Crawler stopped");
        Ok(())
    }

    /// Delay before the next poll after a failure.
    pub fn backoff_delay(&self) -> Duration {
        self.backoff
            .delay(self.state.consecutive_failures.saturating_sub(1))
    }

    /// Run one full poll cycle, bounded by the poll deadline, and persist the
    /// resulting source state.
    pub async fn poll_once(&mut self) -> Result<TickReport, TickError> {
        let source = self.source();
        let deadline = self.settings.poll_deadline;
        self.phase.send_replace(CrawlPhase::Polling);

        let result = match tokio::time::timeout(deadline, self.tick()).await {
            Ok(result) => result,
            Err(_) => Err(TickError::Deadline(deadline)),
        };

        match &result {
            Ok(report) => {
                self.phase.send_replace(CrawlPhase::Idle);
                tracing::info!(
                    source = %source,
                    entries = report.entries,
                    new_items = report.new_items,
                    published = report.published,
                    skipped = report.skipped,
                    deferred = report.deferred,
                    variants_added = report.variants_added,
                    resumed = report.resumed,
                    "Poll completed"
                );
            }
            Err(e) => {
                let delay = self.backoff.delay(self.state.consecutive_failures);
                self.state.consecutive_failures += 1;
                self.state.last_polled_at = Some(Utc::now());
                self.phase.send_replace(CrawlPhase::Backoff);
                tracing::warn!(
                    source = %source,
                    failures = self.state.consecutive_failures,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "Poll failed, backing off"
                );
                if let Err(e) = self.pipeline.states.save(&self.state).await {
                    tracing::error!(source = %source, error = %e, "Failed to persist crawler state");
                }
            }
        }

        result
    }

    async fn tick(&mut self) -> Result<TickReport, TickError> {
        let listing = self
            .client
            .fetch_listing(self.state.last_cursor.as_deref())
            .await?;

        self.phase.send_replace(CrawlPhase::Processing);
        self.state.consecutive_failures = 0;

        let mut entries = listing.entries;
        if self.client.listing_order() == ListingOrder::NewestFirst {
            entries.reverse();
        }

        let mut report = TickReport {
            entries: entries.len(),
            ..Default::default()
        };
        let mut hold_cursor = false;
        for raw in &entries {
            if let EntryOutcome::Deferred = self.process_entry(raw, &mut report).await? {
                hold_cursor = true;
            }
        }

        self.state.last_polled_at = Some(Utc::now());
        if hold_cursor {
            tracing::info!(source = %self.source(), "Cursor held until deferred items are announced");
        } else if let Some(next) = listing.next_cursor {
            self.state.last_cursor = Some(next);
        }
        self.pipeline.states.save(&self.state).await?;

        Ok(report)
    }

    async fn process_entry(
        &self,
        raw: &Value,
        report: &mut TickReport,
    ) -> Result<EntryOutcome, TickError> {
        let source = self.source();
        let canonical = match self.pipeline.canon.canonicalize(source, raw, Utc::now()) {
            Ok(canonical) => canonical,
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "Skipping malformed entry");
                report.skipped += 1;
                return Ok(EntryOutcome::Done);
            }
        };

        let discovery = self.pipeline.items.check_and_record(&canonical.item).await?;
        let is_new = discovery.is_new();
        let mut item = discovery.into_item();
        if is_new {
            report.new_items += 1;
            tracing::info!(
                source = %source,
                item_id = %item.id,
                external_id = %item.external_id,
                title = %item.headline(),
                "New item discovered"
            );
        }

        // Same identifier, new title or episode range: the entry was re-released
        // in place and its payload URLs may now serve different files.
        let revised = !is_new
            && (canonical.item.title != item.title || canonical.item.episode != item.episode);
        if revised {
            tracing::info!(
                source = %source,
                item_id = %item.id,
                old_title = %item.title,
                new_title = %canonical.item.title,
                "Entry revised, refreshing payloads"
            );
        }

        let mut variants = canonical.variants;
        if canonical.needs_detail && (!item.announced || revised) {
            match self.detail_variants(&item).await? {
                Some(found) => variants = found,
                None => {
                    report.skipped += 1;
                    return Ok(EntryOutcome::Done);
                }
            }
        }

        let missing: Vec<PayloadVariant> = variants
            .into_iter()
            .filter(|v| revised || !item.has_payload_from(&v.origin_url))
            .collect();

        let mut failed = 0;
        let results = self
            .pipeline
            .cache
            .fetch_all(&missing, self.settings.payload_workers)
            .await;
        for (variant, result) in missing.iter().zip(results) {
            match result {
                Ok(payload) => {
                    if self.pipeline.items.append_payload_ref(item.id, &payload).await? {
                        if item.announced {
                            report.variants_added += 1;
                            tracing::info!(
                                source = %source,
                                item_id = %item.id,
                                hash = %payload.content_hash,
                                quality = ?payload.quality,
                                "New variant attached"
                            );
                        }
                        item.payload_refs.push(payload);
                    }
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        source = %source,
                        item_id = %item.id,
                        url = %variant.origin_url,
                        error = %e,
                        "Payload could not be cached"
                    );
                }
            }
        }

        // Metadata is only taken over once every refreshed payload made it,
        // so a failed refresh is retried on the next tick.
        if revised && failed == 0 {
            self.pipeline.items.revise(item.id, &canonical.item).await?;
            item.title = canonical.item.title.clone();
            item.episode = canonical.item.episode;
            item.published_at = canonical.item.published_at;
        }

        if item.announced {
            if !self.pipeline.dispatcher.is_settled(&item).await? {
                report.resumed += 1;
                tracing::info!(
                    source = %source,
                    item_id = %item.id,
                    "Resuming interrupted announcement"
                );
                self.pipeline.dispatcher.publish(&item).await;
            }
            return Ok(EntryOutcome::Done);
        }
        if failed > 0 && self.settings.payload_required {
            report.deferred += 1;
            tracing::info!(
                source = %source,
                item_id = %item.id,
                failed,
                "Announcement deferred until payloads are cached"
            );
            return Ok(EntryOutcome::Deferred);
        }

        if self.pipeline.items.claim_announcement(item.id).await? {
            item.announced = true;
            self.pipeline.dispatcher.publish(&item).await;
            report.published += 1;
        }
        Ok(EntryOutcome::Done)
    }

    /// Payload variants from the entry's detail page. `None` when the page is
    /// gone or cannot be mapped.
    async fn detail_variants(&self, item: &Item) -> Result<Option<Vec<PayloadVariant>>, TickError> {
        let source = self.source();
        let external_id = item.external_id.as_str();
        let detail = match self.client.fetch_detail(external_id).await {
            Ok(detail) => detail,
            Err(FetchError::PermanentNotFound(what)) => {
                tracing::warn!(source = %source, external_id, %what, "Detail page gone, skipping entry");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mapped = self
            .pipeline
            .canon
            .get(source)
            .and_then(|canonicalizer| canonicalizer.canonicalize_detail(item, &detail));
        match mapped {
            Ok(variants) => Ok(Some(variants)),
            Err(e) => {
                tracing::warn!(source = %source, external_id, error = %e, "Skipping malformed detail page");
                Ok(None)
            }
        }
    }
}
