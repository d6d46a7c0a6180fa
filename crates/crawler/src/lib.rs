//! Per-source crawl loop.
//!
//! Each configured source gets one [`Crawler`] task that polls its
//! [`SourceClient`], canonicalizes the listing, records new items, caches
//! their payloads and announces them through the notifier. All long-running
//! tasks are owned by a [`Supervisor`].

pub mod backoff;
pub mod client;
pub mod crawler;
pub mod supervisor;

pub use backoff::Backoff;
pub use client::{FetchError, HttpSourceClient, Listing, ListingOrder, SourceClient};
pub use crawler::{
    CrawlPhase, Crawler, CrawlerHandle, Pipeline, TickError, TickReport, TriggerOutcome,
};
pub use supervisor::{ExitReport, Supervisor};
