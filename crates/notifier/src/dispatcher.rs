use std::sync::Arc;

use futures::future::join_all;

use herald_common::config::DispatchSettings;
use herald_common::types::{DeliveryStatus, Item};
use herald_store::NotificationLog;

use crate::{DeliveryError, Subscriber};

/// Per-channel outcome of [`Dispatcher::publish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
    /// Channels whose record for this item was already final.
    pub skipped: Vec<String>,
}

enum Outcome {
    Delivered,
    Failed,
    Skipped,
}

/// Fans announcements out to the registered subscribers.
pub struct Dispatcher {
    subscribers: Vec<Arc<dyn Subscriber>>,
    log: Arc<dyn NotificationLog>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(log: Arc<dyn NotificationLog>, settings: DispatchSettings) -> Self {
        Self {
            subscribers: Vec::new(),
            log,
            settings,
        }
    }

    /// Register a subscriber. Subscribers are fixed once the dispatcher is
    /// shared with the crawlers.
    pub fn subscribe(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        tracing::info!(channel = subscriber.channel(), "Subscriber registered");
        self.subscribers.push(subscriber);
        self
    }

    pub fn channels(&self) -> Vec<&str> {
        self.subscribers.iter().map(|s| s.channel()).collect()
    }

    /// Deliver `item` to every subscriber concurrently. A failing subscriber
    /// never holds up the others.
    pub async fn publish(&self, item: &Item) -> DispatchReport {
        let outcomes = join_all(
            self.subscribers
                .iter()
                .map(|subscriber| self.deliver(subscriber.as_ref(), item)),
        )
        .await;

        let mut report = DispatchReport::default();
        for (subscriber, outcome) in self.subscribers.iter().zip(outcomes) {
            let channel = subscriber.channel().to_string();
            match outcome {
                Outcome::Delivered => report.delivered.push(channel),
                Outcome::Failed => report.failed.push(channel),
                Outcome::Skipped => report.skipped.push(channel),
            }
        }

        tracing::info!(
            item_id = %item.id,
            source = %item.source,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Item published"
        );
        report
    }

    /// Whether every channel holds a final (delivered or failed) record for
    /// `item`. Announcements interrupted mid-delivery are not settled.
    pub async fn is_settled(&self, item: &Item) -> anyhow::Result<bool> {
        for subscriber in &self.subscribers {
            match self.log.get(item.id, subscriber.channel()).await? {
                Some(record) if record.status != DeliveryStatus::Pending => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn deliver(&self, subscriber: &dyn Subscriber, item: &Item) -> Outcome {
        let channel = subscriber.channel();

        let record = match self.log.begin(item.id, channel).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(item_id = %item.id, channel, error = %e, "Failed to open delivery record");
                return Outcome::Failed;
            }
        };
        if record.status != DeliveryStatus::Pending {
            tracing::debug!(item_id = %item.id, channel, status = %record.status, "Already settled, skipping");
            return Outcome::Skipped;
        }

        let max_attempts = i32::try_from(self.settings.max_attempts).unwrap_or(i32::MAX);
        let mut attempts = record.attempts;
        let mut last_error = record.last_error;
        if attempts > 0 {
            tracing::info!(item_id = %item.id, channel, attempts, "Resuming interrupted delivery");
        }

        while attempts < max_attempts {
            attempts += 1;
            // Counted before it runs, so an attempt cut short still uses up budget.
            self.record(item, channel, DeliveryStatus::Pending, attempts, last_error.as_deref())
                .await;

            let result = tokio::time::timeout(
                self.settings.attempt_timeout,
                subscriber.on_new_item(item),
            )
            .await
            .unwrap_or(Err(DeliveryError::Timeout));

            match result {
                Ok(()) => {
                    self.record(item, channel, DeliveryStatus::Delivered, attempts, None)
                        .await;
                    return Outcome::Delivered;
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    if attempts < max_attempts {
                        let exponent = u32::try_from(attempts - 1).unwrap_or(0);
                        let delay = self.settings.base_delay * 2u32.saturating_pow(exponent);
                        tracing::warn!(
                            item_id = %item.id,
                            channel,
                            attempt = attempts,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Delivery failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::error!(
            item_id = %item.id,
            channel,
            attempts,
            error = last_error.as_deref().unwrap_or_default(),
            "Delivery failed permanently"
        );
        self.record(item, channel, DeliveryStatus::Failed, attempts, last_error.as_deref())
            .await;
        Outcome::Failed
    }

    async fn record(
        &self,
        item: &Item,
        channel: &str,
        status: DeliveryStatus,
        attempts: i32,
        error: Option<&str>,
    ) {
        if let Err(e) = self
            .log
            .record_attempt(item.id, channel, status, attempts, error)
            .await
        {
            tracing::error!(item_id = %item.id, channel, %status, error = %e, "Failed to record delivery attempt");
        }
    }
}
