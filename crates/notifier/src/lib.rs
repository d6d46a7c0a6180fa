//! Announcement fan-out.
//!
//! A [`Dispatcher`] delivers each newly announced item to every registered
//! [`Subscriber`], recording the outcome per channel in a
//! [`NotificationLog`](herald_store::NotificationLog).

pub mod discord;
pub mod dispatcher;
pub mod telegram;

use async_trait::async_trait;
use thiserror::Error;

use herald_common::types::Item;

pub use discord::DiscordSubscriber;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use telegram::TelegramSubscriber;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("channel rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("delivery timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

/// Drops the request URL: channel URLs carry bot tokens and webhook secrets.
impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Http(err.without_url())
    }
}

/// A consumer of "new item" events.
///
/// Delivery is at-least-once: a subscriber may see the same item again after
/// a crash between sending and recording.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Stable channel name, used as the delivery log key.
    fn channel(&self) -> &str;

    async fn on_new_item(&self, item: &Item) -> Result<(), DeliveryError>;
}

/// Human-readable payload size.
pub(crate) fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Turn a non-success HTTP response into a [`DeliveryError`].
pub(crate) async fn check_response(response: reqwest::Response) -> Result<(), DeliveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(DeliveryError::Rejected {
        status: status.as_u16(),
        body,
    })
}
