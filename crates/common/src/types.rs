use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported content sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Episodic-release tracker.
    LostFilm,
    /// Torrent index.
    Kinozal,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::LostFilm, Source::Kinozal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::LostFilm => "lostfilm",
            Source::Kinozal => "kinozal",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lostfilm" => Ok(Source::LostFilm),
            "kinozal" => Ok(Source::Kinozal),
            other => Err(format!("unknown source '{}'", other)),
        }
    }
}

/// Structured season/episode information of a release.
///
/// Single-episode releases have `episode_from == episode_to`. Season packs
/// carry the covered range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeInfo {
    pub season: u32,
    pub episode_from: Option<u32>,
    pub episode_to: Option<u32>,
}

impl EpisodeInfo {
    pub fn single(season: u32, episode: u32) -> Self {
        Self {
            season,
            episode_from: Some(episode),
            episode_to: Some(episode),
        }
    }
}

impl std::fmt::Display for EpisodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.episode_from, self.episode_to) {
            (Some(from), Some(to)) if from != to => {
                write!(f, "S{:02}E{:02}-E{:02}", self.season, from, to)
            }
            (Some(ep), _) | (None, Some(ep)) => write!(f, "S{:02}E{:02}", self.season, ep),
            (None, None) => write!(f, "S{:02}", self.season),
        }
    }
}

/// A cached binary payload (e.g. a `.torrent` file).
///
/// Identity is the SHA-256 of the content, lower-case hex. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    pub content_hash: String,
    pub origin_url: String,
    /// Variant label such as `1080p`, when the source provides one.
    pub quality: Option<String>,
    pub size_bytes: u64,
    pub stored_at: DateTime<Utc>,
}

impl PayloadRef {
    /// Public link served by the delivery layer's `/dl/{hash}` route.
    pub fn download_url(&self, public_url: &str) -> String {
        format!("{}/dl/{}", public_url.trim_end_matches('/'), self.content_hash)
    }
}

/// A payload announced by a source that has not been materialized yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadVariant {
    pub quality: Option<String>,
    pub origin_url: String,
}

/// A discovered release, normalized independently of its source format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub source: Source,
    pub external_id: String,
    pub title: String,
    pub episode: Option<EpisodeInfo>,
    pub page_url: Option<String>,
    pub poster_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub discovered_at: DateTime<Utc>,
    /// Whether the item has been handed to the notification dispatcher.
    pub announced: bool,
    pub payload_refs: Vec<PayloadRef>,
}

impl Item {
    /// Whether a payload fetched from `origin_url` is already attached.
    pub fn has_payload_from(&self, origin_url: &str) -> bool {
        self.payload_refs.iter().any(|r| r.origin_url == origin_url)
    }

    /// Human-readable headline, including episode info when known.
    pub fn headline(&self) -> String {
        match &self.episode {
            Some(ep) => format!("{} ({})", self.title, ep),
            None => self.title.clone(),
        }
    }
}

/// Per-source crawl bookkeeping. Owned by exactly one crawler task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceState {
    pub source: Source,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_cursor: Option<String>,
    pub consecutive_failures: u32,
}

impl SourceState {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            last_polled_at: None,
            last_cursor: None,
            consecutive_failures: 0,
        }
    }
}

/// Notification delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A delivery record for one item on one channel.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub item_id: Uuid,
    pub channel: String,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One payload download served by the delivery layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadEntry {
    pub content_hash: String,
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}
