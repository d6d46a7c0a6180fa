use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::types::Source;

/// Global application configuration loaded from environment variables.
///
/// Components never read this directly; the binary splits it into the
/// per-component settings below and hands each one over at construction.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Address the HTTP delivery layer binds to
    pub http_addr: String,

    /// Externally visible base URL, used to build download links
    pub public_url: String,

    /// Root directory of the content-addressed payload cache
    pub cache_dir: PathBuf,

    /// Base URL of the LostFilm scraper endpoint. Source disabled when unset.
    pub lostfilm_source_url: Option<String>,

    /// Base URL of the Kinozal scraper endpoint. Source disabled when unset.
    pub kinozal_source_url: Option<String>,

    pub poll_interval_secs: u64,
    pub poll_jitter_secs: u64,
    pub poll_deadline_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,

    /// Per-request timeout for upstream and payload fetches
    pub fetch_timeout_secs: u64,
    /// Attempts for a single payload download before giving up
    pub fetch_retries: u32,
    pub max_payload_bytes: u64,
    /// Concurrent payload downloads per item
    pub payload_workers: usize,
    /// Whether an item may only be announced once all its payloads are cached
    pub payload_required: bool,

    pub dispatch_max_attempts: u32,
    pub dispatch_base_delay_ms: u64,

    /// Telegram bot token
    pub telegram_bot_token: Option<String>,

    /// Telegram chat (channel) receiving announcements
    pub telegram_chat_id: Option<String>,

    /// Discord webhook URL receiving announcements
    pub discord_webhook_url: Option<String>,
}

/// Settings handed to each crawler.
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub interval: Duration,
    pub jitter: Duration,
    pub poll_deadline: Duration,
    pub fetch_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub payload_workers: usize,
    pub payload_required: bool,
}

/// Settings handed to the content cache.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub root: PathBuf,
    pub fetch_timeout: Duration,
    pub fetch_retries: u32,
    /// Delay before the first retry; doubles on each further attempt
    pub retry_base_delay: Duration,
    pub max_payload_bytes: u64,
}

/// Settings handed to the notification dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

fn var_or<T: FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| anyhow::anyhow!("{} has an invalid value", name))
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: var_or("DB_MAX_CONNECTIONS", "20")?,
            http_addr: std::env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            cache_dir: std::env::var("CACHE_DIR")
                .unwrap_or_else(|_| "data/cache".to_string())
                .into(),
            lostfilm_source_url: std::env::var("LOSTFILM_SOURCE_URL").ok(),
            kinozal_source_url: std::env::var("KINOZAL_SOURCE_URL").ok(),
            poll_interval_secs: var_or("POLL_INTERVAL_SECS", "300")?,
            poll_jitter_secs: var_or("POLL_JITTER_SECS", "30")?,
            poll_deadline_secs: var_or("POLL_DEADLINE_SECS", "120")?,
            backoff_base_secs: var_or("BACKOFF_BASE_SECS", "10")?,
            backoff_cap_secs: var_or("BACKOFF_CAP_SECS", "1800")?,
            fetch_timeout_secs: var_or("FETCH_TIMEOUT_SECS", "30")?,
            fetch_retries: var_or("FETCH_RETRIES", "3")?,
            max_payload_bytes: var_or("MAX_PAYLOAD_BYTES", "16777216")?,
            payload_workers: var_or("PAYLOAD_WORKERS", "2")?,
            payload_required: var_or("PAYLOAD_REQUIRED", "true")?,
            dispatch_max_attempts: var_or("DISPATCH_MAX_ATTEMPTS", "5")?,
            dispatch_base_delay_ms: var_or("DISPATCH_BASE_DELAY_MS", "500")?,
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
            discord_webhook_url: std::env::var("DISCORD_WEBHOOK_URL").ok(),
        })
    }

    /// Configured upstream endpoints, one per enabled source.
    pub fn enabled_sources(&self) -> Vec<(Source, String)> {
        Source::ALL
            .into_iter()
            .filter_map(|source| {
                let url = match source {
                    Source::LostFilm => self.lostfilm_source_url.clone(),
                    Source::Kinozal => self.kinozal_source_url.clone(),
                };
                url.map(|u| (source, u))
            })
            .collect()
    }

    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            interval: Duration::from_secs(self.poll_interval_secs),
            jitter: Duration::from_secs(self.poll_jitter_secs),
            poll_deadline: Duration::from_secs(self.poll_deadline_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            backoff_cap: Duration::from_secs(self.backoff_cap_secs),
            payload_workers: self.payload_workers.max(1),
            payload_required: self.payload_required,
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            root: self.cache_dir.clone(),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            fetch_retries: self.fetch_retries.max(1),
            retry_base_delay: Duration::from_millis(500),
            max_payload_bytes: self.max_payload_bytes,
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_attempts: self.dispatch_max_attempts.max(1),
            base_delay: Duration::from_millis(self.dispatch_base_delay_ms),
            attempt_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }
}
