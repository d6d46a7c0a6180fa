use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use herald_common::types::{EpisodeInfo, Item, PayloadVariant, Source};

use crate::{
    CanonError, Canonical, Canonicalizer, external_id, parse_timestamp, str_field,
    variants_from_array,
};

/// Kinozal download endpoint, used when the listing omits `download_url`.
const DOWNLOAD_BASE: &str = "https://dl.kinozal.tv/download.php?id=";

// "Сериал (1 сезон: 1-8 серии из 10) / 2024 / WEB-DL (1080p)"
static RU_SEASON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*сезон(?:[:,]?\s*(\d+)(?:\s*-\s*(\d+))?\s*сери[яий])?")
        .expect("season pattern is valid")
});

// "Show.S02E05.1080p" or "Show S02E01-E04"
static SXXEYY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bS(\d{1,2})E(\d{1,3})(?:-E?(\d{1,3}))?\b").expect("SxxEyy pattern is valid")
});

static QUALITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{3,4}p)\b").expect("quality pattern is valid"));

/// Kinozal (torrent index) canonicalizer.
///
/// The index has no structured episode data: season, episode range and
/// quality are parsed out of the release title.
pub struct KinozalCanonicalizer;

impl KinozalCanonicalizer {
    pub fn new() -> Self {
        Self
    }

    /// Parse season/episode info out of a release title.
    pub fn parse_episode(title: &str) -> Option<EpisodeInfo> {
        let caps = RU_SEASON.captures(title).or_else(|| SXXEYY.captures(title))?;
        let season = caps.get(1)?.as_str().parse().ok()?;
        let from: Option<u32> = caps.get(2).and_then(|m| m.as_str().parse().ok());
        let to: Option<u32> = caps.get(3).and_then(|m| m.as_str().parse().ok()).or(from);
        Some(EpisodeInfo {
            season,
            episode_from: from,
            episode_to: to,
        })
    }

    /// Parse a quality label (`720p`, `1080p`, `2160p`) out of a release title.
    pub fn parse_quality(title: &str) -> Option<String> {
        QUALITY
            .captures(title)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
    }
}

impl Default for KinozalCanonicalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Canonicalizer for KinozalCanonicalizer {
    fn source(&self) -> Source {
        Source::Kinozal
    }

    fn canonicalize(
        &self,
        raw: &Value,
        discovered_at: DateTime<Utc>,
    ) -> Result<Canonical, CanonError> {
        let external_id = external_id(raw)?;
        let title = str_field(raw, "title").ok_or(CanonError::MissingField("title"))?;

        let published_at = match str_field(raw, "published") {
            Some(ts) => parse_timestamp("published", ts)?,
            None => discovered_at,
        };

        let origin_url = str_field(raw, "download_url")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}{}", DOWNLOAD_BASE, external_id));

        let variant = PayloadVariant {
            quality: Self::parse_quality(title),
            origin_url,
        };

        Ok(Canonical {
            item: Item {
                id: Uuid::new_v4(),
                source: Source::Kinozal,
                external_id,
                title: title.to_string(),
                episode: Self::parse_episode(title),
                page_url: str_field(raw, "page").map(str::to_string),
                poster_url: str_field(raw, "poster").map(str::to_string),
                published_at,
                discovered_at,
                announced: false,
                payload_refs: Vec::new(),
            },
            variants: vec![variant],
            needs_detail: false,
        })
    }

    fn canonicalize_detail(
        &self,
        item: &Item,
        raw: &Value,
    ) -> Result<Vec<PayloadVariant>, CanonError> {
        if let Some(variants) = variants_from_array(raw, "torrents") {
            return Ok(variants);
        }
        let url = str_field(raw, "download_url").ok_or(CanonError::MissingField("download_url"))?;
        Ok(vec![PayloadVariant {
            quality: Self::parse_quality(&item.title),
            origin_url: url.to_string(),
        }])
    }

    fn name(&self) -> &'static str {
        "Kinozal"
    }
}
