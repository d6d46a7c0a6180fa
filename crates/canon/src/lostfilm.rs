use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use herald_common::types::{EpisodeInfo, Item, PayloadVariant, Source};

use crate::{
    CanonError, Canonical, Canonicalizer, external_id, parse_timestamp, str_field, u32_field,
    variants_from_array,
};

/// LostFilm (episodic tracker) canonicalizer.
///
/// Listing entries look like:
///
/// ```json
/// {
///   "id": "the_boys_s4e8",
///   "series": "The Boys",
///   "episode_title": "Assassination Run",
///   "season": 4, "episode": 8,
///   "date": "19.07.2024",
///   "page": "https://www.lostfilm.tv/series/The_Boys/season_4/episode_8/",
///   "poster": "https://static.lostfilm.top/Images/1/Posters/image.jpg",
///   "torrents": [{ "quality": "1080p", "url": "https://..." }]
/// }
/// ```
///
/// The listing page usually lacks `torrents`; they live on the episode page.
pub struct LostFilmCanonicalizer;

impl LostFilmCanonicalizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LostFilmCanonicalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Canonicalizer for LostFilmCanonicalizer {
    fn source(&self) -> Source {
        Source::LostFilm
    }

    fn canonicalize(
        &self,
        raw: &Value,
        discovered_at: DateTime<Utc>,
    ) -> Result<Canonical, CanonError> {
        let external_id = external_id(raw)?;
        let series = str_field(raw, "series").ok_or(CanonError::MissingField("series"))?;

        let title = match str_field(raw, "episode_title") {
            Some(episode_title) => format!("{}. {}", series, episode_title),
            None => series.to_string(),
        };

        let episode = match (u32_field(raw, "season"), u32_field(raw, "episode")) {
            (Some(season), Some(episode)) => Some(EpisodeInfo::single(season, episode)),
            (Some(season), None) => Some(EpisodeInfo {
                season,
                episode_from: None,
                episode_to: None,
            }),
            _ => None,
        };

        let published_at = match str_field(raw, "date") {
            Some(date) => parse_timestamp("date", date)?,
            None => discovered_at,
        };

        let listed = variants_from_array(raw, "torrents");
        let needs_detail = listed.as_ref().is_none_or(|v| v.is_empty());

        Ok(Canonical {
            item: Item {
                id: Uuid::new_v4(),
                source: Source::LostFilm,
                external_id,
                title,
                episode,
                page_url: str_field(raw, "page").map(str::to_string),
                poster_url: str_field(raw, "poster").map(str::to_string),
                published_at,
                discovered_at,
                announced: false,
                payload_refs: Vec::new(),
            },
            variants: listed.unwrap_or_default(),
            needs_detail,
        })
    }

    fn canonicalize_detail(
        &self,
        _item: &Item,
        raw: &Value,
    ) -> Result<Vec<PayloadVariant>, CanonError> {
        variants_from_array(raw, "torrents")
            .or_else(|| variants_from_array(raw, "files"))
            .ok_or(CanonError::MissingField("torrents"))
    }

    fn name(&self) -> &'static str {
        "LostFilm"
    }
}
