//! Source-specific canonicalizers.
//!
//! Each upstream source hands over raw JSON entries shaped by its scraper.
//! A [`Canonicalizer`] maps those into the canonical [`Item`] model plus the
//! payload variants still to be downloaded. Canonicalizers are pure: no I/O,
//! no clock, no storage.

pub mod kinozal;
pub mod lostfilm;


use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

use herald_common::types::{Item, PayloadVariant, Source};

/// A single raw entry could not be mapped. Never fatal to a batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CanonError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("no canonicalizer registered for source {0}")]
    UnsupportedSource(Source),
}

/// Canonical form of one listing entry.
#[derive(Debug, Clone)]
pub struct Canonical {
    pub item: Item,
    /// Payloads announced by the listing, in listing order.
    pub variants: Vec<PayloadVariant>,
    /// The listing carries no payload links; the detail page must be fetched.
    pub needs_detail: bool,
}

/// Trait that every per-source canonicalizer implements.
pub trait Canonicalizer: Send + Sync {
    /// Source this canonicalizer understands.
    fn source(&self) -> Source;

    /// Map a raw listing entry. `discovered_at` is stamped on the item and
    /// used as the publication time when the entry carries none.
    fn canonicalize(&self, raw: &Value, discovered_at: DateTime<Utc>)
    -> Result<Canonical, CanonError>;

    /// Extract payload variants from a raw detail page of an item.
    fn canonicalize_detail(&self, item: &Item, raw: &Value)
    -> Result<Vec<PayloadVariant>, CanonError>;

    /// Human-readable name for logging.
    fn name(&self) -> &'static str;
}

/// Registry of all canonicalizers, keyed by source.
pub struct CanonicalizerRegistry {
    canonicalizers: HashMap<Source, Box<dyn Canonicalizer>>,
}

impl CanonicalizerRegistry {
    /// Create a registry with every built-in canonicalizer.
    pub fn new() -> Self {
        Self::empty()
            .with(lostfilm::LostFilmCanonicalizer::new())
            .with(kinozal::KinozalCanonicalizer::new())
    }

    pub fn empty() -> Self {
        Self {
            canonicalizers: HashMap::new(),
        }
    }

    /// Register (or replace) the canonicalizer for its source.
    pub fn with(mut self, canonicalizer: impl Canonicalizer + 'static) -> Self {
        self.canonicalizers
            .insert(canonicalizer.source(), Box::new(canonicalizer));
        self
    }

    pub fn get(&self, source: Source) -> Result<&dyn Canonicalizer, CanonError> {
        self.canonicalizers
            .get(&source)
            .map(|c| c.as_ref())
            .ok_or(CanonError::UnsupportedSource(source))
    }

    /// Canonicalize a raw entry with the canonicalizer of `source`.
    pub fn canonicalize(
        &self,
        source: Source,
        raw: &Value,
        discovered_at: DateTime<Utc>,
    ) -> Result<Canonical, CanonError> {
        let canonicalizer = self.get(source)?;
        let canonical = canonicalizer.canonicalize(raw, discovered_at)?;
        tracing::trace!(
            canonicalizer = canonicalizer.name(),
            external_id = %canonical.item.external_id,
            "Canonicalized entry"
        );
        Ok(canonical)
    }
}

impl Default for CanonicalizerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ───────────────────────────── field helpers ──────────────────────────────

/// Source-native identifier; scrapers emit either strings or numbers.
pub(crate) fn external_id(raw: &Value) -> Result<String, CanonError> {
    match raw.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::String(_)) => Err(CanonError::InvalidField {
            field: "id",
            reason: "empty".to_string(),
        }),
        Some(other) => Err(CanonError::InvalidField {
            field: "id",
            reason: format!("unexpected type: {}", other),
        }),
        None => Err(CanonError::MissingField("id")),
    }
}

/// Non-empty trimmed string field.
pub(crate) fn str_field<'a>(raw: &'a Value, key: &str) -> Option<&'a str> {
    raw.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Unsigned number field, tolerating numeric strings.
pub(crate) fn u32_field(raw: &Value, key: &str) -> Option<u32> {
    match raw.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Both sites publish in Moscow time (UTC+3, no DST) when no offset is given.
const MOSCOW_UTC_OFFSET_HOURS: i64 = 3;

/// Parse RFC 3339, `DD.MM.YYYY HH:MM` or `DD.MM.YYYY` timestamps.
pub(crate) fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, CanonError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    let local = NaiveDateTime::parse_from_str(value, "%d.%m.%Y %H:%M")
        .or_else(|_| {
            NaiveDate::parse_from_str(value, "%d.%m.%Y")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
        })
        .map_err(|e| CanonError::InvalidField {
            field,
            reason: format!("'{}': {}", value, e),
        })?;
    Ok(Utc.from_utc_datetime(&(local - Duration::hours(MOSCOW_UTC_OFFSET_HOURS))))
}

/// Collect `{quality, url}` objects from an array field. Elements without a
/// URL are ignored; duplicate URLs are collapsed, first one wins.
pub(crate) fn variants_from_array(raw: &Value, key: &str) -> Option<Vec<PayloadVariant>> {
    let array = raw.get(key)?.as_array()?;
    let mut variants: Vec<PayloadVariant> = Vec::with_capacity(array.len());
    for entry in array {
        let Some(url) = str_field(entry, "url") else {
            continue;
        };
        if variants.iter().any(|v| v.origin_url == url) {
            continue;
        }
        variants.push(PayloadVariant {
            quality: str_field(entry, "quality").map(str::to_string),
            origin_url: url.to_string(),
        });
    }
    Some(variants)
}
