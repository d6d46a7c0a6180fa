//! Recent item feed per source.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Item, PayloadRef, Source};

use crate::routes::parse_source;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

pub fn router() -> Router<AppState> {
    Router::new().route("/sources/{source}/items", get(list_items))
}

#[derive(Debug, Deserialize)]
pub struct ItemsQuery {
    /// Only payloads of this quality (case-insensitive).
    pub quality: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PayloadView {
    pub content_hash: String,
    pub quality: Option<String>,
    pub size_bytes: u64,
    pub download_url: String,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ItemView {
    pub id: Uuid,
    pub source: Source,
    pub external_id: String,
    pub title: String,
    pub episode: Option<String>,
    pub page_url: Option<String>,
    pub poster_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub discovered_at: DateTime<Utc>,
    pub payloads: Vec<PayloadView>,
}

impl ItemView {
    fn new(item: Item, payloads: Vec<PayloadRef>, public_url: &str) -> Self {
        Self {
            id: item.id,
            source: item.source,
            external_id: item.external_id,
            title: item.title,
            episode: item.episode.map(|e| e.to_string()),
            page_url: item.page_url,
            poster_url: item.poster_url,
            published_at: item.published_at,
            discovered_at: item.discovered_at,
            payloads: payloads
                .into_iter()
                .map(|p| PayloadView {
                    download_url: p.download_url(public_url),
                    content_hash: p.content_hash,
                    quality: p.quality,
                    size_bytes: p.size_bytes,
                    stored_at: p.stored_at,
                })
                .collect(),
        }
    }
}

/// GET /sources/{source}/items — Most recent announced items, newest first.
///
/// With `quality`, only matching payloads are listed and items without any
/// are left out.
async fn list_items(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(query): Query<ItemsQuery>,
) -> Result<Json<Vec<ItemView>>, AppError> {
    let source = parse_source(&source)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }

    let items = state.items.recent_items(source, limit).await?;
    let views = items
        .into_iter()
        .filter_map(|mut item| {
            let payloads = std::mem::take(&mut item.payload_refs);
            match &query.quality {
                None => Some(ItemView::new(item, payloads, &state.public_url)),
                Some(wanted) => {
                    let matching: Vec<PayloadRef> = payloads
                        .into_iter()
                        .filter(|p| {
                            p.quality
                                .as_deref()
                                .is_some_and(|q| q.eq_ignore_ascii_case(wanted))
                        })
                        .collect();
                    (!matching.is_empty())
                        .then(|| ItemView::new(item, matching, &state.public_url))
                }
            }
        })
        .collect();

    Ok(Json(views))
}
