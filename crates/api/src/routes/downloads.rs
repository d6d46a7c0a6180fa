//! Payload downloads.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;

use herald_cache::CacheError;
use herald_common::error::AppError;
use herald_common::types::DownloadEntry;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/dl/{content_hash}", get(download))
}

/// GET /dl/{content_hash} — Stream a cached payload.
async fn download(
    State(state): State<AppState>,
    Path(content_hash): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let stream = state.cache.get(&content_hash).await.map_err(|e| match e {
        CacheError::NotFound(_) | CacheError::InvalidHash(_) => {
            AppError::NotFound(format!("Payload {} not found", content_hash))
        }
        other => AppError::Storage(other.to_string()),
    })?;

    let entry = DownloadEntry {
        content_hash: content_hash.clone(),
        remote_addr: client_addr(&headers),
        user_agent: header_str(&headers, header::USER_AGENT.as_str()),
        created_at: Utc::now(),
    };
    if let Err(e) = state.downloads.record(&entry).await {
        tracing::warn!(hash = %content_hash, error = %e, "Failed to record download");
    }
    tracing::debug!(hash = %content_hash, remote_addr = ?entry.remote_addr, "Serving payload");

    Ok((
        [
            (header::CONTENT_TYPE, "application/x-bittorrent".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.torrent\"", content_hash),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Client address as reported by the reverse proxy.
fn client_addr(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|forwarded| {
            forwarded
                .split(',')
                .next()
                .map(|first| first.trim().to_string())
        })
        .filter(|addr| !addr.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
