//! Manual poll triggers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use herald_common::error::AppError;
use herald_crawler::{CrawlPhase, TriggerOutcome};

use crate::routes::parse_source;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/sources/{source}/poll", post(trigger_poll))
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub outcome: TriggerOutcome,
    /// Phase of the crawler when the trigger was handled.
    pub phase: CrawlPhase,
}

/// POST /sources/{source}/poll — Ask a crawler to poll now.
async fn trigger_poll(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<(StatusCode, Json<PollResponse>), AppError> {
    let source = parse_source(&source)?;
    let handle = state
        .crawlers
        .get(&source)
        .ok_or_else(|| AppError::NotFound(format!("Source {} is not configured", source)))?;

    let outcome = handle.trigger();
    Ok((
        StatusCode::ACCEPTED,
        Json(PollResponse {
            outcome,
            phase: handle.phase(),
        }),
    ))
}
