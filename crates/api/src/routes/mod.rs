pub mod downloads;
pub mod health;
pub mod items;
pub mod poll;

use axum::Router;

use herald_common::error::AppError;
use herald_common::types::Source;

use crate::state::AppState;

/// Build the complete router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(items::router())
        .merge(downloads::router())
        .merge(poll::router())
        .with_state(state)
}

/// Parse a `{source}` path segment.
pub(crate) fn parse_source(raw: &str) -> Result<Source, AppError> {
    raw.parse()
        .map_err(|_| AppError::NotFound(format!("Unknown source '{}'", raw)))
}
