//! Health check endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Map, Value, json};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let crawlers: Map<String, Value> = state
        .crawlers
        .iter()
        .map(|(source, handle)| (source.to_string(), json!(handle.phase())))
        .collect();

    Json(json!({
        "status": "ok",
        "service": "herald",
        "version": env!("CARGO_PKG_VERSION"),
        "crawlers": crawlers,
    }))
}
