use axum::routing::get;
use axum::{Json, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(index))
}

/// Service metadata for monitoring and discovery.
async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "repository_url": env!("CARGO_PKG_REPOSITORY"),
        // Cargo exposes no CARGO_PKG_DOCUMENTATION; homepage carries the
        // same docs URL.
        "documentation_url": env!("CARGO_PKG_HOMEPAGE"),
    }))
}
