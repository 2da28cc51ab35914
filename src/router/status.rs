//! Public service status and Prometheus scrape endpoint.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::AppState;

/// Structured status.
#[derive(Debug, Serialize)]
pub struct Status {
    version: String,
    name: String,
    registration_id: String,
}

/// Public server status.
pub async fn status(State(state): State<AppState>) -> Json<Status> {
    let name = if state.config.name.is_empty() {
        env!("CARGO_PKG_NAME").to_owned()
    } else {
        state.config.name.clone()
    };

    Json(Status {
        version: env!("CARGO_PKG_VERSION").into(),
        name,
        registration_id: state.config.session.registration_id.clone(),
    })
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .ok_or(StatusCode::NOT_FOUND)
}
