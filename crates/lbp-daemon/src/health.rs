//! A minimal liveness surface. The full HTTP API over the core operations
//! is deliberately out of scope; this crate exposes exactly
//! one route, `GET /healthz`, as the seam a surrounding orchestrator would
//! attach a liveness probe to.

use crate::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize, serde::Deserialize)]
struct HealthBody {
    status: &'static str,
    backends_tracked: usize,
    kv_entries_cached: usize,
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthBody {
        status: "ok",
        backends_tracked: state.reconciler.get().len(),
        kv_entries_cached: state.cache.len(),
    })
}

/// Build the health router.
#[must_use]
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new().route("/healthz", get(healthz)).with_state(state)
}
