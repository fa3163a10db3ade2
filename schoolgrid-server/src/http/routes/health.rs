//! Health check endpoint

use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::listener::ListenerHealth;
use crate::state::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Startup reconciliation has completed.
    pub reconciled: bool,
    pub registered_tenants: usize,
    pub listener: Option<ListenerHealth>,
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        reconciled: state.reconciler().is_ready(),
        registered_tenants: state.registry().len(),
        listener: state.listener().map(|l| l.health()),
    })
}

/// Health routes
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
