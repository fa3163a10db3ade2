//! Connection reaper - end-of-request cleanup of the connections a request
//! touched.
//!
//! Runs after the response is produced, success or error. Tenant pools that
//! were closed or marked unusable during the request are recycled through
//! the registry. It never reads or clears the request's tenant scope.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::registry::ConnectionRegistry;
use crate::routing::{handle_of, Target, TouchedConnections};
use crate::state::AppState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    pub inspected: usize,
    pub recycled: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ConnectionReaper {
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionReaper {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Never waits on a pool: retired pools close in the background.
    pub fn reap(&self, touched: &TouchedConnections) -> ReapReport {
        let mut report = ReapReport::default();

        for conn in touched.drain() {
            report.inspected += 1;
            match conn.target() {
                Target::ControlPlane => {
                    if conn.pool().is_closed() {
                        tracing::error!("control-plane pool is closed");
                    }
                }
                Target::Tenant(tenant) => {
                    let Some(handle) = handle_of(&conn) else {
                        continue;
                    };
                    if !handle.needs_recycle() {
                        continue;
                    }
                    // Only recycle the handle this request saw; a concurrent
                    // request may already have replaced it.
                    let current = match self.registry.resolve(tenant) {
                        Ok(current) => current,
                        Err(_) => continue,
                    };
                    if current.generation() != handle.generation() {
                        continue;
                    }
                    match self.registry.recycle(tenant) {
                        Ok(true) => report.recycled += 1,
                        Ok(false) => {}
                        Err(err) => {
                            tracing::error!(%tenant, error = %err, "failed to recycle tenant pool");
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        if report.recycled > 0 || report.failed > 0 {
            tracing::info!(
                inspected = report.inspected,
                recycled = report.recycled,
                failed = report.failed,
                "connection reaper pass"
            );
        }
        report
    }
}

/// Outermost request stage: installs the touched-connection ledger, runs the
/// rest of the pipeline, then reaps.
pub async fn reap_connections(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let touched = TouchedConnections::new();
    request.extensions_mut().insert(touched.clone());

    let response = next.run(request).await;
    state.reaper().reap(&touched);
    response
}
