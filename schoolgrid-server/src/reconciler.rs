//! Startup reconciler - loads every active directory row into the registry
//! before tenant-scoped traffic is served.
//!
//! Runs at most once per process. Concurrent first requests share one load;
//! a failed load leaves the reconciler unset so the next request retries the
//! whole thing. The load itself runs on its own task, so a request that is
//! cancelled while waiting does not abort it for anyone else.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::auth::is_exempt;
use crate::db::{DirectoryError, TenantDirectory};
use crate::http::error::ApiError;
use crate::registry::{ConnectionRegistry, Registration, RegistryError};
use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to read tenant directory: {0}")]
    Directory(#[from] DirectoryError),

    #[error("failed to register tenant: {0}")]
    Registry(#[from] RegistryError),

    #[error("reconciliation task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub loaded: usize,
    pub added: usize,
    pub already_present: usize,
}

pub struct StartupReconciler {
    directory: Arc<dyn TenantDirectory>,
    registry: Arc<ConnectionRegistry>,
    done: OnceCell<ReconcileReport>,
}

impl StartupReconciler {
    pub fn new(directory: Arc<dyn TenantDirectory>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            directory,
            registry,
            done: OnceCell::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.done.initialized()
    }

    pub fn report(&self) -> Option<ReconcileReport> {
        self.done.get().copied()
    }

    /// Reconcile if no load has succeeded yet; otherwise return immediately.
    pub async fn ensure(&self) -> Result<ReconcileReport, SetupError> {
        let report = self
            .done
            .get_or_try_init(|| {
                let directory = Arc::clone(&self.directory);
                let registry = Arc::clone(&self.registry);
                async move {
                    tokio::spawn(load_all(directory, registry))
                        .await
                        .map_err(|e| SetupError::Aborted(e.to_string()))?
                }
            })
            .await?;
        Ok(*report)
    }
}

async fn load_all(
    directory: Arc<dyn TenantDirectory>,
    registry: Arc<ConnectionRegistry>,
) -> Result<ReconcileReport, SetupError> {
    let descriptors = directory.active_descriptors().await?;
    let mut report = ReconcileReport {
        loaded: descriptors.len(),
        ..Default::default()
    };

    for descriptor in &descriptors {
        match registry.register(descriptor)? {
            Registration::Added => report.added += 1,
            Registration::AlreadyPresent => report.already_present += 1,
        }
    }

    tracing::info!(
        loaded = report.loaded,
        added = report.added,
        already_present = report.already_present,
        "tenant registry reconciled"
    );
    Ok(report)
}

/// Request stage: block tenant-scoped requests until reconciliation has
/// succeeded once. Failure fails only this request.
pub async fn ensure_reconciled(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    if let Err(err) = state.reconciler().ensure().await {
        tracing::error!(error = %err, "startup reconciliation failed");
        return ApiError::from(err).into_response();
    }
    next.run(request).await
}
