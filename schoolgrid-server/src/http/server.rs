//! Axum server setup
//!
//! Request pipeline, outermost first:
//! - tracing and CORS (localhost only by default)
//! - connection reaper (installs the per-request ledger, reaps after)
//! - startup reconciler gate
//! - authentication stage (binds the tenant scope)
//!
//! Graceful shutdown on SIGTERM/Ctrl+C also stops the registration listener.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::{middleware, Router};
use schoolgrid_core::{Plane, PlatformConfig};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::routes;
use crate::auth::{self, TokenKeys};
use crate::db::migrations::{migrate, MigrationError};
use crate::db::{create_pool_with_options, LazyPoolFactory, PgPrincipalStore, PgTenantDirectory, TenantDirectory};
use crate::listener::{PgNotificationSource, RegistrationListener};
use crate::provision::{MigratingInitializer, PgPublisher, Provisioner};
use crate::reaper::reap_connections;
use crate::reconciler::ensure_reconciled;
use crate::registry::ConnectionRegistry;
use crate::routing::Target;
use crate::state::{AppState, Platform};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (default: 127.0.0.1:8000)
    pub bind_addr: SocketAddr,

    /// Allow permissive CORS (default: false = localhost only)
    ///
    /// WARNING: Setting this to true allows any origin.
    /// Only use for development or documented use cases.
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            cors_permissive: false,
        }
    }
}

impl From<&PlatformConfig> for ServerConfig {
    fn from(config: &PlatformConfig) -> Self {
        Self {
            bind_addr: config.server.bind,
            cors_permissive: config.server.cors_permissive,
        }
    }
}

fn cors_layer(permissive: bool) -> CorsLayer {
    if permissive {
        tracing::warn!("CORS: Permissive mode enabled - all origins allowed");
        CorsLayer::permissive()
    } else {
        // Localhost only
        CorsLayer::new()
            .allow_origin([
                HeaderValue::from_static("http://localhost:3000"),
                HeaderValue::from_static("http://localhost:8000"),
                HeaderValue::from_static("http://127.0.0.1:3000"),
                HeaderValue::from_static("http://127.0.0.1:8000"),
            ])
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Build the application router with every request stage attached.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::auth::router())
        .merge(routes::platform::router())
        .merge(routes::classes::router())
        .layer(middleware::from_fn_with_state(state.clone(), auth::authenticate))
        .layer(middleware::from_fn_with_state(state.clone(), ensure_reconciled))
        .layer(middleware::from_fn_with_state(state.clone(), reap_connections))
        .layer(cors_layer(config.cors_permissive))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the service until a shutdown signal arrives.
pub async fn run_server(config: PlatformConfig) -> Result<(), ServerError> {
    let server_config = ServerConfig::from(&config);

    let control_plane = create_pool_with_options(
        &config.control_plane.database_url,
        config.control_plane.max_connections,
    )
    .await?;
    let applied = migrate(&control_plane, Target::ControlPlane, Plane::ControlPlane).await?;
    tracing::info!(applied, "control-plane schema ready");

    let directory: Arc<dyn TenantDirectory> = Arc::new(PgTenantDirectory::new(control_plane.clone()));
    let registry = Arc::new(ConnectionRegistry::new(Arc::new(LazyPoolFactory::new(
        config.tenant_pools.clone(),
    ))));

    let listener = RegistrationListener::new(
        Arc::new(PgNotificationSource::new(control_plane.clone())),
        Arc::clone(&directory),
        Arc::clone(&registry),
        &config.listener,
    )
    .spawn();

    let provisioner = Provisioner::new(
        Arc::clone(&directory),
        Arc::clone(&registry),
        Arc::new(MigratingInitializer),
        Arc::new(PgPublisher::new(control_plane.clone())),
        config.listener.channel.clone(),
        config.routing.evict_on_deactivate,
    );

    let state = AppState::new(Platform {
        control_plane: control_plane.clone(),
        directory,
        principals: Arc::new(PgPrincipalStore::new(control_plane.clone())),
        registry,
        keys: TokenKeys::from_config(&config.auth),
        policy: config.routing.missing_context,
        provisioner: Arc::new(provisioner),
        listener: Some(listener.status()),
    });

    // Warm the registry now; a failure here is retried by the first request.
    if let Err(err) = state.reconciler().ensure().await {
        tracing::warn!(error = %err, "startup reconciliation failed, will retry on first request");
    }

    let app = build_router(state, &server_config);

    // Bind listener
    let tcp = TcpListener::bind(server_config.bind_addr).await?;
    tracing::info!(
        "Server listening on {} (missing context policy: {:?})",
        server_config.bind_addr,
        config.routing.missing_context
    );

    // Run with graceful shutdown
    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    listener.shutdown().await;
    control_plane.close().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting shutdown");
        }
    }
}

/// Server error type
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control-plane database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("control-plane migration failed: {0}")]
    Migration(#[from] MigrationError),
}
