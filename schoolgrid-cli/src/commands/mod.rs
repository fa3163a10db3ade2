//! Command implementations for the schoolgrid CLI

pub mod migrate;
pub mod serve;
pub mod tenant;
pub mod token;

// Re-export dispatcher functions for flat access from main.rs
pub use migrate::run_migrate;
pub use serve::run_serve;
pub use tenant::{run_notify, run_provision};
pub use token::run_token;

use anyhow::{Context, Result};
use schoolgrid_core::PlatformConfig;
use schoolgrid_server::db::create_pool_with_options;
use sqlx::PgPool;

/// Connect to the control-plane database named by `config`.
pub(crate) async fn control_plane(config: &PlatformConfig) -> Result<PgPool> {
    create_pool_with_options(
        &config.control_plane.database_url,
        config.control_plane.max_connections,
    )
    .await
    .context("failed to connect to the control-plane database (check DATABASE_URL)")
}
