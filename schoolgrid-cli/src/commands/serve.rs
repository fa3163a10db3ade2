//! HTTP service command

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use schoolgrid_core::{MissingContextPolicy, PlatformConfig};
use schoolgrid_server::run_server;

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to bind to (default: 127.0.0.1:8000)
    #[arg(long, short = 'b')]
    pub bind: Option<SocketAddr>,

    /// Allow permissive CORS (all origins) - use with caution
    #[arg(long)]
    pub cors_permissive: bool,

    /// Control-plane database URL (overrides config/environment)
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Tenant-plane access without a bound school: reject or control_plane
    #[arg(long, value_name = "POLICY")]
    pub missing_context: Option<MissingContextPolicy>,

    /// Close a school's live pool when it is deactivated
    #[arg(long)]
    pub evict_on_deactivate: bool,
}

impl ServeArgs {
    /// Apply flags on top of the loaded configuration and validate it.
    pub fn apply(self, mut config: PlatformConfig) -> Result<PlatformConfig> {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if self.cors_permissive {
            config.server.cors_permissive = true;
        }
        if let Some(url) = self.database_url {
            config.control_plane.database_url = url;
        }
        if let Some(policy) = self.missing_context {
            config.routing.missing_context = policy;
        }
        if self.evict_on_deactivate {
            config.routing.evict_on_deactivate = true;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Run the HTTP service (blocks until shutdown)
pub async fn run_serve(config: PlatformConfig) -> Result<()> {
    tracing::info!(
        bind = %config.server.bind,
        channel = %config.listener.channel,
        "starting schoolgrid server"
    );
    run_server(config).await.context("Server error")?;
    Ok(())
}
