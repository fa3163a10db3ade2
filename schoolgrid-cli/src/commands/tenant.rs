//! School onboarding commands

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use schoolgrid_core::{DbKey, PlatformConfig, TenantId};
use schoolgrid_server::db::{LazyPoolFactory, PgTenantDirectory};
use schoolgrid_server::provision::{MigratingInitializer, PgPublisher, ProvisionRequest, Provisioner, Publisher};
use schoolgrid_server::ConnectionRegistry;

#[derive(Parser, Debug)]
pub struct ProvisionArgs {
    /// School id (primary key of the `school` row)
    #[arg(long)]
    pub tenant_id: i64,

    /// Database name, lowercase letters, digits and underscores
    #[arg(long)]
    pub db_name: String,

    #[arg(long)]
    pub db_user: String,

    #[arg(long, env = "SCHOOLGRID_TENANT_DB_PASSWORD", hide_env_values = true)]
    pub db_password: String,

    /// Database host (default: 127.0.0.1)
    #[arg(long)]
    pub db_host: Option<String>,

    /// Database port (default: 5432)
    #[arg(long)]
    pub db_port: Option<u16>,
}

impl ProvisionArgs {
    fn into_request(self) -> ProvisionRequest {
        ProvisionRequest {
            tenant_id: TenantId(self.tenant_id),
            db_name: self.db_name,
            db_user: self.db_user,
            db_password: self.db_password,
            db_host: self.db_host,
            db_port: self.db_port,
        }
    }
}

pub async fn run_provision(args: ProvisionArgs, config: PlatformConfig) -> Result<()> {
    let request = args.into_request();
    request.clone().into_descriptor().context("invalid provisioning request")?;

    let pool = super::control_plane(&config).await?;
    let provisioner = Provisioner::new(
        Arc::new(PgTenantDirectory::new(pool.clone())),
        Arc::new(ConnectionRegistry::new(Arc::new(LazyPoolFactory::new(
            config.tenant_pools.clone(),
        )))),
        Arc::new(MigratingInitializer),
        Arc::new(PgPublisher::new(pool.clone())),
        config.listener.channel.clone(),
        false,
    );

    let report = provisioner
        .provision(request)
        .await
        .context("provisioning failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    pool.close().await;
    Ok(())
}

#[derive(Parser, Debug)]
pub struct NotifyArgs {
    /// Database name to announce
    pub db_name: String,
}

pub async fn run_notify(args: NotifyArgs, config: PlatformConfig) -> Result<()> {
    let key = DbKey::parse(&args.db_name).context("invalid database name")?;

    let pool = super::control_plane(&config).await?;
    PgPublisher::new(pool.clone())
        .publish(&config.listener.channel, key.as_str())
        .await
        .context("failed to publish")?;
    println!("announced '{}' on '{}'", key, config.listener.channel);

    pool.close().await;
    Ok(())
}
