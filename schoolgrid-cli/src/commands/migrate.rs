//! Schema migration command

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use schoolgrid_core::{DbKey, Plane, PlatformConfig};
use schoolgrid_server::db::migrations::migrate;
use schoolgrid_server::db::{PgTenantDirectory, TenantDirectory};
use schoolgrid_server::provision::{MigratingInitializer, TenantInitializer};
use schoolgrid_server::Target;

#[derive(Parser, Debug)]
pub struct MigrateArgs {
    #[command(subcommand)]
    pub target: MigrateTarget,
}

#[derive(Subcommand, Debug)]
pub enum MigrateTarget {
    /// Identity, billing and tenant directory tables
    ControlPlane,
    /// School tables on one school database, or on every active one
    Tenant {
        /// Database name as recorded in the tenant directory
        #[arg(required_unless_present = "all")]
        db_name: Option<String>,

        /// Migrate every active school database
        #[arg(long, conflicts_with = "db_name")]
        all: bool,
    },
}

pub async fn run_migrate(args: MigrateArgs, config: PlatformConfig) -> Result<()> {
    // Validate input before connecting anywhere
    let key = match &args.target {
        MigrateTarget::Tenant {
            db_name: Some(name), ..
        } => Some(DbKey::parse(name).context("invalid database name")?),
        _ => None,
    };

    let pool = super::control_plane(&config).await?;

    match args.target {
        MigrateTarget::ControlPlane => {
            let applied = migrate(&pool, Target::ControlPlane, Plane::ControlPlane)
                .await
                .context("control-plane migration failed")?;
            println!("control-plane: {} migration(s) applied", applied);
        }
        MigrateTarget::Tenant { .. } => {
            let directory = PgTenantDirectory::new(pool.clone());
            let descriptors = match key {
                Some(key) => vec![directory
                    .find_by_key(&key)
                    .await?
                    .with_context(|| format!("no directory row for '{}'", key))?],
                None => directory.active_descriptors().await?,
            };

            for descriptor in &descriptors {
                let applied = MigratingInitializer
                    .initialize(descriptor)
                    .await
                    .with_context(|| format!("migration of '{}' failed", descriptor.db_name))?;
                println!("{}: {} migration(s) applied", descriptor.db_name, applied);
            }
        }
    }

    pool.close().await;
    Ok(())
}
