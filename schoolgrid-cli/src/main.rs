//! schoolgrid CLI - operate the multi-tenant school platform
//!
//! - `serve` runs the HTTP service (auth, routing, live tenant registration)
//! - `migrate` applies control-plane or tenant-plane schema
//! - `provision` onboards a school database end to end
//! - `notify` re-announces an existing school database
//! - `token` mints access tokens for operators and tests
//! - `config` shows the effective configuration

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use schoolgrid_core::PlatformConfig;

mod commands;
mod tracing_setup;

#[derive(Parser, Debug)]
#[command(
    name = "schoolgrid",
    author,
    version,
    about = "Multi-tenant school platform: per-school database routing and onboarding"
)]
struct Cli {
    /// Config file (default: ~/.schoolgrid/config.toml if present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP service
    Serve(commands::serve::ServeArgs),
    /// Apply schema migrations to the control plane or tenant databases
    Migrate(commands::migrate::MigrateArgs),
    /// Provision a new school database and announce it
    Provision(commands::tenant::ProvisionArgs),
    /// Announce an existing school database to running services
    Notify(commands::tenant::NotifyArgs),
    /// Mint a signed token for a user
    Token(commands::token::TokenArgs),
    /// Show the effective configuration (secrets redacted)
    Config,
}

/// Load layered configuration. `strict` also validates it.
fn load_config(path: Option<&PathBuf>, strict: bool) -> Result<PlatformConfig> {
    let path = path.map(PathBuf::as_path);
    let config = if strict {
        PlatformConfig::load(path)
    } else {
        PlatformConfig::load_unchecked(path)
    };
    config.context("failed to load configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_setup::init(&tracing_setup::TracingConfig { debug: cli.debug }).ok();

    match cli.command {
        Commands::Serve(args) => {
            let config = args.apply(load_config(cli.config.as_ref(), false)?)?;
            commands::run_serve(config).await?
        }
        Commands::Migrate(args) => {
            commands::run_migrate(args, load_config(cli.config.as_ref(), false)?).await?
        }
        Commands::Provision(args) => {
            commands::run_provision(args, load_config(cli.config.as_ref(), false)?).await?
        }
        Commands::Notify(args) => {
            commands::run_notify(args, load_config(cli.config.as_ref(), false)?).await?
        }
        Commands::Token(args) => commands::run_token(args, load_config(cli.config.as_ref(), true)?)?,
        Commands::Config => {
            let config = load_config(cli.config.as_ref(), false)?;
            let shown = toml::to_string_pretty(&config.redacted()).context("failed to render config")?;
            print!("{}", shown);
        }
    }
    Ok(())
}
