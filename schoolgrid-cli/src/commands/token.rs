//! Token minting for operators and tests

use anyhow::{Context, Result};
use clap::Parser;
use schoolgrid_core::PlatformConfig;
use schoolgrid_server::auth::{TokenKeys, TokenType};

#[derive(Parser, Debug)]
pub struct TokenArgs {
    /// User id (`auth_user.id`) to sign for
    #[arg(long)]
    pub user: i64,

    /// Mint a refresh token instead of an access token
    #[arg(long)]
    pub refresh: bool,
}

pub fn run_token(args: TokenArgs, config: PlatformConfig) -> Result<()> {
    let keys = TokenKeys::from_config(&config.auth);
    let token_type = if args.refresh {
        TokenType::Refresh
    } else {
        TokenType::Access
    };
    let token = keys.issue(args.user, token_type).context("failed to sign token")?;
    println!("{}", token);
    Ok(())
}
