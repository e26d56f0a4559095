// =============================================================================
// openrange — ORB breakout engine for US equity ETFs with a 0DTE sub-engine
// =============================================================================
//
// CLI surface:
//
//   openrange oauth start {sandbox|prod}      interactive 3-legged auth
//   openrange oauth status [sandbox|prod]     status JSON
//   openrange oauth keepalive {sandbox|prod|both}
//   openrange run {demo|live}                 the trading process for today
//   openrange balance {sandbox|prod}          balance JSON
//
// Commands exit 0 on success and non-zero with a stable error kind printed
// on failure.
// =============================================================================

mod adv;
mod api;
mod broker;
mod compound;
mod config;
mod engine;
mod events;
mod execution;
mod exit;
mod indicators;
mod market;
mod oauth;
mod options;
mod orb;
mod ranker;
mod types;
mod watchlist;

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::broker::{Broker, EtradeClient};
use crate::config::AppConfig;
use crate::oauth::keepalive;
use crate::oauth::token_store::TokenStore;
use crate::oauth::vault::TokenVault;
use crate::oauth::{AuthError, OAuthSession};
use crate::types::{Environment, TradeMode};

#[derive(Parser)]
#[command(name = "openrange", version, about = "Opening-range breakout trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Broker session management.
    Oauth {
        #[command(subcommand)]
        action: OauthAction,
    },
    /// Start the trading process for today.
    Run {
        /// demo (simulated fills) or live
        mode: TradeMode,
    },
    /// Print the account balance as JSON.
    Balance { environment: Environment },
}

#[derive(Subcommand)]
enum OauthAction {
    /// Interactive 3-legged authorization.
    Start { environment: Environment },
    /// Print the session status as JSON.
    Status { environment: Option<Environment> },
    /// One-shot lightweight keep-alive call.
    Keepalive {
        /// sandbox, prod, or both
        target: String,
    },
}

fn build_session(config: &Arc<AppConfig>) -> Result<Arc<OAuthSession>> {
    let vault = TokenVault::open(config.state_dir.join(".keys/token.key"))?;
    Ok(Arc::new(OAuthSession::new(
        config.clone(),
        TokenStore::new(&config.state_dir, vault),
    )))
}

/// Prompt the operator for the verifier PIN after they authorize in the
/// browser.
fn pin_prompt(auth_url: &str) -> Result<String, AuthError> {
    println!();
    println!("============================================================");
    println!(" Broker authorization required");
    println!("============================================================");
    println!(" 1. Open:   {auth_url}");
    println!(" 2. Log in and authorize the application");
    println!(" 3. Copy the verification code (PIN) from the page");
    println!("============================================================");
    print!("Enter verification code (PIN): ");
    std::io::stdout().flush().ok();

    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|_| AuthError::UserAborted)?;
    Ok(line)
}

async fn cmd_oauth_start(config: Arc<AppConfig>, env: Environment) -> Result<()> {
    let session = build_session(&config)?;
    session.start(env, pin_prompt).await?;
    println!("oauth start: ok ({env})");
    Ok(())
}

fn cmd_oauth_status(config: Arc<AppConfig>, env: Option<Environment>) -> Result<()> {
    let session = build_session(&config)?;
    let targets = match env {
        Some(e) => vec![e],
        None => vec![Environment::Sandbox, Environment::Prod],
    };
    let statuses: Vec<_> = targets.into_iter().map(|e| session.status(e)).collect();
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

async fn cmd_oauth_keepalive(config: Arc<AppConfig>, target: &str) -> Result<()> {
    let session = build_session(&config)?;
    let envs: Vec<Environment> = match target {
        "both" => vec![Environment::Sandbox, Environment::Prod],
        other => vec![other.parse().map_err(|e: String| anyhow::anyhow!(e))?],
    };
    for env in envs {
        match keepalive::run_pass(&session, env).await {
            Ok(true) => println!("keepalive {env}: call made"),
            Ok(false) => println!("keepalive {env}: not due"),
            Err(e) => {
                eprintln!("keepalive {env}: {e}");
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn cmd_balance(config: Arc<AppConfig>, env: Environment) -> Result<()> {
    let session = build_session(&config)?;
    let client = EtradeClient::new(session, env);
    let accounts = client.list_accounts().await?;
    let account = accounts
        .first()
        .ok_or_else(|| anyhow::anyhow!("no brokerage account available"))?;
    let balance = client.get_balance(&account.account_id_key).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "account_id": account.account_id,
            "balance": balance,
        }))?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env()?;

    let result = match cli.command {
        Commands::Oauth { action } => match action {
            OauthAction::Start { environment } => {
                cmd_oauth_start(Arc::new(config), environment).await
            }
            OauthAction::Status { environment } => cmd_oauth_status(Arc::new(config), environment),
            OauthAction::Keepalive { target } => {
                cmd_oauth_keepalive(Arc::new(config), &target).await
            }
        },
        Commands::Run { mode } => {
            config.trade_mode = mode;
            info!(mode = %mode, environment = %config.environment, "starting trading process");
            engine::run_trading(config).await
        }
        Commands::Balance { environment } => cmd_balance(Arc::new(config), environment).await,
    };

    if let Err(e) = &result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
    Ok(())
}
