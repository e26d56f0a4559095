// =============================================================================
// Configuration — immutable environment config + hot-reloadable tunables
// =============================================================================
//
// Two layers:
//
//   * `AppConfig` — read once at startup from environment variables (and an
//     optional `.env`). Credentials, broker URLs, file locations, mode. All
//     components receive it behind an Arc; nothing re-reads the environment
//     after boot.
//
//   * `RuntimeConfig` — tunable trading parameters persisted as JSON with an
//     atomic tmp + rename save. Every field carries `#[serde(default)]` so
//     adding new fields never breaks loading an older file.
//
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Environment, TradeMode};

// =============================================================================
// AppConfig — process-wide, immutable
// =============================================================================

/// Per-environment broker credentials.
#[derive(Debug, Clone)]
pub struct ConsumerCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
}

/// Process-wide configuration parsed from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Active broker environment.
    pub environment: Environment,
    /// Demo (simulated fills) or Live.
    pub trade_mode: TradeMode,
    /// Sandbox consumer credentials, if set.
    pub sandbox_credentials: Option<ConsumerCredentials>,
    /// Production consumer credentials, if set.
    pub prod_credentials: Option<ConsumerCredentials>,
    /// Directory for token files, metrics, snapshots, and the ADV cache.
    pub state_dir: PathBuf,
    /// Equity watchlist CSV path.
    pub watchlist_path: PathBuf,
    /// 0DTE watchlist CSV path.
    pub zero_dte_watchlist_path: PathBuf,
    /// ADV-based position-size guard.
    pub slip_guard_enabled: bool,
    /// ADV fraction cap in percent (e.g. 1.0 = 1% of ADV).
    pub slip_guard_adv_pct: f64,
    /// ADV rolling window in days.
    pub slip_guard_lookback_days: u32,
    /// Master switch for the exit monitor loop.
    pub exit_monitoring_enabled: bool,
    /// Bind address for the health/status API.
    pub bind_addr: String,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_var(name) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl AppConfig {
    /// Parse configuration from the process environment.
    ///
    /// Missing credentials are not an error here; operations that need them
    /// fail with `CredentialsMissing` when actually invoked.
    pub fn from_env() -> Result<Self> {
        let environment: Environment = env_var("ETRADE_ENVIRONMENT")
            .unwrap_or_else(|| "sandbox".into())
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        let trade_mode: TradeMode = env_var("ETRADE_MODE")
            .unwrap_or_else(|| "demo".into())
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        let sandbox_credentials = match (env_var("ETRADE_SANDBOX_KEY"), env_var("ETRADE_SANDBOX_SECRET"))
        {
            (Some(consumer_key), Some(consumer_secret)) => Some(ConsumerCredentials {
                consumer_key,
                consumer_secret,
            }),
            _ => None,
        };

        let prod_credentials = match (env_var("ETRADE_PROD_KEY"), env_var("ETRADE_PROD_SECRET")) {
            (Some(consumer_key), Some(consumer_secret)) => Some(ConsumerCredentials {
                consumer_key,
                consumer_secret,
            }),
            _ => None,
        };

        let state_dir = PathBuf::from(env_var("OPENRANGE_STATE_DIR").unwrap_or_else(|| "state".into()));

        let config = Self {
            environment,
            trade_mode,
            sandbox_credentials,
            prod_credentials,
            watchlist_path: PathBuf::from(
                env_var("OPENRANGE_WATCHLIST").unwrap_or_else(|| "watchlist.csv".into()),
            ),
            zero_dte_watchlist_path: PathBuf::from(
                env_var("OPENRANGE_0DTE_WATCHLIST").unwrap_or_else(|| "watchlist_0dte.csv".into()),
            ),
            slip_guard_enabled: env_bool("SLIP_GUARD_ENABLED", true),
            slip_guard_adv_pct: env_f64("SLIP_GUARD_ADV_PCT", 1.0),
            slip_guard_lookback_days: env_u32("SLIP_GUARD_LOOKBACK_DAYS", 90),
            exit_monitoring_enabled: env_bool("EXIT_MONITORING_ENABLED", true),
            bind_addr: env_var("OPENRANGE_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3001".into()),
            state_dir,
        };

        info!(
            environment = %config.environment,
            trade_mode = %config.trade_mode,
            state_dir = %config.state_dir.display(),
            slip_guard = config.slip_guard_enabled,
            "app config loaded"
        );

        Ok(config)
    }

    /// Consumer credentials for `env`, or `None` when unset.
    pub fn credentials(&self, env: Environment) -> Option<&ConsumerCredentials> {
        match env {
            Environment::Sandbox => self.sandbox_credentials.as_ref(),
            Environment::Prod => self.prod_credentials.as_ref(),
        }
    }
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_trading_capital_pct() -> f64 {
    90.0
}

fn default_max_position_pct() -> f64 {
    35.0
}

fn default_max_concurrent_positions() -> usize {
    10
}

fn default_monitor_interval_secs() -> u64 {
    30
}

fn default_stop_cooldown_secs() -> u64 {
    30
}

fn default_gap_risk_pct() -> f64 {
    2.0
}

fn default_options_account_value() -> f64 {
    10_000.0
}

fn default_broker_call_limit() -> usize {
    8
}

fn default_true() -> bool {
    true
}

// =============================================================================
// RuntimeConfig — tunables, JSON-persisted
// =============================================================================

/// Tunable trading parameters. Persisted between sessions; every field has a
/// serde default so an older file missing new fields still deserialises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Percentage of the account deployable for trading (the other 10% is
    /// held in reserve).
    #[serde(default = "default_trading_capital_pct")]
    pub trading_capital_pct: f64,

    /// Per-position cap as a percentage of the account.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,

    /// Maximum signals considered for capital allocation per batch.
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,

    /// Exit monitor cadence in seconds (floor of 5 for volatile regimes).
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Minimum wall-clock spacing between stop promotions for one position.
    #[serde(default = "default_stop_cooldown_secs")]
    pub stop_cooldown_secs: u64,

    /// Drop from the 45-minute time-weighted peak that preempts trailing.
    #[serde(default = "default_gap_risk_pct")]
    pub gap_risk_pct: f64,

    /// Dedicated 0DTE sub-account value for options sizing.
    #[serde(default = "default_options_account_value")]
    pub options_account_value: f64,

    /// Maximum concurrent in-flight broker calls.
    #[serde(default = "default_broker_call_limit")]
    pub broker_call_limit: usize,

    /// Whether the 0DTE options sub-engine is active.
    #[serde(default = "default_true")]
    pub options_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_capital_pct: default_trading_capital_pct(),
            max_position_pct: default_max_position_pct(),
            max_concurrent_positions: default_max_concurrent_positions(),
            monitor_interval_secs: default_monitor_interval_secs(),
            stop_cooldown_secs: default_stop_cooldown_secs(),
            gap_risk_pct: default_gap_risk_pct(),
            options_account_value: default_options_account_value(),
            broker_call_limit: default_broker_call_limit(),
            options_enabled: true,
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON file. Missing file is an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    /// Persist using an atomic write (write to `.tmp`, then rename) so a
    /// crash mid-write cannot corrupt the file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved");
        Ok(())
    }
}
