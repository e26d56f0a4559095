// =============================================================================
// Token store — per-environment token + metrics persistence
// =============================================================================
//
// Two files per environment under the state directory:
//
//   tokens_{env}.json    token pair (ciphertext), timestamps, ET issue date
//   metrics_{env}.json   operational counters for the session manager
//
// Token files carry owner-only permissions. Writes are atomic (tmp + rename).
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::vault::{restrict_permissions, TokenVault};
use crate::types::Environment;

/// Decrypted access-token state for one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub oauth_token: String,
    pub oauth_token_secret: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub last_renewed: Option<DateTime<Utc>>,
    /// Broker tokens die at the first ET midnight after issue.
    pub expires_at: DateTime<Utc>,
    /// ET calendar date the token was issued on.
    pub issued_et_date: NaiveDate,
}

impl TokenInfo {
    /// Idle duration since the token last backed a signed call.
    pub fn idle(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_used
    }
}

/// On-disk shape; the two token fields are vault ciphertext.
#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    oauth_token: String,
    oauth_token_secret: String,
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    last_renewed: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    issued_et_date: NaiveDate,
}

/// Operational counters surfaced by `oauth status` and the keep-alive loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationalMetrics {
    #[serde(default)]
    pub renew_attempts: u64,
    #[serde(default)]
    pub renew_failures: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_401_count: u64,
    #[serde(default)]
    pub last_successful_call: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_midnight_et: Option<DateTime<Utc>>,
}

/// Encrypted persistence for tokens and metrics.
pub struct TokenStore {
    dir: PathBuf,
    vault: TokenVault,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>, vault: TokenVault) -> Self {
        Self {
            dir: dir.into(),
            vault,
        }
    }

    fn token_path(&self, env: Environment) -> PathBuf {
        self.dir.join(format!("tokens_{}.json", env.key()))
    }

    fn metrics_path(&self, env: Environment) -> PathBuf {
        self.dir.join(format!("metrics_{}.json", env.key()))
    }

    fn write_atomic(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;
        Ok(())
    }

    /// Persist tokens for `env`, encrypting the secret fields.
    pub fn save_tokens(&self, env: Environment, info: &TokenInfo) -> Result<()> {
        let file = TokenFile {
            oauth_token: self.vault.encrypt(&info.oauth_token),
            oauth_token_secret: self.vault.encrypt(&info.oauth_token_secret),
            created_at: info.created_at,
            last_used: info.last_used,
            last_renewed: info.last_renewed,
            expires_at: info.expires_at,
            issued_et_date: info.issued_et_date,
        };
        let content = serde_json::to_string_pretty(&file).context("failed to serialise tokens")?;
        let path = self.token_path(env);
        Self::write_atomic(&path, &content)?;
        restrict_permissions(&path)?;
        debug!(env = %env, path = %path.display(), "tokens saved");
        Ok(())
    }

    /// Load and decrypt tokens for `env`. `Ok(None)` when no file exists.
    pub fn load_tokens(&self, env: Environment) -> Result<Option<TokenInfo>> {
        let path = self.token_path(env);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file: TokenFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        Ok(Some(TokenInfo {
            oauth_token: self.vault.decrypt(&file.oauth_token)?,
            oauth_token_secret: self.vault.decrypt(&file.oauth_token_secret)?,
            created_at: file.created_at,
            last_used: file.last_used,
            last_renewed: file.last_renewed,
            expires_at: file.expires_at,
            issued_et_date: file.issued_et_date,
        }))
    }

    /// Remove the token file (after daily expiry or revocation).
    pub fn clear_tokens(&self, env: Environment) -> Result<()> {
        let path = self.token_path(env);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            info!(env = %env, "tokens cleared");
        }
        Ok(())
    }

    /// Persist metrics for `env`.
    pub fn save_metrics(&self, env: Environment, metrics: &OperationalMetrics) -> Result<()> {
        let content =
            serde_json::to_string_pretty(metrics).context("failed to serialise metrics")?;
        Self::write_atomic(&self.metrics_path(env), &content)
    }

    /// Load metrics for `env`; defaults when absent or unreadable.
    pub fn load_metrics(&self, env: Environment) -> OperationalMetrics {
        let path = self.metrics_path(env);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> (tempfile::TempDir, TokenStore) {
        let dir = tempfile::tempdir().unwrap();
        let vault = TokenVault::from_key([3u8; 32]);
        let store = TokenStore::new(dir.path(), vault);
        (dir, store)
    }

    fn sample_tokens() -> TokenInfo {
        let now = Utc.with_ymd_and_hms(2026, 1, 6, 14, 0, 0).unwrap();
        TokenInfo {
            oauth_token: "access-token-abc".into(),
            oauth_token_secret: "access-secret-xyz".into(),
            created_at: now,
            last_used: now,
            last_renewed: None,
            expires_at: Utc.with_ymd_and_hms(2026, 1, 7, 5, 0, 0).unwrap(),
            issued_et_date: NaiveDate::from_ymd_opt(2026, 1, 6).unwrap(),
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let (_dir, store) = store();
        let info = sample_tokens();
        store.save_tokens(Environment::Sandbox, &info).unwrap();
        let loaded = store.load_tokens(Environment::Sandbox).unwrap().unwrap();
        assert_eq!(loaded, info);
    }

    #[test]
    fn secrets_are_not_plaintext_on_disk() {
        let (dir, store) = store();
        let info = sample_tokens();
        store.save_tokens(Environment::Prod, &info).unwrap();

        let raw =
            std::fs::read_to_string(dir.path().join("tokens_prod.json")).unwrap();
        assert!(!raw.contains("access-token-abc"));
        assert!(!raw.contains("access-secret-xyz"));
    }

    #[test]
    fn environments_are_isolated() {
        let (_dir, store) = store();
        store.save_tokens(Environment::Sandbox, &sample_tokens()).unwrap();
        assert!(store.load_tokens(Environment::Prod).unwrap().is_none());
    }

    #[test]
    fn clear_removes_file() {
        let (_dir, store) = store();
        store.save_tokens(Environment::Sandbox, &sample_tokens()).unwrap();
        store.clear_tokens(Environment::Sandbox).unwrap();
        assert!(store.load_tokens(Environment::Sandbox).unwrap().is_none());
    }

    #[test]
    fn metrics_default_when_absent() {
        let (_dir, store) = store();
        let m = store.load_metrics(Environment::Sandbox);
        assert_eq!(m.renew_attempts, 0);
        assert_eq!(m.consecutive_failures, 0);
    }

    #[test]
    fn metrics_roundtrip() {
        let (_dir, store) = store();
        let mut m = OperationalMetrics::default();
        m.renew_attempts = 5;
        m.consecutive_failures = 2;
        store.save_metrics(Environment::Prod, &m).unwrap();
        let loaded = store.load_metrics(Environment::Prod);
        assert_eq!(loaded.renew_attempts, 5);
        assert_eq!(loaded.consecutive_failures, 2);
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, store) = store();
        store.save_tokens(Environment::Sandbox, &sample_tokens()).unwrap();
        let mode = std::fs::metadata(dir.path().join("tokens_sandbox.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
