// =============================================================================
// ADV Cache — rolling average-dollar-volume for liquidity position caps
// =============================================================================
//
// A process-wide map from ticker to 90-day average daily dollar volume.
// Refreshed once per day at 06:00 local from the historical-data source; on
// failure the previous disk cache keeps serving with a staleness flag after
// 24 hours. Sizing consults `limit(symbol, mode)`:
//
//   conservative  0.5% of ADV
//   aggressive    1.0% of ADV
//
// When the guard is disabled or the symbol is unknown the limit is +inf so
// the cash/budget caps bind instead.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Hours after which cached ADV data is considered stale.
const STALE_AFTER_HOURS: i64 = 24;

/// Sizing aggressiveness for the ADV cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvMode {
    Conservative,
    Aggressive,
}

impl AdvMode {
    fn fraction(&self) -> f64 {
        match self {
            Self::Conservative => 0.005,
            Self::Aggressive => 0.01,
        }
    }
}

/// On-disk cache shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AdvCacheFile {
    /// Ticker → average daily dollar volume.
    adv_data: HashMap<String, f64>,
    /// When the data was last refreshed from source.
    last_refresh: Option<DateTime<Utc>>,
    /// Rolling window used to compute the averages.
    lookback_days: u32,
}

/// The in-process ADV cache.
pub struct AdvCache {
    inner: RwLock<AdvCacheFile>,
    path: PathBuf,
    enabled: bool,
}

impl AdvCache {
    /// Create a cache backed by `path`, loading any existing file.
    pub fn new(path: impl Into<PathBuf>, enabled: bool, lookback_days: u32) -> Self {
        let path = path.into();
        let mut inner = match Self::load_file(&path) {
            Ok(Some(file)) => {
                info!(
                    path = %path.display(),
                    symbols = file.adv_data.len(),
                    "ADV cache loaded from disk"
                );
                file
            }
            Ok(None) => AdvCacheFile::default(),
            Err(e) => {
                warn!(error = %e, "failed to load ADV cache, starting empty");
                AdvCacheFile::default()
            }
        };
        inner.lookback_days = lookback_days;

        Self {
            inner: RwLock::new(inner),
            path,
            enabled,
        }
    }

    fn load_file(path: &Path) -> Result<Option<AdvCacheFile>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ADV cache {}", path.display()))?;
        let file = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse ADV cache {}", path.display()))?;
        Ok(Some(file))
    }

    /// Replace the dataset after a successful refresh and persist it.
    pub fn refresh(&self, data: HashMap<String, f64>, now: DateTime<Utc>) -> Result<()> {
        {
            let mut inner = self.inner.write();
            inner.adv_data = data;
            inner.last_refresh = Some(now);
        }
        self.save()?;
        let inner = self.inner.read();
        info!(symbols = inner.adv_data.len(), "ADV data refreshed");
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let content = {
            let inner = self.inner.read();
            serde_json::to_string_pretty(&*inner).context("failed to serialise ADV cache")?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename into {}", self.path.display()))?;
        Ok(())
    }

    /// ADV for `symbol`, if known.
    pub fn adv(&self, symbol: &str) -> Option<f64> {
        self.inner.read().adv_data.get(symbol).copied()
    }

    /// Dollar cap for a single position in `symbol` under `mode`.
    ///
    /// `+inf` when the guard is disabled or the symbol has no ADV data, so
    /// the cash and budget caps bind instead.
    pub fn limit(&self, symbol: &str, mode: AdvMode) -> f64 {
        if !self.enabled {
            return f64::INFINITY;
        }
        match self.adv(symbol) {
            Some(adv) if adv > 0.0 => adv * mode.fraction(),
            _ => f64::INFINITY,
        }
    }

    /// Whether the data is older than 24 hours (or absent).
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.inner.read().last_refresh {
            Some(at) => now - at > Duration::hours(STALE_AFTER_HOURS),
            None => true,
        }
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_refresh
    }

    pub fn symbol_count(&self) -> usize {
        self.inner.read().adv_data.len()
    }
}
