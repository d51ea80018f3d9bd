//! Configuration for the treasury ledger.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::Amount;
use crate::model::SplitPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Ledger configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub split: SplitConfig,
    pub refund: RefundConfig,
    pub payout: PayoutConfig,
    pub reserve: ReserveConfig,
    pub reconcile: ReconcileConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Platform commission in basis points (3500 = 35%)
    pub platform_rate_bps: u32,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            platform_rate_bps: 3_500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefundConfig {
    /// Seconds after a spend during which users may refund it
    pub grace_window_secs: u64,
    /// Refund requests a user may file per rolling 24 hours
    pub daily_quota: u32,
}

impl RefundConfig {
    /// `None` when the window does not fit a duration.
    pub fn grace_window(&self) -> Option<Duration> {
        i64::try_from(self.grace_window_secs)
            .ok()
            .and_then(Duration::try_seconds)
    }
}

impl Default for RefundConfig {
    fn default() -> Self {
        Self {
            grace_window_secs: 300,
            daily_quota: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayoutConfig {
    /// Fraud scores at or above this block the payout
    pub max_risk_score: f64,
    /// Requests up to this amount are approved as soon as their checks pass
    pub auto_approve_limit: Option<Amount>,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            max_risk_score: 0.7,
            auto_approve_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReserveConfig {
    /// Hot wallet floor; deficits are pulled from cold
    pub hot_min: Amount,
    /// Hot wallet ceiling; excess is pushed to cold
    pub hot_max: Amount,
    pub interval_secs: u64,
}

impl Default for ReserveConfig {
    fn default() -> Self {
        Self {
            hot_min: Amount::new(10_000),
            hot_max: Amount::new(100_000),
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file; in-memory store when unset
    pub path: Option<PathBuf>,
    /// Attempts per atomic update before surfacing a transient error
    pub max_attempts: u32,
    /// Entries fetched per page when folding the ledger
    pub fold_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_attempts: 8,
            fold_batch_size: 512,
        }
    }
}

impl LedgerConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: LedgerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LEDGER_*` environment overrides on top of `self`
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("LEDGER_DB_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Ok(bps) = std::env::var("LEDGER_PLATFORM_RATE_BPS") {
            self.split.platform_rate_bps = parse_env("LEDGER_PLATFORM_RATE_BPS", &bps)?;
        }
        if let Ok(secs) = std::env::var("LEDGER_REFUND_GRACE_SECS") {
            self.refund.grace_window_secs = parse_env("LEDGER_REFUND_GRACE_SECS", &secs)?;
        }
        if let Ok(score) = std::env::var("LEDGER_MAX_RISK_SCORE") {
            self.payout.max_risk_score = parse_env("LEDGER_MAX_RISK_SCORE", &score)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.split.platform_rate_bps > SplitPolicy::MAX_BPS {
            return Err(ConfigError::Invalid(format!(
                "platform_rate_bps {} exceeds {}",
                self.split.platform_rate_bps,
                SplitPolicy::MAX_BPS
            )));
        }
        if self.reserve.hot_min.is_negative() || self.reserve.hot_min > self.reserve.hot_max {
            return Err(ConfigError::Invalid(format!(
                "reserve bounds [{}, {}] are not a valid range",
                self.reserve.hot_min, self.reserve.hot_max
            )));
        }
        if self.refund.grace_window().is_none() {
            return Err(ConfigError::Invalid(format!(
                "grace_window_secs {} is out of range",
                self.refund.grace_window_secs
            )));
        }
        if self.store.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.reserve.interval_secs == 0 || self.reconcile.interval_secs == 0 {
            return Err(ConfigError::Invalid("task intervals must be at least 1s".into()));
        }
        if self.store.fold_batch_size == 0 {
            return Err(ConfigError::Invalid("fold_batch_size must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.payout.max_risk_score) {
            return Err(ConfigError::Invalid(format!(
                "max_risk_score {} is outside [0, 1]",
                self.payout.max_risk_score
            )));
        }
        Ok(())
    }

    pub fn split_policy(&self) -> SplitPolicy {
        SplitPolicy::new(self.split.platform_rate_bps).unwrap_or_default()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name}={value} is not valid")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config() {
        let config = LedgerConfig::default();
        assert_eq!(config.split.platform_rate_bps, 3_500);
        assert_eq!(config.refund.grace_window_secs, 300);
        assert_eq!(config.store.max_attempts, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[refund]\ndaily_quota = 1\n\n[reserve]\nhot_min = 5\nhot_max = 50"
        )
        .unwrap();

        let config = LedgerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.refund.daily_quota, 1);
        assert_eq!(config.refund.grace_window_secs, 300);
        assert_eq!(config.reserve.hot_max, Amount::new(50));
        assert_eq!(config.split.platform_rate_bps, 3_500);
    }

    #[test]
    fn rejects_inverted_reserve_bounds() {
        let mut config = LedgerConfig::default();
        config.reserve.hot_min = Amount::new(10);
        config.reserve.hot_max = Amount::new(5);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_out_of_range_grace_window() {
        let mut config = LedgerConfig::default();
        for secs in [u64::MAX, 1 << 60] {
            config.refund.grace_window_secs = secs;
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
        config.refund.grace_window_secs = 90 * 24 * 3600;
        assert!(config.validate().is_ok());
        assert_eq!(config.refund.grace_window(), Some(Duration::days(90)));
    }

    #[test]
    fn rejects_rate_above_full() {
        let mut config = LedgerConfig::default();
        config.split.platform_rate_bps = 12_000;
        assert!(config.validate().is_err());
    }
}
