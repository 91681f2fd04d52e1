//! TOML configuration.
//!
//! Every field has a default, so an empty file (or no file) is a valid config:
//!
//! ```toml
//! cache_dir = "data"
//!
//! [binance]
//! base_url = "https://api.binance.com"
//! rate_limit_ms = 1200
//! batch_limit = 1000
//!
//! [yahoo]
//! base_url = "https://query2.finance.yahoo.com"
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 500
//! max_delay_ms = 30000
//! jitter = 0.1
//!
//! [cache]
//! max_age_hours = 24   # omit to serve cache entries regardless of age
//! ```

use crate::data::fetcher::FreshnessPolicy;
use crate::data::retry::RetryPolicy;
use crate::data::{binance, yahoo};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantfetchConfig {
    pub cache_dir: PathBuf,
    pub binance: BinanceConfig,
    pub yahoo: YahooConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
}

impl Default for QuantfetchConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data"),
            binance: BinanceConfig::default(),
            yahoo: YahooConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinanceConfig {
    pub base_url: String,
    /// Pause between consecutive kline requests.
    pub rate_limit_ms: u64,
    /// Candles per request.
    pub batch_limit: u32,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            base_url: binance::DEFAULT_BASE_URL.to_string(),
            rate_limit_ms: binance::DEFAULT_RATE_LIMIT.as_millis() as u64,
            batch_limit: binance::MAX_LIMIT,
        }
    }
}

impl BinanceConfig {
    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YahooConfig {
    pub base_url: String,
}

impl Default for YahooConfig {
    fn default() -> Self {
        Self {
            base_url: yahoo::DEFAULT_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_hours: Option<u64>,
}

impl CacheConfig {
    pub fn freshness(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            max_age: self.max_age_hours.map(hours_to_duration),
        }
    }
}

/// Hours as a duration, saturating at `u64::MAX` seconds.
pub fn hours_to_duration(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}

impl QuantfetchConfig {
    /// Load a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.binance.batch_limit == 0 || self.binance.batch_limit > binance::MAX_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "binance.batch_limit must be between 1 and {}, got {}",
                binance::MAX_LIMIT,
                self.binance.batch_limit
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Serialize the config to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
