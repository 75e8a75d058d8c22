//! Configuration management for Bucketgate.

use std::time::Duration;

use config::{Config, Environment};
use serde::{Deserialize, Serialize};

use crate::error::{BucketgateError, Result};
use crate::ratelimit::Algorithm;

/// Prefix for environment overrides, e.g. `BUCKETGATE__LIMITER__CAPACITY=10`.
pub const ENV_PREFIX: &str = "BUCKETGATE";

/// Main configuration for a Bucketgate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Algorithm and bucket shape
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// State store behaviour
    #[serde(default)]
    pub store: StoreConfig,

    /// What to answer when the store cannot
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Largest capacity or rate a limiter accepts. Amounts are stored in
/// billionths of a token, so this keeps every intermediate in `u64`.
pub const MAX_QUANTITY: f64 = 1e9;

/// Bucket shape, fixed for the lifetime of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Token bucket or leaky bucket
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Maximum burst size
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Tokens refilled (or units leaked) per second
    #[serde(default = "default_rate")]
    pub rate: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            capacity: default_capacity(),
            rate: default_rate(),
        }
    }
}

impl LimiterConfig {
    /// Reject shapes no limiter can run with.
    ///
    /// Zero capacity and zero rate are both legal: the first denies everything,
    /// the second never refills.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=MAX_QUANTITY).contains(&self.capacity) {
            return Err(BucketgateError::InvalidConfig(format!(
                "capacity must be between 0 and {}, got {}",
                MAX_QUANTITY, self.capacity
            )));
        }
        if !(0.0..=MAX_QUANTITY).contains(&self.rate) {
            return Err(BucketgateError::InvalidConfig(format!(
                "rate must be between 0 and {}, got {}",
                MAX_QUANTITY, self.rate
            )));
        }
        Ok(())
    }
}

fn default_capacity() -> f64 {
    5.0
}

fn default_rate() -> f64 {
    1.0
}

/// Which store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Sharded in-process map
    #[default]
    Memory,
    /// Remote-store code path over an in-process key-value client
    Loopback,
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation to use
    #[serde(default)]
    pub backend: StoreBackend,

    /// Per-call timeout for remote stores, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Compare-and-set attempts per decision before giving up
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,

    /// Minimum idle time before an at-rest key may be evicted, in seconds
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// How often the background sweeper runs, in seconds (0 disables it)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            timeout_ms: default_timeout_ms(),
            max_cas_attempts: default_max_cas_attempts(),
            idle_ttl_secs: default_idle_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(BucketgateError::InvalidConfig(
                "store timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_cas_attempts == 0 {
            return Err(BucketgateError::InvalidConfig(
                "max_cas_attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_max_cas_attempts() -> u32 {
    64
}

fn default_idle_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

/// Decision made when the store is unavailable or hopelessly contended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Deny, so an outage never silently removes the limit
    #[default]
    FailClosed,
    /// Allow, preferring availability over enforcement
    FailOpen,
}

impl GateConfig {
    /// Defaults overridden by `BUCKETGATE__*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
    }

    fn from_source(env: Environment) -> Result<Self> {
        let settings = Config::builder()
            .add_source(env.try_parsing(true))
            .build()?;

        let config: GateConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        self.store.validate()
    }
}
