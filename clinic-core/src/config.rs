//! Configuration types
//!
//! Both configs load from `CLINIC_*` environment variables with defaults
//! suitable for a single browser-session-sized process.

use crate::{ClinicResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Default entry TTL (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default memory-tier entry cap.
pub const DEFAULT_MAX_MEMORY_ENTRIES: usize = 1000;

/// Default persistent mirror budget (5 MiB).
pub const DEFAULT_PERSISTENT_BUDGET_BYTES: usize = 5 * 1024 * 1024;

/// Default expiry sweep interval (10 minutes).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default namespace for mirror keys.
pub const DEFAULT_MIRROR_PREFIX: &str = "clinic-cache:";

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

/// Configuration for the two-tier cache store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without one.
    pub default_ttl: Duration,
    /// Memory-tier entry cap enforced by LRU eviction.
    pub max_memory_entries: usize,
    /// Byte budget of the persistent mirror.
    pub persistent_budget_bytes: usize,
    /// Interval of the background expiry sweep.
    pub sweep_interval: Duration,
    /// Prefix placed before every key written to the mirror.
    pub mirror_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            max_memory_entries: DEFAULT_MAX_MEMORY_ENTRIES,
            persistent_budget_bytes: DEFAULT_PERSISTENT_BUDGET_BYTES,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            mirror_prefix: DEFAULT_MIRROR_PREFIX.to_string(),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create CacheConfig from environment variables.
    ///
    /// Environment variables:
    /// - `CLINIC_CACHE_DEFAULT_TTL_SECS` (default: 300)
    /// - `CLINIC_CACHE_MAX_ENTRIES` (default: 1000)
    /// - `CLINIC_CACHE_BUDGET_BYTES` (default: 5242880)
    /// - `CLINIC_CACHE_SWEEP_INTERVAL_SECS` (default: 600)
    /// - `CLINIC_CACHE_PREFIX` (default: "clinic-cache:")
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_ttl: env_parse("CLINIC_CACHE_DEFAULT_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            max_memory_entries: env_parse("CLINIC_CACHE_MAX_ENTRIES")
                .unwrap_or(defaults.max_memory_entries),
            persistent_budget_bytes: env_parse("CLINIC_CACHE_BUDGET_BYTES")
                .unwrap_or(defaults.persistent_budget_bytes),
            sweep_interval: env_parse("CLINIC_CACHE_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            mirror_prefix: std::env::var("CLINIC_CACHE_PREFIX")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.mirror_prefix),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_memory_entries = max;
        self
    }

    pub fn with_budget_bytes(mut self, bytes: usize) -> Self {
        self.persistent_budget_bytes = bytes;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.mirror_prefix = prefix.into();
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - all durations are non-zero
    /// - entry cap and byte budget are positive
    /// - mirror prefix is not empty
    pub fn validate(&self) -> ClinicResult<()> {
        if self.default_ttl.is_zero() {
            return Err(invalid("default_ttl", "0s", "must be positive").into());
        }
        if self.max_memory_entries == 0 {
            return Err(invalid("max_memory_entries", 0, "must be positive").into());
        }
        if self.persistent_budget_bytes == 0 {
            return Err(invalid("persistent_budget_bytes", 0, "must be positive").into());
        }
        if self.sweep_interval.is_zero() {
            return Err(invalid("sweep_interval", "0s", "must be positive").into());
        }
        if self.mirror_prefix.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "mirror_prefix".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// PIPELINE CONFIGURATION
// ============================================================================

/// Configuration for the repository middleware pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// TTL of results written back by the read cache.
    pub read_cache_ttl: Duration,
    /// Upper bound for any best-effort side effect.
    pub side_effect_timeout: Duration,
    /// Whether the default rate limiter enforces quotas.
    pub rate_limit_enabled: bool,
    /// Requests per minute per user.
    pub rate_limit_per_minute: u32,
    /// Burst capacity above the steady rate.
    pub rate_limit_burst: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            read_cache_ttl: Duration::from_secs(5 * 60),
            side_effect_timeout: Duration::from_secs(2),
            rate_limit_enabled: true,
            rate_limit_per_minute: 120,
            rate_limit_burst: 20,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create PipelineConfig from environment variables.
    ///
    /// Environment variables:
    /// - `CLINIC_READ_CACHE_TTL_SECS` (default: 300)
    /// - `CLINIC_SIDE_EFFECT_TIMEOUT_MS` (default: 2000)
    /// - `CLINIC_RATE_LIMIT_ENABLED`: "true" or "false" (default: true)
    /// - `CLINIC_RATE_LIMIT_PER_MINUTE` (default: 120)
    /// - `CLINIC_RATE_LIMIT_BURST` (default: 20)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            read_cache_ttl: env_parse("CLINIC_READ_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.read_cache_ttl),
            side_effect_timeout: env_parse("CLINIC_SIDE_EFFECT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.side_effect_timeout),
            rate_limit_enabled: std::env::var("CLINIC_RATE_LIMIT_ENABLED")
                .ok()
                .map(|s| s.to_lowercase() != "false")
                .unwrap_or(defaults.rate_limit_enabled),
            rate_limit_per_minute: env_parse("CLINIC_RATE_LIMIT_PER_MINUTE")
                .unwrap_or(defaults.rate_limit_per_minute),
            rate_limit_burst: env_parse("CLINIC_RATE_LIMIT_BURST")
                .unwrap_or(defaults.rate_limit_burst),
        }
    }

    pub fn with_read_cache_ttl(mut self, ttl: Duration) -> Self {
        self.read_cache_ttl = ttl;
        self
    }

    pub fn with_side_effect_timeout(mut self, timeout: Duration) -> Self {
        self.side_effect_timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32, burst: u32) -> Self {
        self.rate_limit_per_minute = per_minute;
        self.rate_limit_burst = burst;
        self
    }

    pub fn validate(&self) -> ClinicResult<()> {
        if self.read_cache_ttl.is_zero() {
            return Err(invalid("read_cache_ttl", "0s", "must be positive").into());
        }
        if self.side_effect_timeout.is_zero() {
            return Err(invalid("side_effect_timeout", "0ms", "must be positive").into());
        }
        if self.rate_limit_enabled && self.rate_limit_per_minute == 0 {
            return Err(invalid(
                "rate_limit_per_minute",
                0,
                "must be positive while rate limiting is enabled",
            )
            .into());
        }
        Ok(())
    }
}
