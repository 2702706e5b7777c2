//! Iris configuration
//!
//! Loaded from TOML or YAML (chosen by file extension). Every field has a
//! default, so an empty file is a valid configuration.

use crate::error::ConfigError;
use crate::types::{Mode, Priority};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrisConfig {
    /// Worker pool and queue
    pub sender: SenderConfig,
    /// Retry and fallback policy
    pub retry: RetryConfig,
    /// Duplicate suppression
    pub quench: QuenchConfig,
    /// Per (target, mode) throughput limits
    pub rate_limit: RateLimitConfig,
    /// Target resolution
    pub resolver: ResolverConfig,
    /// Plugin per mode
    pub plugins: BTreeMap<Mode, PluginConfig>,
}

impl IrisConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse TOML
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed input
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse YAML
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed input
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a `.toml`, `.yaml` or `.yml` file and validate it
    ///
    /// # Errors
    /// - `ConfigError::Io` if the file cannot be read
    /// - `ConfigError::UnsupportedFormat` for other extensions
    /// - `ConfigError::Parse` / `ConfigError::Invalid` for bad content
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&source)?,
            Some("yaml" | "yml") => Self::from_yaml_str(&source)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                ))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// With worker count
    #[inline]
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.sender.workers = workers;
        self
    }

    /// With quench window
    #[inline]
    #[must_use]
    pub fn with_quench_window(mut self, window: Duration) -> Self {
        self.quench.window_secs = window.as_secs();
        self
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.sender.workers == 0 {
            return invalid("sender.workers must be at least 1");
        }
        if self.sender.queue_capacity == 0 {
            return invalid("sender.queue_capacity must be at least 1");
        }
        if self.sender.send_timeout_ms == 0 {
            return invalid("sender.send_timeout_ms must be positive");
        }
        if self.retry.max_transient_attempts == 0 || self.retry.max_unknown_attempts == 0 {
            return invalid("retry attempt limits must be at least 1");
        }
        if self.retry.max_unknown_attempts > self.retry.max_transient_attempts {
            return invalid("retry.max_unknown_attempts must not exceed max_transient_attempts");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms must not exceed max_delay_ms");
        }
        if self.retry.max_fallback_depth == 0 {
            return invalid("retry.max_fallback_depth must be at least 1");
        }
        if self.rate_limit.capacity == 0 || self.rate_limit.refill_interval_secs == 0 {
            return invalid("rate_limit capacity and refill interval must be positive");
        }
        for (mode, plugin) in &self.plugins {
            if let PluginConfig::Webhook { url, .. } = plugin {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::Invalid(format!(
                        "plugins.{mode}.url must be an http(s) URL"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Worker pool and queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Concurrent sender workers
    pub workers: usize,
    /// Maximum queued messages (ready plus delayed)
    pub queue_capacity: usize,
    /// Bound on a single plugin call, in milliseconds
    pub send_timeout_ms: u64,
}

impl SenderConfig {
    /// Plugin call bound
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 10_000,
            send_timeout_ms: 10_000,
        }
    }
}

/// Retry and fallback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff base, in milliseconds
    pub base_delay_ms: u64,
    /// Backoff cap, in milliseconds
    pub max_delay_ms: u64,
    /// Attempts per channel for transient failures
    pub max_transient_attempts: u32,
    /// Attempts per channel when outcomes are unknown
    pub max_unknown_attempts: u32,
    /// Maximum contacts in a fallback chain
    pub max_fallback_depth: usize,
}

impl RetryConfig {
    /// Backoff base
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Backoff cap
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_transient_attempts: 3,
            max_unknown_attempts: 1,
            max_fallback_depth: 4,
        }
    }
}

/// Duplicate suppression settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuenchConfig {
    /// Suppression window, in seconds
    pub window_secs: u64,
    /// Background sweep interval, in seconds (0 disables the sweeper)
    pub sweep_interval_secs: u64,
}

impl QuenchConfig {
    /// Suppression window
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Sweep interval, if enabled
    #[must_use]
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl Default for QuenchConfig {
    fn default() -> Self {
        Self {
            window_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

/// Token bucket settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens per bucket
    pub capacity: u32,
    /// Refill period, in seconds
    pub refill_interval_secs: u64,
}

impl RateLimitConfig {
    /// Refill period
    #[must_use]
    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(self.refill_interval_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_interval_secs: 60,
        }
    }
}

/// Target resolution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Mode appended to every chain when the user has it
    pub fallback_mode: Option<Mode>,
    /// Mode order per priority when a user has no preference
    pub default_modes: BTreeMap<Priority, Vec<Mode>>,
    /// Directory cache entry lifetime, in seconds (0 disables caching)
    pub cache_ttl_secs: u64,
    /// Directory cache capacity
    pub cache_capacity: u64,
}

impl ResolverConfig {
    /// Cache lifetime, if enabled
    #[must_use]
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }

    /// Default mode order for a priority
    #[must_use]
    pub fn default_modes_for(&self, priority: Priority) -> &[Mode] {
        self.default_modes
            .get(&priority)
            .map_or(&[], Vec::as_slice)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let mut default_modes = BTreeMap::new();
        default_modes.insert(Priority::Low, vec![Mode::email()]);
        default_modes.insert(Priority::Medium, vec![Mode::email(), Mode::im()]);
        default_modes.insert(Priority::High, vec![Mode::im(), Mode::sms(), Mode::email()]);
        default_modes.insert(
            Priority::Urgent,
            vec![Mode::call(), Mode::sms(), Mode::email()],
        );
        Self {
            fallback_mode: Some(Mode::email()),
            default_modes,
            cache_ttl_secs: 60,
            cache_capacity: 10_000,
        }
    }
}

/// Plugin backing one mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PluginConfig {
    /// Log the message and report success
    Log,
    /// POST the message as JSON to a webhook
    Webhook {
        /// Endpoint
        url: String,
        /// Optional bearer token
        #[serde(default)]
        token: Option<String>,
    },
}
