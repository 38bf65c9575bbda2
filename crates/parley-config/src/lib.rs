#![deny(unsafe_code)]

//! Configuration loading and validation for Parley.
//!
//! Loads TOML configuration files and validates them against expected
//! schemas. Provides the [`AppConfig`] type as the central configuration
//! structure, plus [`ProviderKind`] — the closed set of upstream chat
//! providers the pipeline knows how to talk to.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Identifier for an upstream chat-completion provider.
///
/// A closed enum rather than a free-form string: adding a provider means
/// adding a variant here and registering an adapter for it, and every
/// dispatch site is checked at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Per-provider endpoint configuration.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Delivery queue tuning.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Rewrite coordinator tuning.
    #[serde(default)]
    pub rewrite: RewriteConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Endpoint configuration for all supported providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// OpenAI (and OpenAI-compatible) endpoint settings.
    #[serde(default)]
    pub openai: ProviderEndpointConfig,

    /// Anthropic endpoint settings.
    #[serde(default)]
    pub anthropic: ProviderEndpointConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai: ProviderEndpointConfig {
                base_url: None,
                default_model: default_openai_model(),
            },
            anthropic: ProviderEndpointConfig {
                base_url: None,
                default_model: default_anthropic_model(),
            },
        }
    }
}

/// Settings for a single provider endpoint.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProviderEndpointConfig {
    /// Override the provider's API base URL (e.g. an OpenAI-compatible
    /// local endpoint). `None` uses the provider's public endpoint.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Model used when a request does not name one.
    #[serde(default)]
    pub default_model: String,
}

impl ProvidersConfig {
    /// Endpoint settings for the given provider.
    pub fn endpoint(&self, kind: ProviderKind) -> &ProviderEndpointConfig {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
        }
    }
}

fn default_openai_model() -> String {
    "gpt-4o".to_string()
}

fn default_anthropic_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

/// Delivery queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// First retry delay in milliseconds; doubles on each subsequent retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single retry delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Retries per entry before it is dropped to the dead-letter list.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Maximum queued entries; the oldest entry is evicted when full.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Periodic drain interval in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            capacity: default_queue_capacity(),
            tick_secs: default_tick_secs(),
        }
    }
}

impl QueueConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_queue_capacity() -> usize {
    256
}

fn default_tick_secs() -> u64 {
    15
}

/// Rewrite coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteConfig {
    /// Seconds without a terminal outcome before a slow-generation warning
    /// is emitted. The generation itself is not cancelled.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
        }
    }
}

impl RewriteConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

fn default_deadline_secs() -> u64 {
    30
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter directive (e.g. "info", "parley_core=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "pretty" or "compact".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::Validation(
                "queue.capacity must be at least 1".to_string(),
            ));
        }
        if self.queue.base_delay_ms == 0 {
            return Err(ConfigError::Validation(
                "queue.base_delay_ms must be non-zero".to_string(),
            ));
        }
        if self.queue.max_delay_ms < self.queue.base_delay_ms {
            return Err(ConfigError::Validation(format!(
                "queue.max_delay_ms ({}) must be >= queue.base_delay_ms ({})",
                self.queue.max_delay_ms, self.queue.base_delay_ms
            )));
        }
        if self.rewrite.deadline_secs == 0 {
            return Err(ConfigError::Validation(
                "rewrite.deadline_secs must be non-zero".to_string(),
            ));
        }
        match self.logging.format.as_str() {
            "pretty" | "compact" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "logging.format must be \"pretty\" or \"compact\", got \"{other}\""
                )));
            }
        }
        Ok(())
    }
}
