// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the LLM Backplane.
//!
//! This crate provides [`RuntimeConfig`] — the top-level runtime settings —
//! together with helpers for loading from TOML files, applying `LBP_*`
//! environment overrides, merging overlays, and producing advisory
//! [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },

    /// An environment variable override could not be parsed.
    #[error("invalid environment override: {0}")]
    EnvOverride(#[from] lbp_config_env::ParseEnvError),
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A reconciler or breaker interval is unusually large.
    LargeInterval {
        /// Field name.
        field: String,
        /// Value in seconds.
        secs: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeInterval { field, secs } => {
                write!(f, "'{field}' is unusually large ({secs}s)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the LLM Backplane.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RuntimeConfig {
    /// Postgres connection string for the relational store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Address the pub/sub bus binds or connects to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_addr: Option<String>,

    /// Address of the external tokenizer service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_addr: Option<String>,

    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Telegram bot API token, when a Telegram bot poller is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_bot_token: Option<String>,

    /// Reconciler tick interval, in seconds.
    pub reconcile_interval_secs: u64,

    /// Bot poller tick interval, in seconds. Added after the rest of this
    /// struct, so it defaults rather than being required — older config
    /// files that predate the bot poller still parse.
    #[serde(default = "default_bot_poll_interval_secs")]
    pub bot_poll_interval_secs: u64,

    /// KV cache refresh interval, in seconds.
    pub cache_refresh_interval_secs: u64,

    /// Consecutive failures before the circuit breaker opens.
    pub breaker_failure_threshold: u32,

    /// How long the circuit breaker stays open before probing again, in
    /// seconds.
    pub breaker_open_secs: u64,
}

fn default_bot_poll_interval_secs() -> u64 {
    20
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            bus_addr: None,
            tokenizer_addr: None,
            log_level: Some("info".into()),
            telegram_bot_token: None,
            reconcile_interval_secs: 30,
            bot_poll_interval_secs: 20,
            cache_refresh_interval_secs: 60,
            breaker_failure_threshold: 5,
            breaker_open_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Threshold above which an interval generates a warning, in seconds.
const LARGE_INTERVAL_THRESHOLD_SECS: u64 = 3_600;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`RuntimeConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`RuntimeConfig::default()`].
///
/// `LBP_*` environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => RuntimeConfig::default(),
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Parse a TOML string into a [`RuntimeConfig`].
pub fn parse_toml(content: &str) -> Result<RuntimeConfig, ConfigError> {
    toml::from_str::<RuntimeConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply `LBP_*` environment variable overrides, per
/// [`lbp_config_env::vars`].
pub fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<(), ConfigError> {
    use lbp_config_env::{read_string, read_u64, vars};

    if let Some(val) = read_string(vars::DATABASE_URL) {
        config.database_url = Some(val);
    }
    if let Some(val) = read_string(vars::BUS_ADDR) {
        config.bus_addr = Some(val);
    }
    if let Some(val) = read_string(vars::TOKENIZER_ADDR) {
        config.tokenizer_addr = Some(val);
    }
    if let Some(val) = read_string(vars::LOG_LEVEL) {
        config.log_level = Some(val);
    }
    if let Some(val) = read_string(vars::TELEGRAM_BOT_TOKEN) {
        config.telegram_bot_token = Some(val);
    }
    if let Some(val) = read_u64(vars::RECONCILE_INTERVAL_SECS)? {
        config.reconcile_interval_secs = val;
    }
    if let Some(val) = read_u64(vars::BOT_POLL_INTERVAL_SECS)? {
        config.bot_poll_interval_secs = val;
    }
    if let Some(val) = read_u64(vars::CACHE_REFRESH_INTERVAL_SECS)? {
        config.cache_refresh_interval_secs = val;
    }
    if let Some(val) = read_u64(vars::BREAKER_FAILURE_THRESHOLD)? {
        config.breaker_failure_threshold = val as u32;
    }
    if let Some(val) = read_u64(vars::BREAKER_OPEN_SECS)? {
        config.breaker_open_secs = val;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (invalid log level, zero-valued intervals) are returned as a
/// [`ConfigError::ValidationError`]; soft issues come back as warnings.
pub fn validate_config(config: &RuntimeConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level {
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            errors.push(format!("invalid log_level '{level}'"));
        }
    }

    if config.reconcile_interval_secs == 0 {
        errors.push("reconcile_interval_secs must be non-zero".into());
    } else if config.reconcile_interval_secs > LARGE_INTERVAL_THRESHOLD_SECS {
        warnings.push(ConfigWarning::LargeInterval {
            field: "reconcile_interval_secs".into(),
            secs: config.reconcile_interval_secs,
        });
    }

    if config.bot_poll_interval_secs == 0 {
        errors.push("bot_poll_interval_secs must be non-zero".into());
    } else if config.bot_poll_interval_secs > LARGE_INTERVAL_THRESHOLD_SECS {
        warnings.push(ConfigWarning::LargeInterval {
            field: "bot_poll_interval_secs".into(),
            secs: config.bot_poll_interval_secs,
        });
    }

    if config.cache_refresh_interval_secs == 0 {
        errors.push("cache_refresh_interval_secs must be non-zero".into());
    } else if config.cache_refresh_interval_secs > LARGE_INTERVAL_THRESHOLD_SECS {
        warnings.push(ConfigWarning::LargeInterval {
            field: "cache_refresh_interval_secs".into(),
            secs: config.cache_refresh_interval_secs,
        });
    }

    if config.breaker_failure_threshold == 0 {
        errors.push("breaker_failure_threshold must be non-zero".into());
    }

    if config.breaker_open_secs == 0 {
        errors.push("breaker_open_secs must be non-zero".into());
    } else if config.breaker_open_secs > LARGE_INTERVAL_THRESHOLD_SECS {
        warnings.push(ConfigWarning::LargeInterval {
            field: "breaker_open_secs".into(),
            secs: config.breaker_open_secs,
        });
    }

    if config.database_url.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "database_url".into(),
            hint: "the relational store will refuse to connect".into(),
        });
    }
    if config.bus_addr.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "bus_addr".into(),
            hint: "the pub/sub bus will run in-process only".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Values in `overlay` take precedence over `base`.
pub fn merge_configs(base: RuntimeConfig, overlay: RuntimeConfig) -> RuntimeConfig {
    let defaults = RuntimeConfig::default();
    RuntimeConfig {
        database_url: overlay.database_url.or(base.database_url),
        bus_addr: overlay.bus_addr.or(base.bus_addr),
        tokenizer_addr: overlay.tokenizer_addr.or(base.tokenizer_addr),
        log_level: overlay.log_level.or(base.log_level),
        telegram_bot_token: overlay.telegram_bot_token.or(base.telegram_bot_token),
        reconcile_interval_secs: pick_non_default(
            overlay.reconcile_interval_secs,
            base.reconcile_interval_secs,
            defaults.reconcile_interval_secs,
        ),
        bot_poll_interval_secs: pick_non_default(
            overlay.bot_poll_interval_secs,
            base.bot_poll_interval_secs,
            defaults.bot_poll_interval_secs,
        ),
        cache_refresh_interval_secs: pick_non_default(
            overlay.cache_refresh_interval_secs,
            base.cache_refresh_interval_secs,
            defaults.cache_refresh_interval_secs,
        ),
        breaker_failure_threshold: pick_non_default(
            overlay.breaker_failure_threshold,
            base.breaker_failure_threshold,
            defaults.breaker_failure_threshold,
        ),
        breaker_open_secs: pick_non_default(
            overlay.breaker_open_secs,
            base.breaker_open_secs,
            defaults.breaker_open_secs,
        ),
    }
}

/// Prefer `overlay` unless it is still at its default value, in which case
/// fall back to `base`. Used for fields with no natural "unset" state.
fn pick_non_default<T: PartialEq>(overlay: T, base: T, default: T) -> T {
    if overlay == default { base } else { overlay }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
