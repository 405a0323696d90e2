// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment variable parsing for LLM Backplane runtime configuration.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Recognised environment variable names.
///
/// All runtime settings that may be overridden via the environment use the
/// `LBP_` prefix, matching the config file's field names.
pub mod vars {
    /// Overrides `RuntimeConfig::database_url`.
    pub const DATABASE_URL: &str = "LBP_DATABASE_URL";
    /// Overrides `RuntimeConfig::bus_addr`.
    pub const BUS_ADDR: &str = "LBP_BUS_ADDR";
    /// Overrides `RuntimeConfig::tokenizer_addr`.
    pub const TOKENIZER_ADDR: &str = "LBP_TOKENIZER_ADDR";
    /// Overrides `RuntimeConfig::log_level`.
    pub const LOG_LEVEL: &str = "LBP_LOG_LEVEL";
    /// Overrides `RuntimeConfig::reconcile_interval_secs`.
    pub const RECONCILE_INTERVAL_SECS: &str = "LBP_RECONCILE_INTERVAL_SECS";
    /// Overrides `RuntimeConfig::cache_refresh_interval_secs`.
    pub const CACHE_REFRESH_INTERVAL_SECS: &str = "LBP_CACHE_REFRESH_INTERVAL_SECS";
    /// Overrides `RuntimeConfig::breaker_failure_threshold`.
    pub const BREAKER_FAILURE_THRESHOLD: &str = "LBP_BREAKER_FAILURE_THRESHOLD";
    /// Overrides `RuntimeConfig::breaker_open_secs`.
    pub const BREAKER_OPEN_SECS: &str = "LBP_BREAKER_OPEN_SECS";
    /// Overrides `RuntimeConfig::telegram_bot_token` when a Telegram bot is
    /// configured.
    pub const TELEGRAM_BOT_TOKEN: &str = "LBP_TELEGRAM_BOT_TOKEN";
    /// Overrides `RuntimeConfig::bot_poll_interval_secs`.
    pub const BOT_POLL_INTERVAL_SECS: &str = "LBP_BOT_POLL_INTERVAL_SECS";
}

/// Read a string variable, if set and non-empty.
#[must_use]
pub fn read_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Read and parse an integer-valued variable.
///
/// Returns `Ok(None)` when unset, `Err` when set but not parseable, so
/// callers can distinguish "use the default" from "the operator made a
/// typo".
pub fn read_u64(name: &str) -> Result<Option<u64>, ParseEnvError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ParseEnvError::new(name, &raw)),
        Err(_) => Ok(None),
    }
}

/// A value was present in the environment but could not be parsed to the
/// expected type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("environment variable '{name}' has invalid value '{value}'")]
pub struct ParseEnvError {
    name: String,
    value: String,
}

impl ParseEnvError {
    fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}
