//! Env-var resolution helpers shared by the config resolvers.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Read an env var, treating empty/whitespace-only values as absent.
pub(crate) fn optional_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

/// Parse an env var into `T`, reporting the key on failure.
pub(crate) fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)
        .map(|raw| {
            raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("could not parse '{raw}': {e}"),
            })
        })
        .transpose()
}

/// Parse a millisecond env var into a `Duration`, rejecting zero.
pub(crate) fn parse_env_ms(key: &str) -> Result<Option<Duration>, ConfigError> {
    match parse_env::<u64>(key)? {
        Some(0) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be > 0".to_string(),
        }),
        Some(ms) => Ok(Some(Duration::from_millis(ms))),
        None => Ok(None),
    }
}

/// Parse a boolean env var ("true"/"false", case-insensitive).
pub(crate) fn parse_env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    optional_env(key)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'true' or 'false', got '{other}'"),
            }),
        })
        .transpose()
}
