//! Environment-backed runtime tuning for the session engine.

use std::{env, error::Error, fmt};

const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;
const DEFAULT_TYPING_STOP_DELAY_MS: u64 = 1_000;
const DEFAULT_CONFIRM_DELAY_MS: u64 = 500;

/// Timer tuning used by the session runtime.
///
/// Store endpoint and credentials stay outside this engine; the transport
/// implementation carries its own opaque configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Fixed delay between reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Idle delay before the typing stop sentinel is broadcast.
    pub typing_stop_delay_ms: u64,
    /// Delay between the `Sent` and `Confirmed` status beats.
    pub confirm_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            typing_stop_delay_ms: DEFAULT_TYPING_STOP_DELAY_MS,
            confirm_delay_ms: DEFAULT_CONFIRM_DELAY_MS,
        }
    }
}

impl EngineConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let reconnect_interval_ms = parse_optional_u64(
            "OTPCHAT_RECONNECT_INTERVAL_MS",
            DEFAULT_RECONNECT_INTERVAL_MS,
            &mut lookup,
        )?;
        let typing_stop_delay_ms = parse_optional_u64(
            "OTPCHAT_TYPING_STOP_DELAY_MS",
            DEFAULT_TYPING_STOP_DELAY_MS,
            &mut lookup,
        )?;
        let confirm_delay_ms =
            parse_optional_u64("OTPCHAT_CONFIRM_DELAY_MS", DEFAULT_CONFIRM_DELAY_MS, &mut lookup)?;

        for (key, value) in [
            ("OTPCHAT_RECONNECT_INTERVAL_MS", reconnect_interval_ms),
            ("OTPCHAT_TYPING_STOP_DELAY_MS", typing_stop_delay_ms),
            ("OTPCHAT_CONFIRM_DELAY_MS", confirm_delay_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".to_owned(),
                    reason: "must be at least 1".to_owned(),
                });
            }
        }

        Ok(Self {
            reconnect_interval_ms,
            typing_stop_delay_ms,
            confirm_delay_ms,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn parse_optional_u64<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        EngineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn applies_defaults_when_unset() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.reconnect_interval_ms, 5_000);
        assert_eq!(cfg.typing_stop_delay_ms, 1_000);
        assert_eq!(cfg.confirm_delay_ms, 500);
    }

    #[test]
    fn parses_overrides() {
        let cfg = config_from_pairs(&[
            ("OTPCHAT_RECONNECT_INTERVAL_MS", "250"),
            ("OTPCHAT_TYPING_STOP_DELAY_MS", "80"),
            ("OTPCHAT_CONFIRM_DELAY_MS", "10"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.reconnect_interval_ms, 250);
        assert_eq!(cfg.typing_stop_delay_ms, 80);
        assert_eq!(cfg.confirm_delay_ms, 10);
    }

    #[test]
    fn rejects_invalid_and_zero_values() {
        let err = config_from_pairs(&[("OTPCHAT_RECONNECT_INTERVAL_MS", "abc")])
            .expect_err("non-numeric should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "OTPCHAT_RECONNECT_INTERVAL_MS",
                ..
            }
        ));

        let err = config_from_pairs(&[("OTPCHAT_TYPING_STOP_DELAY_MS", "0")])
            .expect_err("zero should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "OTPCHAT_TYPING_STOP_DELAY_MS",
                ..
            }
        ));
    }
}
