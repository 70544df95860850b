//! Session manager tunables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default freshness window in seconds.
pub const DEFAULT_EXPIRY_WINDOW_SECS: i64 = 300;

/// Default grace period before a full reset, in milliseconds.
pub const DEFAULT_RESET_GRACE_MS: u64 = 2_000;

/// Default namespace prefix for durable protocol engine state.
pub const DEFAULT_ENGINE_NAMESPACE_PREFIX: &str = "courier:";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Tunables for the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// A credential whose expiry is this many seconds away (or fewer) is
    /// treated as expiring and replaced.
    pub expiry_window_secs: i64,

    /// Fixed wait before `reset` starts tearing sessions down.
    pub reset_grace_ms: u64,

    /// Prefix for the per-identity protocol engine storage namespace.
    pub engine_namespace_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_window_secs: DEFAULT_EXPIRY_WINDOW_SECS,
            reset_grace_ms: DEFAULT_RESET_GRACE_MS,
            engine_namespace_prefix: DEFAULT_ENGINE_NAMESPACE_PREFIX.to_string(),
        }
    }
}

impl SessionConfig {
    /// Parse a config from JSON, filling unspecified fields with defaults.
    ///
    /// # Errors
    /// Returns error if the JSON is malformed or a value is out of range.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns error if the expiry window is negative.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expiry_window_secs < 0 {
            return Err(ConfigError::Invalid {
                field: "expiry_window_secs",
                reason: format!("must not be negative, got {}", self.expiry_window_secs),
            });
        }
        Ok(())
    }

    /// Grace period as a `Duration`.
    #[must_use]
    pub const fn reset_grace(&self) -> Duration {
        Duration::from_millis(self.reset_grace_ms)
    }

    /// Durable engine namespace for an identity.
    #[must_use]
    pub fn engine_namespace(&self, identity: &str) -> String {
        format!("{}{identity}", self.engine_namespace_prefix)
    }
}
