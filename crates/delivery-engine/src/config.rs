//! Configuration types for the delivery engine.
//!
//! Every section carries serde defaults, so a partial file (or none at all)
//! yields a usable configuration. [`DeliveryConfig::load`] layers an
//! optional file under `DELIVERY__` environment variables.

use crate::error::ConfigError;
use crate::flow_limit::FlowThresholds;
use crate::timeout::TransactionTimeouts;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix of environment variables overriding file configuration
pub const ENV_PREFIX: &str = "DELIVERY";

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-channel settings
    pub channel: ChannelConfig,

    /// Transaction timeouts and housekeeping
    pub transactions: TransactionsConfig,

    /// Defaults applied to queues
    pub queues: QueuesConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Channel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Unacknowledged messages a channel may hold (0 = unlimited)
    pub prefetch_count: u32,

    /// Unacknowledged bytes a channel may hold (0 = unlimited)
    pub prefetch_size: u64,

    /// Reject publishes whose user-id differs from the authenticated user
    pub message_authorization_required: bool,

    /// Close the connection when a mandatory transactional publish has no route
    pub close_when_no_route: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 0,
            prefetch_size: 0,
            message_authorization_required: false,
            close_when_no_route: true,
        }
    }
}

/// Transaction timeout configuration, in milliseconds (0 = disabled)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionsConfig {
    pub open_warn: u64,
    pub open_close: u64,
    pub idle_warn: u64,
    pub idle_close: u64,

    /// How often the housekeeping task checks open transactions
    pub housekeeping_interval_ms: u64,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            open_warn: 0,
            open_close: 0,
            idle_warn: 0,
            idle_close: 0,
            housekeeping_interval_ms: 1_000,
        }
    }
}

impl TransactionsConfig {
    pub fn timeouts(&self) -> TransactionTimeouts {
        TransactionTimeouts {
            open_warn: self.open_warn,
            open_close: self.open_close,
            idle_warn: self.idle_warn,
            idle_close: self.idle_close,
        }
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}

/// Queue defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    /// Deliveries before a message is dead-lettered (0 = disabled)
    pub maximum_delivery_count: u32,

    pub flow_stop_count: u64,
    pub flow_resume_count: u64,
    pub flow_stop_size: u64,
    pub flow_resume_size: u64,
}

impl QueuesConfig {
    pub fn flow_thresholds(&self) -> FlowThresholds {
        FlowThresholds {
            stop_count: self.flow_stop_count,
            resume_count: self.flow_resume_count,
            stop_size: self.flow_stop_size,
            resume_size: self.flow_resume_size,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl DeliveryConfig {
    /// Load from an optional file (format by extension) overlaid with
    /// `DELIVERY__SECTION__FIELD` environment variables, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let loaded: DeliveryConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.queues;
        check_resume("queues.flow_resume_count", q.flow_stop_count, q.flow_resume_count)?;
        check_resume("queues.flow_resume_size", q.flow_stop_size, q.flow_resume_size)?;

        let t = &self.transactions;
        check_warn("transactions.open_warn", t.open_warn, t.open_close)?;
        check_warn("transactions.idle_warn", t.idle_warn, t.idle_close)?;

        if t.housekeeping_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "transactions.housekeeping_interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid {
                field: "logging.level".to_string(),
                message: format!("unknown level '{}'", self.logging.level),
            });
        }

        Ok(())
    }
}

fn check_resume(field: &str, stop: u64, resume: u64) -> Result<(), ConfigError> {
    if resume > stop {
        return Err(ConfigError::Invalid {
            field: field.to_string(),
            message: format!("resume threshold {} exceeds stop threshold {}", resume, stop),
        });
    }
    Ok(())
}

fn check_warn(field: &str, warn: u64, close: u64) -> Result<(), ConfigError> {
    if warn != 0 && close != 0 && warn > close {
        return Err(ConfigError::Invalid {
            field: field.to_string(),
            message: format!("warning threshold {} exceeds close threshold {}", warn, close),
        });
    }
    Ok(())
}
