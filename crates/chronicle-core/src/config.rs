//! Core configuration.
//!
//! Safety-critical parameters are floor- or ceiling-enforced: a
//! configuration that weakens them below the built-in bounds fails
//! validation instead of being silently clamped at load time. (The
//! components that consume these values clamp again at use, as defense in
//! depth.)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::CheckpointConfig;
use crate::monitor::{MAX_POLL_INTERVAL, MonitorConfig};
use crate::query::QueryRateConfig;
use crate::recovery::{MIN_WAITING_PERIOD_FLOOR_MS, RecoveryConfig};
use crate::witness::{MIN_HIGH_STAKES_POOL_FLOOR, WitnessConfig};

/// Default reconciliation window for disagreeing halt channels.
pub const DEFAULT_RECONCILE_WINDOW_MS: u64 = 2_000;

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A safety floor or ceiling was violated.
    #[error("config bound violated: {field} = {value} (bound: {bound})")]
    BoundViolated {
        /// The offending field.
        field: &'static str,
        /// The configured value.
        value: u64,
        /// The enforced bound.
        bound: u64,
    },
}

/// On-disk configuration shape (TOML).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawConfig {
    monitor_poll_interval_ms: Option<u64>,
    witness_min_high_stakes_pool: Option<usize>,
    witness_pair_reuse_window_ms: Option<u64>,
    witness_attest_timeout_ms: Option<u64>,
    recovery_waiting_period_ms: Option<u64>,
    checkpoint_cadence_records: Option<u64>,
    halt_reconcile_window_ms: Option<u64>,
    query_max_requests: Option<u32>,
    query_window_ms: Option<u64>,
}

/// Assembled configuration for the ledger core.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Fork/sequence monitor settings.
    pub monitor: MonitorConfig,

    /// Witness coordinator settings.
    pub witness: WitnessConfig,

    /// Recovery coordinator settings.
    pub recovery: RecoveryConfig,

    /// Checkpoint cadence.
    pub checkpoint: CheckpointConfig,

    /// Query rate limiting.
    pub query: QueryRateConfig,

    /// Halt channel reconciliation window.
    pub halt: HaltConfig,
}

/// Halt transport settings.
#[derive(Debug, Clone)]
pub struct HaltConfig {
    /// How long a fast/durable disagreement may stand before
    /// reconciliation. The conservative (halted) interpretation wins for
    /// the whole window.
    pub reconcile_window_ms: u64,
}

impl Default for HaltConfig {
    fn default() -> Self {
        Self {
            reconcile_window_ms: DEFAULT_RECONCILE_WINDOW_MS,
        }
    }
}

impl CoreConfig {
    /// Loads configuration from a TOML file and validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// safety bound is violated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string and validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a safety bound is
    /// violated.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;
        let mut config = Self::default();

        if let Some(ms) = raw.monitor_poll_interval_ms {
            config.monitor.poll_interval = Duration::from_millis(ms);
        }
        if let Some(pool) = raw.witness_min_high_stakes_pool {
            config.witness.min_high_stakes_pool = pool;
        }
        if let Some(ms) = raw.witness_pair_reuse_window_ms {
            config.witness.pair_reuse_window_ms = ms;
        }
        if let Some(ms) = raw.witness_attest_timeout_ms {
            config.witness.attest_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.recovery_waiting_period_ms {
            config.recovery.waiting_period_ms = ms;
        }
        if let Some(records) = raw.checkpoint_cadence_records {
            config.checkpoint.cadence_records = records;
        }
        if let Some(ms) = raw.halt_reconcile_window_ms {
            config.halt.reconcile_window_ms = ms;
        }
        if let Some(max) = raw.query_max_requests {
            config.query.max_requests = max;
        }
        if let Some(ms) = raw.query_window_ms {
            config.query.window_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates safety floors and ceilings.
    ///
    /// # Errors
    ///
    /// Returns `BoundViolated` naming the first violated bound.
    #[allow(clippy::cast_possible_truncation)] // durations are far below u64::MAX ms
    pub fn validate(&self) -> Result<(), ConfigError> {
        let poll_ms = self.monitor.poll_interval.as_millis() as u64;
        let max_poll_ms = MAX_POLL_INTERVAL.as_millis() as u64;
        if poll_ms == 0 || poll_ms > max_poll_ms {
            return Err(ConfigError::BoundViolated {
                field: "monitor_poll_interval_ms",
                value: poll_ms,
                bound: max_poll_ms,
            });
        }

        if self.witness.min_high_stakes_pool < MIN_HIGH_STAKES_POOL_FLOOR {
            return Err(ConfigError::BoundViolated {
                field: "witness_min_high_stakes_pool",
                value: self.witness.min_high_stakes_pool as u64,
                bound: MIN_HIGH_STAKES_POOL_FLOOR as u64,
            });
        }

        if self.recovery.waiting_period_ms < MIN_WAITING_PERIOD_FLOOR_MS {
            return Err(ConfigError::BoundViolated {
                field: "recovery_waiting_period_ms",
                value: self.recovery.waiting_period_ms,
                bound: MIN_WAITING_PERIOD_FLOOR_MS,
            });
        }

        if self.checkpoint.cadence_records == 0 {
            return Err(ConfigError::BoundViolated {
                field: "checkpoint_cadence_records",
                value: 0,
                bound: 1,
            });
        }

        if self.halt.reconcile_window_ms == 0 {
            return Err(ConfigError::BoundViolated {
                field: "halt_reconcile_window_ms",
                value: 0,
                bound: 1,
            });
        }

        Ok(())
    }
}
