//! Daemon configuration.
//!
//! One TOML file with a section per component. Every section and field is
//! optional; omitted values take the defaults below. Durations are whole
//! seconds.
//!
//! ```toml
//! [registry]
//! heartbeat_interval_secs = 30
//!
//! [scheduler]
//! admission_timeout_secs = 300
//!
//! [workers]
//! tick_interval_secs = 1
//!
//! [logging]
//! filter = "hive=debug"
//! json = true
//! ```

use std::path::Path;
use std::time::Duration;

use hive_market::MarketConfig;
use hive_proto::RateSheet;
use hive_registry::RegistryConfig;
use hive_scheduler::{RetryPolicy, SchedulerConfig};
use hive_store::DEFAULT_UPDATE_ATTEMPTS;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Agent liveness settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Expected heartbeat period.
    pub heartbeat_interval_secs: u64,
    /// Silence before eviction. Defaults to three heartbeat intervals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_secs: Option<u64>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: None,
        }
    }
}

impl RegistrySection {
    /// Registry settings with the given update attempts.
    #[must_use]
    pub fn to_config(&self, update_attempts: u32) -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: self.heartbeat_timeout_secs.map(Duration::from_secs),
            update_attempts,
        }
    }
}

/// Direct scheduling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// How long a job may wait for capacity before failing.
    pub admission_timeout_secs: u64,
    /// Runtime limit for submissions that omit one.
    pub default_timeout_secs: u64,
    /// Retry budget for submissions that omit one.
    pub default_max_retries: u32,
    /// Largest retry budget a submission may request.
    pub max_retries_cap: u32,
    /// Rates used to size direct-submission escrow.
    pub escrow_rates: RateSheet,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            admission_timeout_secs: defaults.admission_timeout.as_secs(),
            default_timeout_secs: defaults.default_timeout_secs,
            default_max_retries: defaults.default_max_retries,
            max_retries_cap: defaults.max_retries_cap,
            escrow_rates: defaults.escrow_rates,
        }
    }
}

impl SchedulerSection {
    /// Scheduler settings.
    #[must_use]
    pub fn to_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            admission_timeout: Duration::from_secs(self.admission_timeout_secs),
            default_timeout_secs: self.default_timeout_secs,
            default_max_retries: self.default_max_retries,
            max_retries_cap: self.max_retries_cap,
            escrow_rates: self.escrow_rates,
        }
    }
}

/// Backoff and lost-agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Delay before the first retry.
    pub base_backoff_secs: u64,
    /// Cap on any single delay.
    pub max_backoff_secs: u64,
    /// Lost-agent requeues before a job fails.
    pub max_infra_retries: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            base_backoff_secs: defaults.base_backoff.as_secs(),
            max_backoff_secs: defaults.max_backoff.as_secs(),
            max_infra_retries: defaults.max_infra_retries,
        }
    }
}

impl RetrySection {
    /// Retry policy.
    #[must_use]
    pub const fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_backoff: Duration::from_secs(self.base_backoff_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            max_infra_retries: self.max_infra_retries,
        }
    }
}

/// Marketplace timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketSection {
    /// Offer lifetime when none is requested.
    pub offer_ttl_secs: u64,
    /// Bid lifetime when none is requested.
    pub bid_ttl_secs: u64,
    /// Deadline for confirming a match.
    pub confirmation_timeout_secs: u64,
}

impl Default for MarketSection {
    fn default() -> Self {
        let defaults = MarketConfig::default();
        Self {
            offer_ttl_secs: defaults.offer_ttl.as_secs(),
            bid_ttl_secs: defaults.bid_ttl.as_secs(),
            confirmation_timeout_secs: defaults.confirmation_timeout.as_secs(),
        }
    }
}

impl MarketSection {
    /// Market settings with the given update attempts.
    #[must_use]
    pub const fn to_config(&self, update_attempts: u32) -> MarketConfig {
        MarketConfig {
            offer_ttl: Duration::from_secs(self.offer_ttl_secs),
            bid_ttl: Duration::from_secs(self.bid_ttl_secs),
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout_secs),
            update_attempts,
        }
    }
}

/// Periods of the background workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    /// Scheduling tick.
    pub tick_interval_secs: u64,
    /// Matching pass and confirmation expiry.
    pub matching_interval_secs: u64,
    /// Stale-agent eviction.
    pub eviction_interval_secs: u64,
    /// Runtime-limit sweep.
    pub timeout_sweep_interval_secs: u64,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: 1,
            matching_interval_secs: 5,
            eviction_interval_secs: 10,
            timeout_sweep_interval_secs: 5,
        }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    /// Broadcast buffer per subscriber.
    pub capacity: usize,
    /// Events kept for replay.
    pub history_limit: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            capacity: 1024,
            history_limit: 4096,
        }
    }
}

/// Record store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Optimistic-update attempts before an operation reports a conflict.
    pub update_attempts: u32,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            update_attempts: DEFAULT_UPDATE_ATTEMPTS,
        }
    }
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directives. `RUST_LOG` takes precedence when set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "hive=info".to_string(),
            json: false,
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    /// Agent liveness.
    pub registry: RegistrySection,
    /// Direct scheduling.
    pub scheduler: SchedulerSection,
    /// Retries and backoff.
    pub retry: RetrySection,
    /// Marketplace timing.
    pub market: MarketSection,
    /// Background worker periods.
    pub workers: WorkersSection,
    /// Event bus sizing.
    pub events: EventsSection,
    /// Record stores.
    pub store: StoreSection,
    /// Log output.
    pub logging: LoggingSection,
}

fn positive(value: u64, field: &str) -> Result<(), NodeError> {
    if value == 0 {
        return Err(NodeError::Config(format!("{field} must be greater than 0")));
    }
    Ok(())
}

impl HiveConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, NodeError> {
        let config: Self =
            toml::from_str(content).map_err(|e| NodeError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, NodeError> {
        toml::to_string_pretty(self)
            .map_err(|e| NodeError::Config(format!("failed to serialize config: {e}")))
    }

    /// Write as TOML to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), NodeError> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid value.
    pub fn validate(&self) -> Result<(), NodeError> {
        positive(self.registry.heartbeat_interval_secs, "registry.heartbeat_interval_secs")?;
        if let Some(timeout) = self.registry.heartbeat_timeout_secs {
            if timeout < self.registry.heartbeat_interval_secs {
                return Err(NodeError::Config(
                    "registry.heartbeat_timeout_secs cannot be shorter than the heartbeat interval"
                        .to_string(),
                ));
            }
        }

        positive(self.scheduler.admission_timeout_secs, "scheduler.admission_timeout_secs")?;
        positive(self.scheduler.default_timeout_secs, "scheduler.default_timeout_secs")?;
        if self.scheduler.default_max_retries > self.scheduler.max_retries_cap {
            return Err(NodeError::Config(
                "scheduler.default_max_retries cannot exceed scheduler.max_retries_cap".to_string(),
            ));
        }

        positive(self.retry.max_backoff_secs, "retry.max_backoff_secs")?;
        if self.retry.base_backoff_secs > self.retry.max_backoff_secs {
            return Err(NodeError::Config(
                "retry.base_backoff_secs cannot exceed retry.max_backoff_secs".to_string(),
            ));
        }

        positive(self.market.offer_ttl_secs, "market.offer_ttl_secs")?;
        positive(self.market.bid_ttl_secs, "market.bid_ttl_secs")?;
        positive(
            self.market.confirmation_timeout_secs,
            "market.confirmation_timeout_secs",
        )?;

        positive(self.workers.tick_interval_secs, "workers.tick_interval_secs")?;
        positive(self.workers.matching_interval_secs, "workers.matching_interval_secs")?;
        positive(self.workers.eviction_interval_secs, "workers.eviction_interval_secs")?;
        positive(
            self.workers.timeout_sweep_interval_secs,
            "workers.timeout_sweep_interval_secs",
        )?;

        positive(self.events.capacity as u64, "events.capacity")?;
        positive(self.events.history_limit as u64, "events.history_limit")?;
        positive(u64::from(self.store.update_attempts), "store.update_attempts")?;

        if self.logging.filter.trim().is_empty() {
            return Err(NodeError::Config("logging.filter cannot be empty".to_string()));
        }

        Ok(())
    }
}
