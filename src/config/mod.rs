//! # Huntsman Configuration System
//!
//! YAML-based configuration with environment overrides. Every section has
//! working defaults, so an empty `base.yaml` yields a usable single-node
//! coordinator backed by the in-memory store.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use huntsman_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load configuration (environment auto-detected)
//! let manager = ConfigManager::load()?;
//!
//! let lease = manager.config().worker.lease_duration();
//! let tick = manager.config().cron.tick_interval();
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::defaults;
use crate::error::{HuntsmanError, Result};
use crate::models::HuntLimits;

pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/base.yaml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HuntsmanConfig {
    /// Task queue worker settings
    pub worker: WorkerConfig,

    /// Flow runtime settings
    pub flows: FlowsConfig,

    /// Foreman maintenance settings
    pub foreman: ForemanConfig,

    /// Defaults applied to hunts created without explicit limits
    pub hunts: HuntsConfig,

    /// Cron scheduler settings
    pub cron: CronConfig,

    /// Durable store selection and pooling
    pub database: DatabaseConfig,

    /// Operator event channel
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identity stamped into `leased_by`
    pub worker_id: String,
    pub lease_duration_secs: u64,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            lease_duration_secs: defaults::LEASE_DURATION_SECS,
            batch_size: defaults::LEASE_BATCH_SIZE,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
        }
    }
}

impl WorkerConfig {
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_duration_secs as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// `<hostname>-<pid>-<uuid8>`
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "huntsman".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowsConfig {
    /// Deadline for flows whose creator sets none
    pub default_lifetime_secs: u64,
    /// Running flows past their deadline picked up per maintenance pass
    pub deadline_sweep_limit: usize,
}

impl Default for FlowsConfig {
    fn default() -> Self {
        Self {
            default_lifetime_secs: defaults::FLOW_LIFETIME_SECS,
            deadline_sweep_limit: defaults::DEADLINE_SWEEP_LIMIT,
        }
    }
}

impl FlowsConfig {
    pub fn default_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_lifetime_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ForemanConfig {
    /// How often expired rules, hunts and flows are swept
    pub sweep_interval_secs: u64,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: defaults::RULE_SWEEP_INTERVAL_SECS,
        }
    }
}

impl ForemanConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HuntsConfig {
    pub default_client_limit: Option<u64>,
    pub default_expiry_secs: u64,
    pub min_failure_sample: u64,
    pub default_max_failure_ratio: Option<f64>,
}

impl Default for HuntsConfig {
    fn default() -> Self {
        let limits = HuntLimits::default();
        Self {
            default_client_limit: limits.client_limit,
            default_expiry_secs: limits.expiry_secs,
            min_failure_sample: limits.min_failure_sample,
            default_max_failure_ratio: None,
        }
    }
}

impl HuntsConfig {
    /// Limits for a hunt created without explicit ones
    pub fn default_limits(&self) -> HuntLimits {
        HuntLimits {
            client_limit: self.default_client_limit,
            max_failure_ratio: self.default_max_failure_ratio,
            min_failure_sample: self.min_failure_sample,
            expiry_secs: self.default_expiry_secs,
            ..HuntLimits::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CronConfig {
    pub enabled: bool,
    pub tick_interval_secs: u64,
    pub lease_duration_secs: u64,
    pub max_run_history: usize,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: defaults::CRON_TICK_INTERVAL_SECS,
            lease_duration_secs: defaults::CRON_LEASE_DURATION_SECS,
            max_run_history: defaults::MAX_RUN_HISTORY,
        }
    }
}

impl CronConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_duration_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL URL; the in-memory store is used when unset
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: defaults::EVENT_CHANNEL_CAPACITY,
        }
    }
}

fn invalid(field: &str, reason: &str) -> HuntsmanError {
    HuntsmanError::ConfigurationError(format!("{field}: {reason}"))
}

impl HuntsmanConfig {
    /// Reject values that would stall or corrupt the coordinator
    pub fn validate(&self) -> Result<()> {
        if self.worker.worker_id.trim().is_empty() {
            return Err(invalid("worker.worker_id", "must not be empty"));
        }
        if self.worker.lease_duration_secs == 0 {
            return Err(invalid("worker.lease_duration_secs", "must be greater than 0"));
        }
        if self.worker.batch_size == 0 {
            return Err(invalid("worker.batch_size", "must be greater than 0"));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(invalid("worker.poll_interval_ms", "must be greater than 0"));
        }
        if self.flows.default_lifetime_secs == 0 {
            return Err(invalid("flows.default_lifetime_secs", "must be greater than 0"));
        }
        if self.foreman.sweep_interval_secs == 0 {
            return Err(invalid("foreman.sweep_interval_secs", "must be greater than 0"));
        }
        if let Some(ratio) = self.hunts.default_max_failure_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(invalid(
                    "hunts.default_max_failure_ratio",
                    "must be within [0, 1]",
                ));
            }
        }
        if self.cron.tick_interval_secs == 0 {
            return Err(invalid("cron.tick_interval_secs", "must be greater than 0"));
        }
        if self.cron.lease_duration_secs == 0 {
            return Err(invalid("cron.lease_duration_secs", "must be greater than 0"));
        }
        if self.cron.max_run_history == 0 {
            return Err(invalid("cron.max_run_history", "must be greater than 0"));
        }
        if self.database.max_connections == 0 {
            return Err(invalid("database.max_connections", "must be greater than 0"));
        }
        Ok(())
    }
}
