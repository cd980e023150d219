//! Engine configuration
//!
//! Every field has a default, so a partial file (or none at all) is valid.
//! Sources are layered defaults < file < environment; environment keys use
//! the `FOREMAN_SWARM` prefix and `__` as the nesting separator, e.g.
//! `FOREMAN_SWARM__COMPLIANCE__MAX_AVG_RESPONSE_TIME_MS=1500`.

use crate::error::{SwarmError, SwarmResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "FOREMAN_SWARM";

/// Configuration for the swarm coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Maximum number of agents in the registry
    pub max_agents: usize,
    /// Period of the background distribution and rebalance cycle
    pub distribution_interval_ms: u64,
    /// Utilisation at or above which an agent counts as overloaded
    pub overload_threshold_percent: f64,
    /// Operations on the same target closer than this collide
    pub conflict_window_ms: u64,
    /// Backoff applied to agents that lose a conflict
    pub default_backoff_ms: u64,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
    /// Resolved conflicts kept for `conflicts()`; the oldest are dropped first
    pub conflict_history_limit: usize,
    /// Externally supplied compliance thresholds
    pub compliance: ComplianceThresholds,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_agents: crate::MAX_SWARM_SIZE,
            distribution_interval_ms: 1000,
            overload_threshold_percent: 100.0,
            conflict_window_ms: 5000,
            default_backoff_ms: 5000,
            event_buffer: 1024,
            conflict_history_limit: 1000,
            compliance: ComplianceThresholds::default(),
        }
    }
}

/// Thresholds for the CS5 and CS6 compliance reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceThresholds {
    /// CS5: agents slower than this on average are reported
    pub max_avg_response_time_ms: u64,
    /// Path prefixes that count as protected targets
    pub protected_paths: Vec<String>,
    /// A governance constraint containing one of these marks its task protected
    pub protected_constraint_markers: Vec<String>,
    /// Metadata keys accepted as authorization evidence
    pub authorization_keys: Vec<String>,
}

impl Default for ComplianceThresholds {
    fn default() -> Self {
        Self {
            max_avg_response_time_ms: 2000,
            protected_paths: [
                ".github/workflows/",
                ".github/foreman/agent-contract.md",
                "BUILD_PHILOSOPHY.md",
                "foreman/constitution/",
                "foreman/governance/",
                "docs/governance/",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            protected_constraint_markers: vec!["PROTECTED".to_string()],
            authorization_keys: vec!["authorization".to_string(), "approvalId".to_string()],
        }
    }
}

impl ComplianceThresholds {
    /// Whether `target` falls under a protected path prefix
    pub fn is_protected_path(&self, target: &str) -> bool {
        let target = target.trim_start_matches("./").trim_start_matches('/');
        self.protected_paths
            .iter()
            .any(|prefix| target.starts_with(prefix.as_str()))
    }
}

impl SwarmConfig {
    /// Load defaults overlaid with `FOREMAN_SWARM__*` environment variables
    pub fn load() -> SwarmResult<Self> {
        let config = config::Config::builder()
            .add_source(Self::environment())
            .build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Load a TOML/YAML/JSON file (format by extension), then apply the environment
    pub fn from_file(path: impl AsRef<Path>) -> SwarmResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(true))
            .add_source(Self::environment())
            .build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> SwarmResult<()> {
        if self.max_agents == 0 {
            return Err(SwarmError::InvalidConfiguration(
                "max_agents must be positive".to_string(),
            ));
        }
        if self.distribution_interval_ms == 0 {
            return Err(SwarmError::InvalidConfiguration(
                "distribution_interval_ms must be positive".to_string(),
            ));
        }
        if self.overload_threshold_percent.is_nan() || self.overload_threshold_percent <= 0.0 {
            return Err(SwarmError::InvalidConfiguration(format!(
                "overload_threshold_percent must be positive, got {}",
                self.overload_threshold_percent
            )));
        }
        if self.event_buffer == 0 {
            return Err(SwarmError::InvalidConfiguration(
                "event_buffer must be positive".to_string(),
            ));
        }
        if self.conflict_history_limit == 0 {
            return Err(SwarmError::InvalidConfiguration(
                "conflict_history_limit must be positive".to_string(),
            ));
        }
        if self.compliance.max_avg_response_time_ms == 0 {
            return Err(SwarmError::InvalidConfiguration(
                "compliance.max_avg_response_time_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn distribution_interval(&self) -> Duration {
        Duration::from_millis(self.distribution_interval_ms)
    }

    pub fn conflict_window(&self) -> Duration {
        Duration::from_millis(self.conflict_window_ms)
    }

    pub fn default_backoff(&self) -> Duration {
        Duration::from_millis(self.default_backoff_ms)
    }
}
