//! Engine configuration.
//!
//! Loaded from TOML; every field has a default so an empty document is a
//! valid configuration:
//!
//! ```toml
//! [gate]
//! alpha = 0.05
//! min_sample_size = 30
//!
//! [sampler]
//! scenario_count = 150
//!
//! [fleet]
//! max_concurrent = 4
//! busy_policy = "reject"   # or "queue"
//! mode = "active"          # or "observe_only", "paused"
//!
//! [bounds.temperature]
//! min = 0.0
//! max = 2.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ParameterBounds;
use crate::stats::GateThresholds;

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How the fleet treats a request for an agent that already has a proposal in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Fail the new proposal immediately with `LockContention`.
    #[default]
    Reject,
    /// Wait for the agent lock.
    Queue,
}

/// Operating mode of the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Active,
    /// Measure everything, commit nothing.
    ObserveOnly,
    /// Refuse new proposals.
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Trials per side (baseline and candidate).
    pub scenario_count: u32,
    /// Concurrent trials within one sampler invocation.
    pub max_parallel_trials: usize,
    /// Per-trial timeout; `None` waits indefinitely.
    pub trial_timeout_ms: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            scenario_count: 150,
            max_parallel_trials: 8,
            trial_timeout_ms: None,
        }
    }
}

impl SamplerConfig {
    pub fn trial_timeout(&self) -> Option<Duration> {
        self.trial_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Global cap on proposals executing at once.
    pub max_concurrent: usize,
    pub busy_policy: BusyPolicy,
    pub mode: Mode,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            busy_policy: BusyPolicy::Reject,
            mode: Mode::Active,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Proposals whose impact score reaches this value need human approval.
    pub impact_threshold: f64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            impact_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Configuration store write attempts before `PersistenceFailure`.
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl CommitConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposerConfig {
    /// First step for an untried parameter, relative to its magnitude.
    pub initial_step_pct: f64,
    /// Learned patterns kept per agent.
    pub max_patterns: usize,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            initial_step_pct: 0.1,
            max_patterns: 100,
        }
    }
}

/// Storage backend selection (used by binaries).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Fs,
    Memory,
    Surreal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory of the filesystem backend.
    pub path: PathBuf,
    /// Endpoint of the SurrealDB backend.
    pub url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            path: PathBuf::from(".tunegate"),
            url: "mem://".to_string(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub gate: GateThresholds,
    pub sampler: SamplerConfig,
    pub fleet: FleetConfig,
    pub approval: ApprovalConfig,
    pub commit: CommitConfig,
    pub proposer: ProposerConfig,
    pub storage: StorageConfig,
    pub bounds: ParameterBounds,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.gate;
        if !in_open_unit(g.alpha) {
            return invalid(format!("gate.alpha must be in (0, 1), got {}", g.alpha));
        }
        if !in_open_unit(g.confidence_level) {
            return invalid(format!(
                "gate.confidence_level must be in (0, 1), got {}",
                g.confidence_level
            ));
        }
        if g.min_sample_size < 2 {
            return invalid("gate.min_sample_size must be at least 2".to_string());
        }
        if g.min_improvement_pct < 0.0 || g.min_effect_size < 0.0 {
            return invalid("gate thresholds must not be negative".to_string());
        }
        if matches!(g.max_success_rate_drop, Some(d) if !(0.0..=1.0).contains(&d)) {
            return invalid("gate.max_success_rate_drop must be in [0, 1]".to_string());
        }
        if self.sampler.scenario_count == 0 {
            return invalid("sampler.scenario_count must be positive".to_string());
        }
        if self.sampler.max_parallel_trials == 0 {
            return invalid("sampler.max_parallel_trials must be positive".to_string());
        }
        if self.fleet.max_concurrent == 0 {
            return invalid("fleet.max_concurrent must be positive".to_string());
        }
        if self.fleet.event_buffer == 0 {
            return invalid("fleet.event_buffer must be positive".to_string());
        }
        if self.approval.impact_threshold.is_nan() || self.approval.impact_threshold < 0.0 {
            return invalid("approval.impact_threshold must not be negative".to_string());
        }
        if self.commit.max_attempts == 0 {
            return invalid("commit.max_attempts must be positive".to_string());
        }
        if self.proposer.initial_step_pct.is_nan() || self.proposer.initial_step_pct <= 0.0 {
            return invalid("proposer.initial_step_pct must be positive".to_string());
        }
        let inverted = self.bounds.inverted();
        if !inverted.is_empty() {
            return invalid(format!("bounds with min > max: {}", inverted.join(", ")));
        }
        Ok(())
    }
}

fn in_open_unit(v: f64) -> bool {
    v > 0.0 && v < 1.0
}

fn invalid(msg: String) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(msg))
}
