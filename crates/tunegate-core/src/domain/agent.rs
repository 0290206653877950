//! Agent configurations and parameter deltas.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::{EngineError, Result};

/// Tunable parameters of an agent, keyed by name.
pub type Parameters = BTreeMap<String, f64>;

/// The committed parameter set of one agent.
///
/// Exactly one committed configuration exists per agent; `version` starts at
/// 1 on registration and increases by one on every commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfiguration {
    pub agent_id: String,
    pub parameters: Parameters,
    pub version: u64,
    pub committed_at: DateTime<Utc>,
}

impl AgentConfiguration {
    /// First configuration of a newly registered agent.
    pub fn initial(agent_id: impl Into<String>, parameters: Parameters, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            parameters,
            version: 1,
            committed_at: now,
        }
    }

    /// The configuration that replaces `self` on commit.
    pub fn successor(&self, parameters: Parameters, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: self.agent_id.clone(),
            parameters,
            version: self.version + 1,
            committed_at: now,
        }
    }
}

/// Bit-level equality of two parameter sets (`-0.0 != 0.0`, `NaN == NaN`).
pub fn parameters_identical(a: &Parameters, b: &Parameters) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|((ka, va), (kb, vb))| ka == kb && va.to_bits() == vb.to_bits())
}

/// Additive per-parameter change proposed for an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterDelta {
    pub changes: BTreeMap<String, f64>,
}

impl ParameterDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add `amount` to parameter `name`.
    pub fn with(mut self, name: impl Into<String>, amount: f64) -> Self {
        self.changes.insert(name.into(), amount);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Apply the delta to `base`, clamping the touched parameters to `bounds`.
    ///
    /// Unknown parameter names, non-finite amounts and empty deltas are
    /// rejected with [`EngineError::InvalidDelta`].
    pub fn apply(&self, base: &Parameters, bounds: &ParameterBounds) -> Result<Parameters> {
        if self.changes.is_empty() {
            return Err(EngineError::InvalidDelta("delta is empty".to_string()));
        }
        let mut candidate = base.clone();
        for (name, amount) in &self.changes {
            if !amount.is_finite() {
                return Err(EngineError::InvalidDelta(format!(
                    "non-finite change for parameter {name}"
                )));
            }
            let Some(value) = candidate.get_mut(name) else {
                return Err(EngineError::InvalidDelta(format!("unknown parameter {name}")));
            };
            *value = bounds.clamp(name, *value + amount);
        }
        Ok(candidate)
    }

    /// Human-readable summary, e.g. `temperature +0.0500, top_k -2.0000`.
    pub fn describe(&self) -> String {
        self.changes
            .iter()
            .map(|(name, amount)| format!("{name} {amount:+.4}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Optional inclusive range for one parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterBound {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// Per-parameter bounds applied to every candidate configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterBounds {
    pub bounds: BTreeMap<String, ParameterBound>,
}

impl ParameterBounds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        self.bounds.insert(name.into(), ParameterBound { min, max });
        self
    }

    pub fn clamp(&self, name: &str, value: f64) -> f64 {
        match self.bounds.get(name) {
            Some(bound) => {
                let mut v = value;
                if let Some(min) = bound.min {
                    v = v.max(min);
                }
                if let Some(max) = bound.max {
                    v = v.min(max);
                }
                v
            }
            None => value,
        }
    }

    /// Ranges where `min > max` are unusable.
    pub fn inverted(&self) -> Vec<&str> {
        self.bounds
            .iter()
            .filter(|(_, b)| matches!((b.min, b.max), (Some(lo), Some(hi)) if lo > hi))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Parameters {
        Parameters::from([("temperature".to_string(), 0.7), ("top_k".to_string(), 40.0)])
    }

    #[test]
    fn test_successor_increments_version() {
        let now = Utc::now();
        let v1 = AgentConfiguration::initial("scout", params(), now);
        let v2 = v1.successor(params(), now);
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.agent_id, "scout");
    }

    #[test]
    fn test_delta_is_additive() {
        let delta = ParameterDelta::new().with("temperature", 0.1);
        let candidate = delta.apply(&params(), &ParameterBounds::new()).unwrap();
        assert!((candidate["temperature"] - 0.8).abs() < 1e-12);
        assert_eq!(candidate["top_k"], 40.0);
    }

    #[test]
    fn test_delta_rejects_unknown_parameter() {
        let delta = ParameterDelta::new().with("creativity", 1.0);
        let err = delta.apply(&params(), &ParameterBounds::new()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidDelta(ref m) if m.contains("creativity")));
    }

    #[test]
    fn test_delta_rejects_empty_and_non_finite() {
        let bounds = ParameterBounds::new();
        assert!(ParameterDelta::new().apply(&params(), &bounds).is_err());
        let nan = ParameterDelta::new().with("top_k", f64::NAN);
        assert!(nan.apply(&params(), &bounds).is_err());
    }

    #[test]
    fn test_bounds_clamp_candidate() {
        let bounds = ParameterBounds::new().with("temperature", Some(0.0), Some(1.0));
        let delta = ParameterDelta::new().with("temperature", 5.0);
        let candidate = delta.apply(&params(), &bounds).unwrap();
        assert_eq!(candidate["temperature"], 1.0);
    }

    #[test]
    fn test_inverted_bounds_reported() {
        let bounds = ParameterBounds::new()
            .with("a", Some(2.0), Some(1.0))
            .with("b", Some(0.0), None);
        assert_eq!(bounds.inverted(), vec!["a"]);
    }

    #[test]
    fn test_parameters_identical_is_bitwise() {
        let a = Parameters::from([("x".to_string(), 0.0)]);
        let b = Parameters::from([("x".to_string(), -0.0)]);
        assert!(parameters_identical(&a, &a.clone()));
        assert!(!parameters_identical(&a, &b));
    }

    #[test]
    fn test_describe_delta() {
        let delta = ParameterDelta::new().with("top_k", -2.0);
        assert_eq!(delta.describe(), "top_k -2.0000");
    }
}
