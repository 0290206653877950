//! Delta proposers and learned-pattern history.
//!
//! When a request carries no explicit delta, the orchestrator asks its
//! [`DeltaProposer`] for one, passing the agent's committed configuration
//! and the outcomes of its previous proposals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AgentConfiguration, EngineError, LifecycleRecord, ParameterDelta, ProposalState, Result,
    TerminalReason,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternOutcome {
    Committed,
    /// Significant, but not committed because the fleet only observes.
    Observed,
    Rejected,
}

/// Outcome of one compared proposal, kept per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub proposal_id: String,
    pub delta: ParameterDelta,
    pub improvement_pct: f64,
    pub effect_size: f64,
    pub p_value: f64,
    pub outcome: PatternOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl LearnedPattern {
    /// Pattern for a terminal record that got as far as a comparison.
    pub fn from_record(record: &LifecycleRecord) -> Option<Self> {
        let comparison = record.comparison.as_ref()?;
        let delta = record.proposal.delta.clone()?;
        let outcome = match (record.state(), record.terminal_reason) {
            (ProposalState::Committed, _) => PatternOutcome::Committed,
            (_, Some(TerminalReason::ObservationOnly)) => PatternOutcome::Observed,
            _ => PatternOutcome::Rejected,
        };
        Some(Self {
            proposal_id: record.proposal_id().to_string(),
            delta,
            improvement_pct: comparison.improvement_pct,
            effect_size: comparison.effect_size,
            p_value: comparison.p_value,
            outcome,
            recorded_at: record.updated_at,
        })
    }
}

/// Capability that invents the next parameter change for an agent.
pub trait DeltaProposer: Send + Sync {
    /// `history` is oldest first.
    fn propose(&self, current: &AgentConfiguration, history: &[LearnedPattern]) -> Result<ParameterDelta>;
}

/// Coordinate search guided by past outcomes.
///
/// Visits one parameter per proposal, round-robin in name order. For the
/// chosen parameter, the last attempt's step is grown by 1.5 in the same
/// direction if it was kept and halved in the opposite direction if it was
/// rejected. An untried parameter starts at `initial_step_pct` of its
/// magnitude (or the absolute `initial_step_pct` when it is zero).
#[derive(Debug, Clone)]
pub struct HistoryGuidedProposer {
    initial_step_pct: f64,
}

impl HistoryGuidedProposer {
    pub const GROW: f64 = 1.5;
    pub const SHRINK: f64 = 0.5;

    pub fn new(initial_step_pct: f64) -> Self {
        Self { initial_step_pct }
    }
}

impl Default for HistoryGuidedProposer {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl DeltaProposer for HistoryGuidedProposer {
    fn propose(&self, current: &AgentConfiguration, history: &[LearnedPattern]) -> Result<ParameterDelta> {
        let names: Vec<&String> = current.parameters.keys().collect();
        if names.is_empty() {
            return Err(EngineError::InvalidDelta(format!(
                "agent {} has no parameters to tune",
                current.agent_id
            )));
        }

        let last_touched = history
            .last()
            .and_then(|p| p.delta.changes.keys().next())
            .and_then(|name| names.iter().position(|n| *n == name));
        let name = match last_touched {
            Some(i) => names[(i + 1) % names.len()],
            None => names[0],
        };

        let previous = history
            .iter()
            .rev()
            .find_map(|p| p.delta.changes.get(name).map(|amount| (*amount, p.outcome)));
        let amount = match previous {
            Some((amount, PatternOutcome::Committed | PatternOutcome::Observed)) => amount * Self::GROW,
            Some((amount, PatternOutcome::Rejected)) => -amount * Self::SHRINK,
            None => {
                let value = current.parameters.get(name).copied().unwrap_or(0.0);
                if value == 0.0 {
                    self.initial_step_pct
                } else {
                    value.abs() * self.initial_step_pct
                }
            }
        };
        if amount == 0.0 || !amount.is_finite() {
            return Err(EngineError::InvalidDelta(format!(
                "no usable step left for parameter {name}"
            )));
        }
        Ok(ParameterDelta::new().with(name.clone(), amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Parameters;

    fn config() -> AgentConfiguration {
        let params: Parameters = [("temperature".to_string(), 0.5), ("top_k".to_string(), 0.0)]
            .into_iter()
            .collect();
        AgentConfiguration::initial("scout", params, Utc::now())
    }

    fn pattern(name: &str, amount: f64, outcome: PatternOutcome) -> LearnedPattern {
        LearnedPattern {
            proposal_id: format!("p-{name}-{amount}"),
            delta: ParameterDelta::new().with(name, amount),
            improvement_pct: 0.0,
            effect_size: 0.0,
            p_value: 1.0,
            outcome,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_first_proposal_steps_first_parameter() {
        let delta = HistoryGuidedProposer::default().propose(&config(), &[]).unwrap();
        assert_eq!(delta.changes.len(), 1);
        assert!((delta.changes["temperature"] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_round_robin_and_zero_valued_parameter() {
        let history = [pattern("temperature", 0.05, PatternOutcome::Committed)];
        let delta = HistoryGuidedProposer::default().propose(&config(), &history).unwrap();
        assert_eq!(delta.changes.get("top_k"), Some(&0.1));
    }

    #[test]
    fn test_kept_step_grows_rejected_step_reverses() {
        let proposer = HistoryGuidedProposer::default();
        let kept = [
            pattern("temperature", 0.04, PatternOutcome::Committed),
            pattern("top_k", 1.0, PatternOutcome::Rejected),
        ];
        let delta = proposer.propose(&config(), &kept).unwrap();
        assert!((delta.changes["temperature"] - 0.06).abs() < 1e-12);

        let rejected = [
            pattern("temperature", 0.04, PatternOutcome::Rejected),
            pattern("top_k", 1.0, PatternOutcome::Observed),
        ];
        let delta = proposer.propose(&config(), &rejected).unwrap();
        assert!((delta.changes["temperature"] + 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_no_parameters_is_invalid() {
        let empty = AgentConfiguration::initial("scout", Parameters::new(), Utc::now());
        assert!(HistoryGuidedProposer::default().propose(&empty, &[]).is_err());
    }
}
