//! Enhancement proposals and their durable lifecycle records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::agent::{AgentConfiguration, ParameterDelta, Parameters};
use crate::domain::error::{EngineError, Result};
use crate::domain::trial::{PerformanceSummary, ScenarioPlan};
use crate::stats::StatisticalComparison;

/// Lifecycle state of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Created,
    Baselining,
    Baselined,
    Evaluating,
    Evaluated,
    AwaitingApproval,
    Committed,
    RolledBack,
    Failed,
}

impl ProposalState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }

    /// Legal edges of the lifecycle state machine.
    ///
    /// Every non-terminal state may fail or be cancelled (rolled back);
    /// terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ProposalState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) | (_, RolledBack) => true,
            (Created, Baselining) => true,
            (Baselining, Baselined) => true,
            (Baselined, Evaluating) => true,
            (Evaluating, Evaluated) => true,
            (Evaluated, Committed) | (Evaluated, AwaitingApproval) => true,
            (AwaitingApproval, Committed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Baselining => "baselining",
            Self::Baselined => "baselined",
            Self::Evaluating => "evaluating",
            Self::Evaluated => "evaluated",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured cause of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// Candidate passed the gate and was written to the configuration store.
    Committed,
    /// Comparison ran but failed the significance gate.
    StatisticalRejection,
    /// A human reviewer declined the proposal.
    ApprovalRejected,
    /// Escalation was required but no approval channel accepted the request.
    ApprovalUnavailable,
    /// Significant, but the fleet runs in observe-only mode.
    ObservationOnly,
    Cancelled,
    /// Another proposal holds the agent lock.
    LockContention,
    FleetPaused,
    InsufficientSample,
    SamplerFatal,
    PersistenceFailure,
    /// The committed version moved under the proposal.
    StaleConfiguration,
    InvalidDelta,
    AgentNotFound,
}

impl TerminalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::StatisticalRejection => "statistical_rejection",
            Self::ApprovalRejected => "approval_rejected",
            Self::ApprovalUnavailable => "approval_unavailable",
            Self::ObservationOnly => "observation_only",
            Self::Cancelled => "cancelled",
            Self::LockContention => "lock_contention",
            Self::FleetPaused => "fleet_paused",
            Self::InsufficientSample => "insufficient_sample",
            Self::SamplerFatal => "sampler_fatal",
            Self::PersistenceFailure => "persistence_failure",
            Self::StaleConfiguration => "stale_configuration",
            Self::InvalidDelta => "invalid_delta",
            Self::AgentNotFound => "agent_not_found",
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to improve one agent.
///
/// Without an explicit `delta` the fleet asks its proposer for one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementRequest {
    pub agent_id: String,
    #[serde(default)]
    pub delta: Option<ParameterDelta>,
    #[serde(default)]
    pub reason: String,
}

impl EnhancementRequest {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            delta: None,
            reason: String::new(),
        }
    }

    pub fn with_delta(mut self, delta: ParameterDelta) -> Self {
        self.delta = Some(delta);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

/// A candidate parameter change for one agent.
///
/// `candidate_config` is tentative: it lives only in the lifecycle record and
/// is never visible through configuration store reads until committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementProposal {
    pub proposal_id: String,
    pub agent_id: String,
    pub reason: String,
    pub delta: Option<ParameterDelta>,
    pub baseline_config: Option<AgentConfiguration>,
    pub candidate_config: Option<Parameters>,
    pub state: ProposalState,
    pub created_at: DateTime<Utc>,
}

/// One entry of the append-only transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEntry {
    pub from: ProposalState,
    pub to: ProposalState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Durable projection of a proposal plus everything measured for it.
///
/// Persisted after every transition under `proposals/<proposal_id>`; this is
/// what recovery reads back after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub proposal: EnhancementProposal,
    pub scenario_plan: Option<ScenarioPlan>,
    pub baseline_summary: Option<PerformanceSummary>,
    pub candidate_summary: Option<PerformanceSummary>,
    pub comparison: Option<StatisticalComparison>,
    pub impact_score: Option<f64>,
    pub approval_request_id: Option<String>,
    pub committed_version: Option<u64>,
    pub restored_config: Option<AgentConfiguration>,
    pub terminal_reason: Option<TerminalReason>,
    pub detail: Option<String>,
    pub transitions: Vec<TransitionEntry>,
    pub updated_at: DateTime<Utc>,
    /// SHA-256 of the sealed terminal record (with this field cleared).
    pub digest: Option<String>,
}

impl LifecycleRecord {
    pub fn new(proposal_id: impl Into<String>, request: EnhancementRequest, now: DateTime<Utc>) -> Self {
        Self {
            proposal: EnhancementProposal {
                proposal_id: proposal_id.into(),
                agent_id: request.agent_id,
                reason: request.reason,
                delta: request.delta,
                baseline_config: None,
                candidate_config: None,
                state: ProposalState::Created,
                created_at: now,
            },
            scenario_plan: None,
            baseline_summary: None,
            candidate_summary: None,
            comparison: None,
            impact_score: None,
            approval_request_id: None,
            committed_version: None,
            restored_config: None,
            terminal_reason: None,
            detail: None,
            transitions: Vec::new(),
            updated_at: now,
            digest: None,
        }
    }

    pub fn proposal_id(&self) -> &str {
        &self.proposal.proposal_id
    }

    pub fn agent_id(&self) -> &str {
        &self.proposal.agent_id
    }

    pub fn state(&self) -> ProposalState {
        self.proposal.state
    }

    pub fn is_terminal(&self) -> bool {
        self.proposal.state.is_terminal()
    }

    /// Move to `to`, appending to the transition history.
    pub fn transition(&mut self, to: ProposalState, note: Option<String>, now: DateTime<Utc>) -> Result<()> {
        let from = self.proposal.state;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        self.proposal.state = to;
        self.updated_at = now;
        self.transitions.push(TransitionEntry { from, to, at: now, note });
        Ok(())
    }

    /// Move to a terminal state and seal the record.
    ///
    /// Rollbacks and failures record the exact baseline as `restored_config`.
    pub fn resolve(
        &mut self,
        to: ProposalState,
        reason: TerminalReason,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        debug_assert!(to.is_terminal());
        self.transition(to, detail.clone(), now)?;
        self.terminal_reason = Some(reason);
        self.detail = detail;
        if to != ProposalState::Committed {
            self.restored_config = self.proposal.baseline_config.clone();
        }
        self.seal()
    }

    fn seal(&mut self) -> Result<()> {
        self.digest = Some(self.compute_digest()?);
        Ok(())
    }

    /// SHA-256 over the canonical JSON of the record with `digest` cleared.
    pub fn compute_digest(&self) -> Result<String> {
        let mut unsealed = self.clone();
        unsealed.digest = None;
        let bytes = serde_json::to_vec(&unsealed)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Check that a terminal record has not been altered since it was sealed.
    pub fn verify_integrity(&self) -> Result<()> {
        let actual = self.compute_digest()?;
        match &self.digest {
            Some(expected) if *expected == actual => Ok(()),
            None if !self.is_terminal() => Ok(()),
            expected => Err(EngineError::IntegrityMismatch {
                proposal_id: self.proposal_id().to_string(),
                expected: expected.clone().unwrap_or_else(|| "<unsealed>".to_string()),
                actual,
            }),
        }
    }
}
