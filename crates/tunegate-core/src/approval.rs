//! Human approval gate.
//!
//! Proposals whose impact score reaches `approval.impact_threshold` are
//! submitted to an [`ApprovalChannel`] and the lifecycle suspends in
//! `AwaitingApproval`. The decision comes back through
//! `FleetCoordinator::on_decision`, possibly after a restart.
//!
//! Request ids are derived from the proposal id ([`request_id_for`]) so a
//! resubmission during recovery is idempotent.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EngineError, LifecycleRecord, Parameters, Result};
use crate::stats::StatisticalComparison;

/// Reviewer decision on an escalated proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl FromStr for Decision {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(Self::Approved),
            "reject" | "rejected" => Ok(Self::Rejected),
            other => Err(EngineError::Approval(format!("unknown decision {other:?}"))),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => f.write_str("approved"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

/// Risk tier shown to reviewers, derived from the impact score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn from_impact(impact: f64) -> Self {
        if impact < 0.1 {
            Self::Low
        } else if impact < 0.3 {
            Self::Medium
        } else if impact < 1.0 {
            Self::High
        } else {
            Self::Critical
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Largest relative parameter change between two configurations:
/// `max |candidate - baseline| / max(|baseline|, 1e-9)`.
pub fn impact_score(baseline: &Parameters, candidate: &Parameters) -> f64 {
    candidate
        .iter()
        .map(|(name, new)| {
            let old = baseline.get(name).copied().unwrap_or(0.0);
            (new - old).abs() / old.abs().max(1e-9)
        })
        .fold(0.0, f64::max)
}

pub fn request_id_for(proposal_id: &str) -> String {
    format!("apr-{proposal_id}")
}

/// What a reviewer sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalSummary {
    pub request_id: String,
    pub proposal_id: String,
    pub agent_id: String,
    pub baseline: Parameters,
    pub candidate: Parameters,
    pub comparison: StatisticalComparison,
    pub impact_score: f64,
    pub risk_tier: RiskTier,
    pub explanation: String,
    pub submitted_at: DateTime<Utc>,
}

impl ProposalSummary {
    /// Summary of an evaluated record. `None` if the record has no
    /// baseline, candidate or comparison yet.
    pub fn from_record(record: &LifecycleRecord, impact: f64, now: DateTime<Utc>) -> Option<Self> {
        let baseline = record.proposal.baseline_config.as_ref()?;
        let candidate = record.proposal.candidate_config.as_ref()?;
        let comparison = record.comparison.clone()?;
        let risk_tier = RiskTier::from_impact(impact);
        let change = record
            .proposal
            .delta
            .as_ref()
            .map(|d| d.describe())
            .unwrap_or_default();
        let explanation = format!(
            "{change} on {agent} v{version}: mean {improvement:+.1}% (p={p:.4}, d={d:.2}); \
             impact {impact:.2} is {risk_tier} risk",
            agent = record.agent_id(),
            version = baseline.version,
            improvement = comparison.improvement_pct * 100.0,
            p = comparison.p_value,
            d = comparison.effect_size,
        );
        Some(Self {
            request_id: request_id_for(record.proposal_id()),
            proposal_id: record.proposal_id().to_string(),
            agent_id: record.agent_id().to_string(),
            baseline: baseline.parameters.clone(),
            candidate: candidate.clone(),
            comparison,
            impact_score: impact,
            risk_tier,
            explanation,
            submitted_at: now,
        })
    }
}

/// External channel that collects human decisions.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Deliver `summary` to reviewers. Returns the request id decisions will
    /// reference. Submitting the same request id twice must not create a
    /// second request.
    async fn submit(&self, summary: &ProposalSummary) -> Result<String>;

    /// Retract a pending request (the proposal was cancelled).
    async fn withdraw(&self, request_id: &str) -> Result<()>;
}

/// In-memory channel. Decisions are delivered by calling the fleet directly.
#[derive(Default)]
pub struct MemoryApprovalChannel {
    pending: Mutex<BTreeMap<String, ProposalSummary>>,
    submissions: Mutex<usize>,
    unavailable: bool,
}

impl MemoryApprovalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel that refuses every submission.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Pending requests, ordered by request id.
    pub fn pending(&self) -> Vec<ProposalSummary> {
        self.requests().values().cloned().collect()
    }

    /// Total accepted submissions, including idempotent repeats.
    pub fn submissions(&self) -> usize {
        *self.submissions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn requests(&self) -> MutexGuard<'_, BTreeMap<String, ProposalSummary>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ApprovalChannel for MemoryApprovalChannel {
    async fn submit(&self, summary: &ProposalSummary) -> Result<String> {
        if self.unavailable {
            return Err(EngineError::Approval("approval channel unavailable".to_string()));
        }
        self.requests()
            .entry(summary.request_id.clone())
            .or_insert_with(|| summary.clone());
        *self.submissions.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(summary.request_id.clone())
    }

    async fn withdraw(&self, request_id: &str) -> Result<()> {
        self.requests().remove(request_id);
        Ok(())
    }
}
