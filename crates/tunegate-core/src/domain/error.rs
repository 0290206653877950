//! Engine error taxonomy.
//!
//! Lifecycle outcomes (lock contention, insufficient samples, persistence
//! failures during a proposal) are recorded as terminal states with a
//! [`TerminalReason`](crate::domain::TerminalReason), not returned as errors.
//! `EngineError` covers caller misuse and storage faults outside a lifecycle.

use tunegate_state::StorageError;

use crate::config::ConfigError;
use crate::domain::ProposalState;
use crate::sampler::SamplerError;

/// Tunegate engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("agent not registered: {0}")]
    AgentNotFound(String),

    #[error("proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("approval request not found: {0}")]
    ApprovalRequestNotFound(String),

    #[error("stale configuration for agent {agent_id}: expected version {expected}, found {actual}")]
    StaleConfiguration {
        agent_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid parameter delta: {0}")]
    InvalidDelta(String),

    #[error("proposal {0} is already committed and cannot be cancelled")]
    AlreadyCommitted(String),

    #[error("illegal transition {from} -> {to}")]
    InvalidTransition {
        from: ProposalState,
        to: ProposalState,
    },

    #[error("record integrity check failed for {proposal_id}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        proposal_id: String,
        expected: String,
        actual: String,
    },

    #[error("lifecycle record {proposal_id} in state {state} is missing {field}")]
    IncompleteRecord {
        proposal_id: String,
        state: ProposalState,
        field: &'static str,
    },

    #[error("approval channel error: {0}")]
    Approval(String),

    #[error("no delta supplied and no proposer configured for agent {0}")]
    NoProposer(String),

    #[error("sampler error: {0}")]
    Sampler(#[from] SamplerError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
