//! Domain models for Tunegate.
//!
//! Canonical definitions for the core entities:
//! - `AgentConfiguration`: committed, versioned parameter set of an agent
//! - `EnhancementProposal` / `LifecycleRecord`: one proposal and its durable audit record
//! - `TrialResult` / `PerformanceSummary`: sampled outcomes and their reduction

pub mod agent;
pub mod error;
pub mod proposal;
pub mod trial;

pub use agent::{
    parameters_identical, AgentConfiguration, ParameterBound, ParameterBounds, ParameterDelta,
    Parameters,
};
pub use error::{EngineError, Result};
pub use proposal::{
    EnhancementProposal, EnhancementRequest, LifecycleRecord, ProposalState, TerminalReason,
    TransitionEntry,
};
pub use trial::{PerformanceSummary, Scenario, ScenarioPlan, TrialResult};
