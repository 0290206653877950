//! Tunegate Core Library
//!
//! Enhancement validation engine: proposes parameter changes for autonomous
//! agents, measures baseline and candidate over the same scenario set, and
//! commits a change only when it passes the significance gate.
//!
//! Entry point for embedders is [`FleetCoordinator`].

pub mod aggregate;
pub mod approval;
pub mod config;
pub mod domain;
pub mod events;
pub mod fleet;
pub mod lifecycle;
pub mod locks;
pub mod metrics;
pub mod obs;
pub mod proposer;
pub mod recovery;
pub mod sampler;
pub mod stats;
pub mod store;
pub mod telemetry;

pub use aggregate::summarize;

pub use approval::{
    impact_score, request_id_for, ApprovalChannel, Decision, MemoryApprovalChannel,
    ProposalSummary, RiskTier,
};

pub use config::{
    ApprovalConfig, BusyPolicy, CommitConfig, ConfigError, EngineConfig, FleetConfig, Mode,
    ProposerConfig, SamplerConfig, StorageBackend, StorageConfig,
};

pub use domain::{
    AgentConfiguration, EngineError, EnhancementProposal, EnhancementRequest, LifecycleRecord,
    ParameterBound, ParameterBounds, ParameterDelta, Parameters, PerformanceSummary,
    ProposalState, Result, Scenario, ScenarioPlan, TerminalReason, TransitionEntry, TrialResult,
};

pub use events::{EnhancementEvent, EventKind};

pub use fleet::{FleetCoordinator, FleetStats, ProposalHandle};

pub use lifecycle::{never_cancelled, EngineDeps, Orchestrator};

pub use proposer::{DeltaProposer, HistoryGuidedProposer, LearnedPattern, PatternOutcome};

pub use recovery::RecoveryReport;

pub use sampler::{
    ExecutorSampler, ProcessExecutor, Sampler, SamplerError, ScriptedSampler, SyntheticSampler,
    TaskExecutor, TrialOutcome,
};

pub use stats::{compare, GateThresholds, StatisticalComparison};

pub use store::{ConfigStore, LifecycleStore, PatternStore};
