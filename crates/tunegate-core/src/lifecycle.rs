//! Enhancement lifecycle orchestrator.
//!
//! Drives one proposal through
//! `Created → Baselining → Baselined → Evaluating → Evaluated` and on to
//! `Committed`, `AwaitingApproval`, `RolledBack` or `Failed`.
//!
//! Every transition is persisted before the next stage starts, so a restart
//! resumes from the last durable state. Stage failures never escape as
//! `Err`: they resolve the record to a terminal state with a
//! [`TerminalReason`]. The candidate configuration only reaches the
//! [`ConfigStore`] on the way to `Committed`.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, warn, Instrument};
use tunegate_state::KvStore;
use uuid::Uuid;

use crate::aggregate::summarize;
use crate::approval::{impact_score, ApprovalChannel, Decision, ProposalSummary};
use crate::config::{EngineConfig, Mode};
use crate::domain::{
    parameters_identical, AgentConfiguration, EngineError, EnhancementRequest, LifecycleRecord,
    ParameterDelta, Parameters, ProposalState, Result, ScenarioPlan, TerminalReason, TrialResult,
};
use crate::events::EventBus;
use crate::locks::AgentLocks;
use crate::metrics::METRICS;
use crate::obs;
use crate::proposer::{DeltaProposer, LearnedPattern};
use crate::sampler::{ensure_complete, Sampler, SamplerResult};
use crate::stats::compare;
use crate::store::{ConfigStore, LifecycleStore, PatternStore};

/// Capabilities injected at construction. Absent capabilities are `None`.
#[derive(Clone)]
pub struct EngineDeps {
    pub kv: Arc<dyn KvStore>,
    pub sampler: Arc<dyn Sampler>,
    pub approval: Option<Arc<dyn ApprovalChannel>>,
    pub proposer: Option<Arc<dyn DeltaProposer>>,
}

impl EngineDeps {
    pub fn new(kv: Arc<dyn KvStore>, sampler: Arc<dyn Sampler>) -> Self {
        Self {
            kv,
            sampler,
            approval: None,
            proposer: None,
        }
    }

    pub fn with_approval(mut self, channel: Arc<dyn ApprovalChannel>) -> Self {
        self.approval = Some(channel);
        self
    }

    pub fn with_proposer(mut self, proposer: Arc<dyn DeltaProposer>) -> Self {
        self.proposer = Some(proposer);
        self
    }
}

/// Terminal outcome chosen by a stage.
#[derive(Debug)]
struct Resolution {
    state: ProposalState,
    reason: TerminalReason,
    detail: Option<String>,
}

/// What a stage did to the record.
#[derive(Debug)]
enum Step {
    /// Moved to the next state and persisted it.
    Advance,
    /// Persisted `AwaitingApproval`; the lifecycle waits for a decision.
    Suspend,
    Resolve(Resolution),
}

impl Step {
    fn resolve(state: ProposalState, reason: TerminalReason, detail: Option<String>) -> Self {
        Self::Resolve(Resolution { state, reason, detail })
    }

    fn fail(reason: TerminalReason, detail: impl Into<String>) -> Self {
        Self::resolve(ProposalState::Failed, reason, Some(detail.into()))
    }

    fn roll_back(reason: TerminalReason, detail: Option<String>) -> Self {
        Self::resolve(ProposalState::RolledBack, reason, detail)
    }
}

/// Terminal reason for an error raised inside a stage.
fn failure_reason(err: &EngineError) -> TerminalReason {
    match err {
        EngineError::AgentNotFound(_) => TerminalReason::AgentNotFound,
        EngineError::StaleConfiguration { .. } => TerminalReason::StaleConfiguration,
        EngineError::InvalidDelta(_) | EngineError::NoProposer(_) => TerminalReason::InvalidDelta,
        EngineError::Sampler(_) => TerminalReason::SamplerFatal,
        _ => TerminalReason::PersistenceFailure,
    }
}

fn missing(record: &LifecycleRecord, field: &'static str) -> EngineError {
    EngineError::IncompleteRecord {
        proposal_id: record.proposal_id().to_string(),
        state: record.state(),
        field,
    }
}

/// Resolves once `cancel` reads `true`. Never resolves if the sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// A cancellation receiver that never fires.
pub fn never_cancelled() -> watch::Receiver<bool> {
    watch::channel(false).1
}

pub struct Orchestrator {
    config: EngineConfig,
    deps: EngineDeps,
    configs: ConfigStore,
    records: LifecycleStore,
    patterns: PatternStore,
    locks: AgentLocks,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let configs = ConfigStore::new(Arc::clone(&deps.kv));
        let records = LifecycleStore::new(Arc::clone(&deps.kv));
        let patterns = PatternStore::new(Arc::clone(&deps.kv), config.proposer.max_patterns);
        let events = EventBus::new(config.fleet.event_buffer);
        Self {
            config,
            deps,
            configs,
            records,
            patterns,
            locks: AgentLocks::new(),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn configs(&self) -> &ConfigStore {
        &self.configs
    }

    pub fn records(&self) -> &LifecycleStore {
        &self.records
    }

    pub fn patterns(&self) -> &PatternStore {
        &self.patterns
    }

    pub fn locks(&self) -> &AgentLocks {
        &self.locks
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Persist a new proposal in `Created`.
    pub async fn create(&self, request: EnhancementRequest) -> Result<LifecycleRecord> {
        let proposal_id = format!("prop-{}", Uuid::new_v4());
        let record = LifecycleRecord::new(proposal_id, request, Utc::now());
        self.records.save(&record).await?;
        METRICS.inc_proposals_started();
        obs::emit_proposal_started(record.proposal_id(), record.agent_id());
        Ok(record)
    }

    /// Resolve a record that never started (fleet paused, agent busy).
    pub async fn reject(
        &self,
        record: LifecycleRecord,
        reason: TerminalReason,
        detail: impl Into<String>,
    ) -> Result<LifecycleRecord> {
        let span = obs::proposal_span(record.proposal_id(), record.agent_id());
        self.conclude(
            record,
            Resolution {
                state: ProposalState::Failed,
                reason,
                detail: Some(detail.into()),
            },
        )
        .instrument(span)
        .await
    }

    /// Run the record forward until it is terminal or awaiting approval.
    pub async fn drive(
        &self,
        record: LifecycleRecord,
        cancel: watch::Receiver<bool>,
    ) -> Result<LifecycleRecord> {
        let span = obs::proposal_span(record.proposal_id(), record.agent_id());
        self.drive_stages(record, cancel).instrument(span).await
    }

    async fn drive_stages(
        &self,
        mut record: LifecycleRecord,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<LifecycleRecord> {
        loop {
            if record.is_terminal() || record.state() == ProposalState::AwaitingApproval {
                return Ok(record);
            }
            if *cancel.borrow() {
                return self.conclude(record, cancel_resolution()).await;
            }

            let step = match record.state() {
                ProposalState::Created => self.start(&mut record).await,
                ProposalState::Baselining => self.measure_baseline(&mut record, &mut cancel).await,
                ProposalState::Baselined => self.prepare_candidate(&mut record).await,
                ProposalState::Evaluating => self.evaluate(&mut record, &mut cancel).await,
                ProposalState::Evaluated => self.decide(&mut record).await,
                _ => return Ok(record),
            };

            match step {
                Ok(Step::Advance) => continue,
                Ok(Step::Suspend) => return Ok(record),
                Ok(Step::Resolve(resolution)) => return self.conclude(record, resolution).await,
                Err(err) => {
                    let resolution = Resolution {
                        state: ProposalState::Failed,
                        reason: failure_reason(&err),
                        detail: Some(err.to_string()),
                    };
                    return self.conclude(record, resolution).await;
                }
            }
        }
    }

    async fn advance(&self, record: &mut LifecycleRecord, to: ProposalState) -> Result<Step> {
        let from = record.state();
        record.transition(to, None, Utc::now())?;
        self.records.save(record).await?;
        obs::emit_stage_transition(record.proposal_id(), from, to);
        Ok(Step::Advance)
    }

    // -- stages -------------------------------------------------------------

    /// Created: take the agent lock and pin the baseline and scenario plan.
    async fn start(&self, record: &mut LifecycleRecord) -> Result<Step> {
        if let Err(held) = self.locks.try_acquire(record.agent_id(), record.proposal_id()) {
            return Ok(Step::fail(TerminalReason::LockContention, held.to_string()));
        }
        let baseline = self.configs.require(record.agent_id()).await?;
        if let Some(delta) = &record.proposal.delta {
            // Reject an unusable explicit delta before spending a baseline run.
            delta.apply(&baseline.parameters, &self.config.bounds)?;
        }
        record.proposal.baseline_config = Some(baseline);
        record.scenario_plan = Some(ScenarioPlan::for_proposal(
            record.proposal_id(),
            self.config.sampler.scenario_count,
        ));
        self.advance(record, ProposalState::Baselining).await
    }

    async fn measure_baseline(
        &self,
        record: &mut LifecycleRecord,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Step> {
        let baseline = record
            .proposal
            .baseline_config
            .clone()
            .ok_or_else(|| missing(record, "baseline_config"))?;
        let plan = record.scenario_plan.ok_or_else(|| missing(record, "scenario_plan"))?;

        let trials = match self.sample(record.agent_id(), &baseline.parameters, &plan, cancel).await {
            Some(Ok(trials)) => trials,
            Some(Err(err)) => return Ok(Step::fail(TerminalReason::SamplerFatal, err.to_string())),
            None => return Ok(Step::Resolve(cancel_resolution())),
        };
        record.baseline_summary = Some(summarize(&trials));
        self.advance(record, ProposalState::Baselined).await
    }

    /// Baselined: resolve the delta and build the tentative candidate.
    async fn prepare_candidate(&self, record: &mut LifecycleRecord) -> Result<Step> {
        let baseline = record
            .proposal
            .baseline_config
            .clone()
            .ok_or_else(|| missing(record, "baseline_config"))?;
        let delta = match record.proposal.delta.clone() {
            Some(delta) => delta,
            None => self.propose_delta(&baseline).await?,
        };
        let candidate = delta.apply(&baseline.parameters, &self.config.bounds)?;
        if parameters_identical(&candidate, &baseline.parameters) {
            return Ok(Step::fail(
                TerminalReason::InvalidDelta,
                format!("{} leaves the configuration unchanged within bounds", delta.describe()),
            ));
        }
        debug!(delta = %delta.describe(), "candidate prepared");
        record.proposal.delta = Some(delta);
        record.proposal.candidate_config = Some(candidate);
        self.advance(record, ProposalState::Evaluating).await
    }

    async fn propose_delta(&self, baseline: &AgentConfiguration) -> Result<ParameterDelta> {
        let proposer = self
            .deps
            .proposer
            .as_ref()
            .ok_or_else(|| EngineError::NoProposer(baseline.agent_id.clone()))?;
        let history = self.patterns.list(&baseline.agent_id).await?;
        proposer.propose(baseline, &history)
    }

    async fn evaluate(
        &self,
        record: &mut LifecycleRecord,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Step> {
        let candidate = record
            .proposal
            .candidate_config
            .clone()
            .ok_or_else(|| missing(record, "candidate_config"))?;
        let baseline_summary = record
            .baseline_summary
            .ok_or_else(|| missing(record, "baseline_summary"))?;
        let plan = record.scenario_plan.ok_or_else(|| missing(record, "scenario_plan"))?;

        let trials = match self.sample(record.agent_id(), &candidate, &plan, cancel).await {
            Some(Ok(trials)) => trials,
            Some(Err(err)) => return Ok(Step::fail(TerminalReason::SamplerFatal, err.to_string())),
            None => return Ok(Step::Resolve(cancel_resolution())),
        };
        let candidate_summary = summarize(&trials);
        record.candidate_summary = Some(candidate_summary);

        match compare(&baseline_summary, &candidate_summary, &self.config.gate) {
            Ok(comparison) => {
                obs::emit_comparison_computed(record.proposal_id(), &comparison);
                record.comparison = Some(comparison);
                self.advance(record, ProposalState::Evaluated).await
            }
            Err(insufficient) => Ok(Step::fail(
                TerminalReason::InsufficientSample,
                insufficient.to_string(),
            )),
        }
    }

    /// Evaluated: reject, observe, escalate or commit.
    async fn decide(&self, record: &mut LifecycleRecord) -> Result<Step> {
        let comparison = record
            .comparison
            .clone()
            .ok_or_else(|| missing(record, "comparison"))?;
        if !comparison.significant {
            let detail = comparison
                .violations
                .iter()
                .map(|v| v.reason.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(Step::roll_back(TerminalReason::StatisticalRejection, Some(detail)));
        }
        if self.config.fleet.mode == Mode::ObserveOnly {
            return Ok(Step::roll_back(TerminalReason::ObservationOnly, None));
        }

        let (baseline, candidate) = self.baseline_and_candidate(record)?;
        let impact = impact_score(&baseline.parameters, &candidate);
        record.impact_score = Some(impact);
        if impact >= self.config.approval.impact_threshold {
            return self.escalate(record, impact).await;
        }
        self.commit(record).await
    }

    fn baseline_and_candidate(
        &self,
        record: &LifecycleRecord,
    ) -> Result<(AgentConfiguration, Parameters)> {
        let baseline = record
            .proposal
            .baseline_config
            .clone()
            .ok_or_else(|| missing(record, "baseline_config"))?;
        let candidate = record
            .proposal
            .candidate_config
            .clone()
            .ok_or_else(|| missing(record, "candidate_config"))?;
        Ok((baseline, candidate))
    }

    async fn escalate(&self, record: &mut LifecycleRecord, impact: f64) -> Result<Step> {
        let Some(channel) = self.deps.approval.clone() else {
            return Ok(Step::roll_back(
                TerminalReason::ApprovalUnavailable,
                Some(format!(
                    "impact {impact:.3} needs approval and no approval channel is configured"
                )),
            ));
        };
        // AwaitingApproval is durable before the request leaves the process.
        self.advance(record, ProposalState::AwaitingApproval).await?;
        self.submit_approval(record, channel.as_ref()).await
    }

    /// Submit (or resubmit) the approval request of an awaiting record.
    pub(crate) async fn submit_approval(
        &self,
        record: &mut LifecycleRecord,
        channel: &dyn ApprovalChannel,
    ) -> Result<Step> {
        let impact = record.impact_score.ok_or_else(|| missing(record, "impact_score"))?;
        let summary = ProposalSummary::from_record(record, impact, Utc::now())
            .ok_or_else(|| missing(record, "comparison"))?;
        let request_id = match channel.submit(&summary).await {
            Ok(id) => id,
            Err(err) => {
                return Ok(Step::roll_back(
                    TerminalReason::ApprovalUnavailable,
                    Some(err.to_string()),
                ))
            }
        };
        // The record names its request before the request can be resolved:
        // decisions find proposals only through the index.
        record.approval_request_id = Some(request_id.clone());
        record.updated_at = Utc::now();
        self.records.save(record).await?;
        self.records
            .index_approval(&request_id, record.proposal_id())
            .await?;

        // A decision may already have settled the proposal; its record wins.
        if let Some(latest) = self.records.load(record.proposal_id()).await? {
            if latest.is_terminal() {
                *record = latest;
                return Ok(Step::Suspend);
            }
        }

        METRICS.inc_approvals_requested();
        obs::emit_awaiting_approval(record.proposal_id(), &request_id, impact);
        self.events.publish_record(record);
        Ok(Step::Suspend)
    }

    /// Versioned write of the candidate, retried on storage faults.
    async fn commit(&self, record: &mut LifecycleRecord) -> Result<Step> {
        let (baseline, candidate) = self.baseline_and_candidate(record)?;
        let agent_id = record.agent_id().to_string();
        let attempts = self.config.commit.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self
                .configs
                .commit(&agent_id, baseline.version, candidate.clone(), Utc::now())
                .await
            {
                Ok(committed) => {
                    record.committed_version = Some(committed.version);
                    return Ok(Step::resolve(
                        ProposalState::Committed,
                        TerminalReason::Committed,
                        None,
                    ));
                }
                Err(err @ EngineError::StaleConfiguration { .. }) => {
                    // A previous attempt (or run, before a restart) may have
                    // landed even though its acknowledgement was lost.
                    if let Some(current) = self.configs.current(&agent_id).await? {
                        if current.version == baseline.version + 1
                            && parameters_identical(&current.parameters, &candidate)
                        {
                            record.committed_version = Some(current.version);
                            return Ok(Step::resolve(
                                ProposalState::Committed,
                                TerminalReason::Committed,
                                None,
                            ));
                        }
                    }
                    return Ok(Step::fail(TerminalReason::StaleConfiguration, err.to_string()));
                }
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "configuration commit failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.commit.retry_backoff()).await;
                    }
                }
            }
        }
        let detail = last_error.map(|e| e.to_string()).unwrap_or_default();
        Ok(Step::fail(
            TerminalReason::PersistenceFailure,
            format!("commit failed after {attempts} attempts: {detail}"),
        ))
    }

    /// Run the sampler under cancellation. `None` means cancelled.
    async fn sample(
        &self,
        agent_id: &str,
        parameters: &Parameters,
        plan: &ScenarioPlan,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<SamplerResult<Vec<TrialResult>>> {
        let run = async {
            let trials = self.deps.sampler.run(agent_id, parameters, plan).await?;
            ensure_complete(plan, trials)
        };
        tokio::select! {
            result = run => Some(result),
            _ = cancelled(cancel) => None,
        }
    }

    // -- terminal -----------------------------------------------------------

    async fn conclude(
        &self,
        mut record: LifecycleRecord,
        resolution: Resolution,
    ) -> Result<LifecycleRecord> {
        let from = record.state();
        record.resolve(resolution.state, resolution.reason, resolution.detail, Utc::now())?;
        obs::emit_stage_transition(record.proposal_id(), from, resolution.state);
        self.finish(record).await
    }

    async fn finish(&self, record: LifecycleRecord) -> Result<LifecycleRecord> {
        let proposal_id = record.proposal_id().to_string();
        let agent_id = record.agent_id().to_string();

        if let Some(pattern) = LearnedPattern::from_record(&record) {
            if let Err(err) = self.patterns.append(&agent_id, pattern).await {
                warn!(error = %err, "learned pattern not recorded");
            }
        }
        if let Err(err) = self.records.save(&record).await {
            error!(
                proposal_id = %proposal_id,
                error = %err,
                "terminal record not persisted; recovery will re-derive it"
            );
        }
        self.locks.release(&agent_id, &proposal_id);
        self.events.publish_record(&record);

        let reason = record.terminal_reason.unwrap_or(TerminalReason::Cancelled);
        match record.state() {
            ProposalState::Committed => {
                METRICS.inc_committed();
                obs::emit_committed(&proposal_id, &agent_id, record.committed_version.unwrap_or(0));
            }
            ProposalState::RolledBack => {
                METRICS.inc_rolled_back();
                obs::emit_rolled_back(&proposal_id, &agent_id, reason);
            }
            _ => {
                METRICS.inc_failed();
                obs::emit_failed(&proposal_id, &agent_id, reason, record.detail.as_deref());
            }
        }
        Ok(record)
    }

    // -- external resolution -----------------------------------------------

    /// Apply a reviewer decision to an awaiting proposal.
    ///
    /// A proposal that is already terminal is returned unchanged, so
    /// duplicate deliveries are harmless. Once the proposal is terminal its
    /// request is withdrawn from the approval channel.
    pub async fn resolve_approval(
        &self,
        proposal_id: &str,
        decision: Decision,
    ) -> Result<LifecycleRecord> {
        let record = self.settle_approval(proposal_id, decision).await?;
        if record.is_terminal() {
            self.withdraw_request(&record).await;
        }
        Ok(record)
    }

    async fn withdraw_request(&self, record: &LifecycleRecord) {
        if let (Some(channel), Some(request_id)) =
            (self.deps.approval.as_ref(), record.approval_request_id.as_deref())
        {
            if let Err(err) = channel.withdraw(request_id).await {
                warn!(request_id = %request_id, error = %err, "approval request not withdrawn");
            }
        }
    }

    async fn settle_approval(
        &self,
        proposal_id: &str,
        decision: Decision,
    ) -> Result<LifecycleRecord> {
        let mut record = self.records.require(proposal_id).await?;
        if record.is_terminal() {
            return Ok(record);
        }
        if record.state() != ProposalState::AwaitingApproval {
            return Err(EngineError::InvalidTransition {
                from: record.state(),
                to: match decision {
                    Decision::Approved => ProposalState::Committed,
                    Decision::Rejected => ProposalState::RolledBack,
                },
            });
        }
        let span = obs::proposal_span(record.proposal_id(), record.agent_id());
        async move {
            if decision == Decision::Rejected {
                return self
                    .conclude(
                        record,
                        Resolution {
                            state: ProposalState::RolledBack,
                            reason: TerminalReason::ApprovalRejected,
                            detail: None,
                        },
                    )
                    .await;
            }
            if let Err(held) = self.locks.try_acquire(record.agent_id(), record.proposal_id()) {
                let resolution = Resolution {
                    state: ProposalState::Failed,
                    reason: TerminalReason::LockContention,
                    detail: Some(held.to_string()),
                };
                return self.conclude(record, resolution).await;
            }
            let resolution = match self.commit(&mut record).await {
                Ok(Step::Resolve(resolution)) => resolution,
                Ok(_) => return Ok(record),
                Err(err) => Resolution {
                    state: ProposalState::Failed,
                    reason: failure_reason(&err),
                    detail: Some(err.to_string()),
                },
            };
            self.conclude(record, resolution).await
        }
        .instrument(span)
        .await
    }

    /// Roll back a non-terminal record that is not being driven, withdrawing
    /// its approval request if it has one.
    pub async fn cancel_idle(&self, record: LifecycleRecord) -> Result<LifecycleRecord> {
        if record.is_terminal() {
            return Ok(record);
        }
        self.withdraw_request(&record).await;
        let span = obs::proposal_span(record.proposal_id(), record.agent_id());
        self.conclude(record, cancel_resolution()).instrument(span).await
    }

    /// Resubmit the approval request of an awaiting record that never
    /// recorded a request id (crash between persist and submit).
    pub(crate) async fn resubmit_approval(&self, mut record: LifecycleRecord) -> Result<LifecycleRecord> {
        let span = obs::proposal_span(record.proposal_id(), record.agent_id());
        async move {
            let step = match self.deps.approval.clone() {
                Some(channel) => self.submit_approval(&mut record, channel.as_ref()).await,
                None => Ok(Step::roll_back(
                    TerminalReason::ApprovalUnavailable,
                    Some("no approval channel configured".to_string()),
                )),
            };
            match step {
                Ok(Step::Resolve(resolution)) => self.conclude(record, resolution).await,
                Ok(_) => Ok(record),
                Err(err) => {
                    let resolution = Resolution {
                        state: ProposalState::Failed,
                        reason: failure_reason(&err),
                        detail: Some(err.to_string()),
                    };
                    self.conclude(record, resolution).await
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn cancel_resolution() -> Resolution {
    Resolution {
        state: ProposalState::RolledBack,
        reason: TerminalReason::Cancelled,
        detail: Some("cancelled".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::MemoryApprovalChannel;
    use crate::sampler::{SamplerError, ScriptedSampler};
    use tunegate_state::fakes::MemoryKvStore;

    struct Harness {
        orchestrator: Orchestrator,
        sampler: Arc<ScriptedSampler>,
    }

    fn harness(config: EngineConfig, approval: Option<Arc<MemoryApprovalChannel>>) -> Harness {
        let sampler = Arc::new(ScriptedSampler::new());
        let mut deps = EngineDeps::new(
            Arc::new(MemoryKvStore::new()),
            Arc::clone(&sampler) as Arc<dyn Sampler>,
        );
        if let Some(channel) = approval {
            deps = deps.with_approval(channel);
        }
        Harness {
            orchestrator: Orchestrator::new(config, deps),
            sampler,
        }
    }

    fn small_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.sampler.scenario_count = 150;
        config.commit.retry_backoff_ms = 1;
        config
    }

    async fn register(h: &Harness) {
        h.orchestrator
            .configs()
            .register("scout", Parameters::from([("temperature".to_string(), 1.0)]))
            .await
            .unwrap();
    }

    fn request(amount: f64) -> EnhancementRequest {
        EnhancementRequest::new("scout").with_delta(ParameterDelta::new().with("temperature", amount))
    }

    #[tokio::test]
    async fn test_significant_low_impact_commits() {
        let h = harness(small_config(), None);
        register(&h).await;
        h.sampler.push_moments(150, 150.0, 30.0).push_moments(150, 172.0, 32.0);

        let record = h.orchestrator.create(request(0.1)).await.unwrap();
        let done = h.orchestrator.drive(record, never_cancelled()).await.unwrap();

        assert_eq!(done.state(), ProposalState::Committed);
        assert_eq!(done.committed_version, Some(2));
        assert!(done.verify_integrity().is_ok());
        assert!(h.orchestrator.locks().holder("scout").is_none());
        let current = h.orchestrator.configs().require("scout").await.unwrap();
        assert_eq!(current.parameters["temperature"], 1.1);
    }

    #[tokio::test]
    async fn test_sampler_fatal_fails_without_config_change() {
        let h = harness(small_config(), None);
        register(&h).await;
        h.sampler.push_error(SamplerError::Fatal("runtime down".into()));

        let record = h.orchestrator.create(request(0.1)).await.unwrap();
        let done = h.orchestrator.drive(record, never_cancelled()).await.unwrap();

        assert_eq!(done.state(), ProposalState::Failed);
        assert_eq!(done.terminal_reason, Some(TerminalReason::SamplerFatal));
        assert_eq!(done.restored_config.as_ref().map(|c| c.version), Some(1));
        assert_eq!(h.orchestrator.configs().require("scout").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_wrong_trial_count_is_fatal() {
        let h = harness(small_config(), None);
        register(&h).await;
        h.sampler.push_moments(149, 150.0, 30.0);

        let record = h.orchestrator.create(request(0.1)).await.unwrap();
        let done = h.orchestrator.drive(record, never_cancelled()).await.unwrap();
        assert_eq!(done.terminal_reason, Some(TerminalReason::SamplerFatal));
    }

    #[tokio::test]
    async fn test_unknown_agent_and_bad_delta_fail_early() {
        let h = harness(small_config(), None);
        let record = h.orchestrator.create(request(0.1)).await.unwrap();
        let done = h.orchestrator.drive(record, never_cancelled()).await.unwrap();
        assert_eq!(done.terminal_reason, Some(TerminalReason::AgentNotFound));

        register(&h).await;
        let bad = EnhancementRequest::new("scout").with_delta(ParameterDelta::new().with("nope", 1.0));
        let record = h.orchestrator.create(bad).await.unwrap();
        let done = h.orchestrator.drive(record, never_cancelled()).await.unwrap();
        assert_eq!(done.terminal_reason, Some(TerminalReason::InvalidDelta));
        assert_eq!(h.sampler.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_delta_without_proposer_is_invalid() {
        let h = harness(small_config(), None);
        register(&h).await;
        h.sampler.push_moments(150, 150.0, 30.0);

        let record = h.orchestrator.create(EnhancementRequest::new("scout")).await.unwrap();
        let done = h.orchestrator.drive(record, never_cancelled()).await.unwrap();
        assert_eq!(done.terminal_reason, Some(TerminalReason::InvalidDelta));
        assert!(done.detail.unwrap_or_default().contains("no proposer"));
    }

    #[tokio::test]
    async fn test_high_impact_without_channel_rolls_back() {
        let h = harness(small_config(), None);
        register(&h).await;
        h.sampler.push_moments(150, 150.0, 30.0).push_moments(150, 172.0, 32.0);

        let record = h.orchestrator.create(request(0.6)).await.unwrap();
        let done = h.orchestrator.drive(record, never_cancelled()).await.unwrap();
        assert_eq!(done.state(), ProposalState::RolledBack);
        assert_eq!(done.terminal_reason, Some(TerminalReason::ApprovalUnavailable));
    }

    #[tokio::test]
    async fn test_escalation_then_decisions() {
        let channel = Arc::new(MemoryApprovalChannel::new());
        let h = harness(small_config(), Some(Arc::clone(&channel)));
        register(&h).await;
        h.sampler.push_moments(150, 150.0, 30.0).push_moments(150, 172.0, 32.0);

        let record = h.orchestrator.create(request(0.6)).await.unwrap();
        let pid = record.proposal_id().to_string();
        let awaiting = h.orchestrator.drive(record, never_cancelled()).await.unwrap();
        assert_eq!(awaiting.state(), ProposalState::AwaitingApproval);
        assert_eq!(awaiting.approval_request_id.as_deref(), Some(format!("apr-{pid}").as_str()));
        assert_eq!(channel.pending().len(), 1);
        assert_eq!(h.orchestrator.locks().holder("scout").as_deref(), Some(pid.as_str()));

        let done = h
            .orchestrator
            .resolve_approval(&pid, Decision::Approved)
            .await
            .unwrap();
        assert_eq!(done.state(), ProposalState::Committed);
        assert_eq!(h.orchestrator.configs().require("scout").await.unwrap().version, 2);
        assert!(channel.pending().is_empty());

        let again = h
            .orchestrator
            .resolve_approval(&pid, Decision::Rejected)
            .await
            .unwrap();
        assert_eq!(again, done);
    }

    #[tokio::test]
    async fn test_decision_for_non_awaiting_record_is_rejected() {
        let h = harness(small_config(), None);
        register(&h).await;
        let record = h.orchestrator.create(request(0.1)).await.unwrap();
        let err = h
            .orchestrator
            .resolve_approval(record.proposal_id(), Decision::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_commit_detects_concurrent_commit() {
        let h = harness(small_config(), None);
        register(&h).await;
        h.sampler.push_moments(150, 150.0, 30.0).push_moments(150, 172.0, 32.0);

        let mut record = h.orchestrator.create(request(0.1)).await.unwrap();
        h.orchestrator.start(&mut record).await.unwrap();
        // Another writer commits while the proposal is measuring.
        h.orchestrator
            .configs()
            .commit(
                "scout",
                1,
                Parameters::from([("temperature".to_string(), 5.0)]),
                Utc::now(),
            )
            .await
            .unwrap();

        let done = h.orchestrator.drive(record, never_cancelled()).await.unwrap();
        assert_eq!(done.terminal_reason, Some(TerminalReason::StaleConfiguration));
        assert_eq!(
            h.orchestrator.configs().require("scout").await.unwrap().parameters["temperature"],
            5.0
        );
    }
}
