//! Restart recovery from persisted lifecycle records.

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{big_step, config, params, small_step, FleetBuilder, AGENT};
use tunegate_core::{
    compare, request_id_for, Decision, FleetCoordinator, GateThresholds, LifecycleRecord,
    MemoryApprovalChannel, PerformanceSummary, ProposalState, ScenarioPlan, ScriptedSampler,
    TerminalReason,
};
use tunegate_state::{FsKvStore, KvStore};

/// A record persisted as if the process died right after `state`.
async fn persisted_in(fleet: &FleetCoordinator, id: &str, state: ProposalState) -> LifecycleRecord {
    let orchestrator = fleet.orchestrator();
    let now = Utc::now();
    let mut record = LifecycleRecord::new(id, small_step(), now);
    record.proposal.baseline_config = Some(fleet.configuration(AGENT).await.unwrap());
    record.scenario_plan = Some(ScenarioPlan::for_proposal(id, 150));

    let path = [
        ProposalState::Baselining,
        ProposalState::Baselined,
        ProposalState::Evaluating,
        ProposalState::Evaluated,
        ProposalState::AwaitingApproval,
    ];
    for next in path {
        if record.state() == state {
            break;
        }
        record.transition(next, None, now).unwrap();
        match next {
            ProposalState::Baselined => {
                record.baseline_summary = Some(PerformanceSummary::from_moments(150, 150.0, 30.0));
            }
            ProposalState::Evaluating => {
                record.proposal.candidate_config = Some(params(1.1));
            }
            ProposalState::Evaluated => {
                let candidate = PerformanceSummary::from_moments(150, 172.0, 32.0);
                record.candidate_summary = Some(candidate);
                record.comparison = Some(
                    compare(
                        record.baseline_summary.as_ref().unwrap(),
                        &candidate,
                        &GateThresholds::default(),
                    )
                    .unwrap(),
                );
            }
            ProposalState::AwaitingApproval => record.impact_score = Some(0.1),
            _ => {}
        }
    }
    orchestrator.records().save(&record).await.unwrap();
    record
}

#[tokio::test]
async fn awaiting_approval_survives_restart_and_rejection_restores_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(FsKvStore::new(dir.path()).unwrap());

    let sampler = Arc::new(ScriptedSampler::new());
    sampler.push_moments(150, 150.0, 30.0).push_moments(150, 172.0, 32.0);
    let first = FleetBuilder::new(config(150))
        .kv(kv)
        .approval(Arc::new(MemoryApprovalChannel::new()))
        .build(sampler)
        .await;
    let awaiting = first.run(big_step()).await.unwrap();
    assert_eq!(awaiting.state(), ProposalState::AwaitingApproval);
    let proposal_id = awaiting.proposal_id().to_string();
    let request_id = awaiting.approval_request_id.clone().unwrap();
    drop(first);

    // Fresh process over the same directory.
    let kv: Arc<dyn KvStore> = Arc::new(FsKvStore::new(dir.path()).unwrap());
    let second = FleetBuilder::new(config(150))
        .kv(kv)
        .approval(Arc::new(MemoryApprovalChannel::new()))
        .build(Arc::new(ScriptedSampler::new()))
        .await;
    let report = second.recover().await.unwrap();
    assert_eq!(report.awaiting, vec![proposal_id.clone()]);
    assert!(report.resumed.is_empty());
    assert_eq!(
        second.orchestrator().locks().holder(AGENT).as_deref(),
        Some(proposal_id.as_str())
    );

    // The recovered lock still excludes new work on the agent.
    let blocked = second.run(small_step()).await.unwrap();
    assert_eq!(blocked.terminal_reason, Some(TerminalReason::LockContention));

    let done = second.on_decision(&request_id, Decision::Rejected).await.unwrap();
    assert_eq!(done.state(), ProposalState::RolledBack);
    assert_eq!(done.terminal_reason, Some(TerminalReason::ApprovalRejected));
    let current = second.configuration(AGENT).await.unwrap();
    assert_eq!(current.version, 1);
    assert_eq!(current.parameters, params(1.0));
    assert_eq!(done.restored_config.as_ref(), Some(&current));
    assert!(second.orchestrator().locks().holder(AGENT).is_none());
}

#[tokio::test]
async fn baselined_record_resumes_without_resampling_baseline() {
    let sampler = Arc::new(ScriptedSampler::new());
    sampler.push_moments(150, 172.0, 32.0);
    let fleet = FleetBuilder::new(config(150)).build(sampler.clone()).await;
    persisted_in(&fleet, "prop-resume", ProposalState::Baselined).await;

    let report = fleet.recover().await.unwrap();
    assert_eq!(report.resumed, vec!["prop-resume".to_string()]);

    let done = fleet.wait("prop-resume").await.unwrap();
    assert_eq!(done.state(), ProposalState::Committed);
    assert_eq!(sampler.calls(), 1);
    assert_eq!(fleet.configuration(AGENT).await.unwrap().version, 2);
}

#[tokio::test]
async fn commit_that_landed_before_crash_is_not_repeated() {
    let sampler = Arc::new(ScriptedSampler::new());
    let fleet = FleetBuilder::new(config(150)).build(sampler.clone()).await;
    persisted_in(&fleet, "prop-landed", ProposalState::Evaluated).await;
    // The configuration write happened; the record save did not.
    fleet
        .orchestrator()
        .configs()
        .commit(AGENT, 1, params(1.1), Utc::now())
        .await
        .unwrap();

    fleet.recover().await.unwrap();
    let done = fleet.wait("prop-landed").await.unwrap();

    assert_eq!(done.state(), ProposalState::Committed);
    assert_eq!(done.committed_version, Some(2));
    assert_eq!(fleet.configuration(AGENT).await.unwrap().version, 2);
    assert_eq!(sampler.calls(), 0);
}

#[tokio::test]
async fn awaiting_record_without_request_is_resubmitted() {
    let channel = Arc::new(MemoryApprovalChannel::new());
    let fleet = FleetBuilder::new(config(150))
        .approval(channel.clone())
        .build(Arc::new(ScriptedSampler::new()))
        .await;
    persisted_in(&fleet, "prop-lost", ProposalState::AwaitingApproval).await;

    let report = fleet.recover().await.unwrap();
    assert_eq!(report.resubmitted, vec!["prop-lost".to_string()]);
    assert_eq!(channel.pending().len(), 1);

    let record = fleet.record("prop-lost").await.unwrap();
    assert_eq!(record.state(), ProposalState::AwaitingApproval);
    assert_eq!(record.approval_request_id, Some(request_id_for("prop-lost")));
}

#[tokio::test]
async fn second_recovery_pass_is_idempotent() {
    let channel = Arc::new(MemoryApprovalChannel::new());
    let fleet = FleetBuilder::new(config(150))
        .approval(channel.clone())
        .build(Arc::new(ScriptedSampler::new()))
        .await;
    persisted_in(&fleet, "prop-lost", ProposalState::AwaitingApproval).await;

    fleet.recover().await.unwrap();
    let again = fleet.recover().await.unwrap();
    assert_eq!(again.awaiting, vec!["prop-lost".to_string()]);
    assert!(again.resubmitted.is_empty());
    assert_eq!(channel.pending().len(), 1);
}

#[tokio::test]
async fn nothing_to_recover_on_a_clean_store() {
    let fleet = FleetBuilder::new(config(150))
        .build(Arc::new(ScriptedSampler::new()))
        .await;
    assert!(fleet.recover().await.unwrap().is_empty());
}
