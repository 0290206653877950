//! Restart recovery.
//!
//! Re-derives the next action of every non-terminal lifecycle record:
//!
//! 1. records past `Created` re-take their agent locks (oldest first)
//! 2. `AwaitingApproval` records stay suspended; a record that never got a
//!    request id has its approval request resubmitted
//! 3. everything else is handed back to be driven from its persisted state
//!
//! Completed stages are not re-run: a record in `Evaluating` keeps its
//! baseline summary and only re-samples the candidate.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{LifecycleRecord, ProposalState, Result, TerminalReason};
use crate::lifecycle::Orchestrator;
use crate::metrics::METRICS;
use crate::obs;

/// What recovery found and did, by proposal id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Handed back to be driven.
    pub resumed: Vec<String>,
    /// Still waiting for a decision on an existing request.
    pub awaiting: Vec<String>,
    /// Approval request submitted again.
    pub resubmitted: Vec<String>,
    /// Resolved during recovery (lock conflict, approval unavailable).
    pub resolved: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.resumed.is_empty()
            && self.awaiting.is_empty()
            && self.resubmitted.is_empty()
            && self.resolved.is_empty()
    }
}

pub struct RecoveryPlan {
    pub report: RecoveryReport,
    /// Records to drive, oldest first.
    pub to_drive: Vec<LifecycleRecord>,
}

/// Plan recovery of every non-terminal record not listed in `in_flight`.
pub async fn plan_recovery(
    orchestrator: &Orchestrator,
    in_flight: &HashSet<String>,
) -> Result<RecoveryPlan> {
    let mut records = orchestrator.records().list_non_terminal().await?;
    records.retain(|r| !in_flight.contains(r.proposal_id()));

    let mut report = RecoveryReport::default();
    let mut to_drive = Vec::new();

    for record in records {
        let proposal_id = record.proposal_id().to_string();

        if record.state() != ProposalState::Created {
            if let Err(held) = orchestrator
                .locks()
                .try_acquire(record.agent_id(), &proposal_id)
            {
                warn!(proposal_id = %proposal_id, holder = %held.holder, "conflicting lifecycle found during recovery");
                orchestrator
                    .reject(record, TerminalReason::LockContention, held.to_string())
                    .await?;
                report.resolved.push(proposal_id);
                continue;
            }
        }

        METRICS.inc_recoveries();
        obs::emit_recovery_resumed(&proposal_id, record.state());

        match (record.state(), record.approval_request_id.as_deref()) {
            (ProposalState::AwaitingApproval, Some(request_id)) => {
                // The index write may not have followed the record save.
                orchestrator
                    .records()
                    .index_approval(request_id, &proposal_id)
                    .await?;
                report.awaiting.push(proposal_id);
            }
            (ProposalState::AwaitingApproval, None) => {
                let record = orchestrator.resubmit_approval(record).await?;
                if record.is_terminal() {
                    report.resolved.push(proposal_id);
                } else {
                    report.resubmitted.push(proposal_id);
                }
            }
            _ => {
                report.resumed.push(proposal_id);
                to_drive.push(record);
            }
        }
    }

    info!(
        resumed = report.resumed.len(),
        awaiting = report.awaiting.len(),
        resubmitted = report.resubmitted.len(),
        resolved = report.resolved.len(),
        "recovery planned"
    );
    Ok(RecoveryPlan { report, to_drive })
}
