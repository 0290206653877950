//! Structured observability hooks for proposal lifecycles.
//!
//! - [`proposal_span`]: the span a lifecycle task runs inside
//! - `emit_*`: one `info!`/`warn!` event per lifecycle milestone
//!
//! Verbosity follows `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{info, warn};

use crate::domain::{ProposalState, TerminalReason};
use crate::stats::StatisticalComparison;

/// Span tagged with the proposal and agent ids.
///
/// A lifecycle crosses await points, so attach it with
/// [`tracing::Instrument::instrument`] rather than entering it.
pub fn proposal_span(proposal_id: &str, agent_id: &str) -> tracing::Span {
    tracing::info_span!("tunegate.proposal", proposal_id = %proposal_id, agent_id = %agent_id)
}

pub fn emit_proposal_started(proposal_id: &str, agent_id: &str) {
    info!(event = "proposal.started", proposal_id = %proposal_id, agent_id = %agent_id);
}

pub fn emit_stage_transition(proposal_id: &str, from: ProposalState, to: ProposalState) {
    info!(
        event = "proposal.transition",
        proposal_id = %proposal_id,
        from = %from,
        to = %to,
    );
}

pub fn emit_comparison_computed(proposal_id: &str, comparison: &StatisticalComparison) {
    info!(
        event = "comparison.computed",
        proposal_id = %proposal_id,
        p_value = comparison.p_value,
        effect_size = comparison.effect_size,
        improvement_pct = comparison.improvement_pct,
        significant = comparison.significant,
        violations = comparison.violations.len(),
    );
}

pub fn emit_committed(proposal_id: &str, agent_id: &str, version: u64) {
    info!(
        event = "proposal.committed",
        proposal_id = %proposal_id,
        agent_id = %agent_id,
        version = version,
    );
}

pub fn emit_rolled_back(proposal_id: &str, agent_id: &str, reason: TerminalReason) {
    info!(
        event = "proposal.rolled_back",
        proposal_id = %proposal_id,
        agent_id = %agent_id,
        reason = %reason,
    );
}

/// Failures are warnings: they usually need operator attention.
pub fn emit_failed(proposal_id: &str, agent_id: &str, reason: TerminalReason, detail: Option<&str>) {
    warn!(
        event = "proposal.failed",
        proposal_id = %proposal_id,
        agent_id = %agent_id,
        reason = %reason,
        detail = detail.unwrap_or(""),
    );
}

pub fn emit_awaiting_approval(proposal_id: &str, request_id: &str, impact_score: f64) {
    info!(
        event = "proposal.awaiting_approval",
        proposal_id = %proposal_id,
        request_id = %request_id,
        impact_score = impact_score,
    );
}

pub fn emit_recovery_resumed(proposal_id: &str, state: ProposalState) {
    info!(event = "recovery.resumed", proposal_id = %proposal_id, state = %state);
}
