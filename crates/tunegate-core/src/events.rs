//! Lifecycle events for external subscribers.
//!
//! Every terminal state and every escalation produces one
//! [`EnhancementEvent`] on the fleet's broadcast channel. Delivery is best
//! effort: a lagging subscriber loses the oldest events, and the durable
//! record of what happened is the [`LifecycleRecord`] itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::{LifecycleRecord, ProposalState, TerminalReason};
use crate::stats::StatisticalComparison;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Committed,
    RolledBack,
    Failed,
    AwaitingApproval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementEvent {
    pub kind: EventKind,
    pub proposal_id: String,
    pub agent_id: String,
    pub comparison: Option<StatisticalComparison>,
    pub reason: Option<TerminalReason>,
    pub at: DateTime<Utc>,
}

impl EnhancementEvent {
    /// Event describing the current state of `record`, if that state is one
    /// subscribers hear about.
    pub fn from_record(record: &LifecycleRecord) -> Option<Self> {
        let kind = match record.state() {
            ProposalState::Committed => EventKind::Committed,
            ProposalState::RolledBack => EventKind::RolledBack,
            ProposalState::Failed => EventKind::Failed,
            ProposalState::AwaitingApproval => EventKind::AwaitingApproval,
            _ => return None,
        };
        Some(Self {
            kind,
            proposal_id: record.proposal_id().to_string(),
            agent_id: record.agent_id().to_string(),
            comparison: record.comparison.clone(),
            reason: record.terminal_reason,
            at: record.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EnhancementEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnhancementEvent> {
        self.tx.subscribe()
    }

    pub fn publish_record(&self, record: &LifecycleRecord) {
        if let Some(event) = EnhancementEvent::from_record(record) {
            // No subscribers is not an error.
            let _ = self.tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EnhancementRequest;

    #[tokio::test]
    async fn test_only_reportable_states_publish() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let mut record = LifecycleRecord::new("p-1", EnhancementRequest::new("scout"), Utc::now());

        bus.publish_record(&record);
        record
            .resolve(ProposalState::Failed, TerminalReason::SamplerFatal, None, Utc::now())
            .unwrap();
        bus.publish_record(&record);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Failed);
        assert_eq!(event.reason, Some(TerminalReason::SamplerFatal));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(1);
        let record = LifecycleRecord::new("p-1", EnhancementRequest::new("scout"), Utc::now());
        bus.publish_record(&record);
    }
}
