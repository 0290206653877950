//! Process-global counters for the validation engine.
//!
//! Counters are incremented at the call site without logging at `info`.
//! Call [`Metrics::flush`] at a natural boundary (end of a CLI command,
//! after recovery) to emit every value as one `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    proposals_started: AtomicU64,
    proposals_committed: AtomicU64,
    proposals_rolled_back: AtomicU64,
    proposals_failed: AtomicU64,
    trials_executed: AtomicU64,
    approvals_requested: AtomicU64,
    recoveries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            proposals_started: AtomicU64::new(0),
            proposals_committed: AtomicU64::new(0),
            proposals_rolled_back: AtomicU64::new(0),
            proposals_failed: AtomicU64::new(0),
            trials_executed: AtomicU64::new(0),
            approvals_requested: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_proposals_started(&self) {
        Self::bump(&self.proposals_started, "proposals_started");
    }

    pub fn inc_committed(&self) {
        Self::bump(&self.proposals_committed, "proposals_committed");
    }

    pub fn inc_rolled_back(&self) {
        Self::bump(&self.proposals_rolled_back, "proposals_rolled_back");
    }

    pub fn inc_failed(&self) {
        Self::bump(&self.proposals_failed, "proposals_failed");
    }

    pub fn inc_trials_executed(&self) {
        Self::bump(&self.trials_executed, "trials_executed");
    }

    pub fn inc_approvals_requested(&self) {
        Self::bump(&self.approvals_requested, "approvals_requested");
    }

    pub fn inc_recoveries(&self) {
        Self::bump(&self.recoveries, "recoveries");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            proposals_started = self.proposals_started(),
            proposals_committed = self.proposals_committed(),
            proposals_rolled_back = self.proposals_rolled_back(),
            proposals_failed = self.proposals_failed(),
            trials_executed = self.trials_executed(),
            approvals_requested = self.approvals_requested(),
            recoveries = self.recoveries(),
        );
    }

    pub fn proposals_started(&self) -> u64 {
        self.proposals_started.load(Ordering::Relaxed)
    }

    pub fn proposals_committed(&self) -> u64 {
        self.proposals_committed.load(Ordering::Relaxed)
    }

    pub fn proposals_rolled_back(&self) -> u64 {
        self.proposals_rolled_back.load(Ordering::Relaxed)
    }

    pub fn proposals_failed(&self) -> u64 {
        self.proposals_failed.load(Ordering::Relaxed)
    }

    pub fn trials_executed(&self) -> u64 {
        self.trials_executed.load(Ordering::Relaxed)
    }

    pub fn approvals_requested(&self) -> u64 {
        self.approvals_requested.load(Ordering::Relaxed)
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.proposals_started,
            &self.proposals_committed,
            &self.proposals_rolled_back,
            &self.proposals_failed,
            &self.trials_executed,
            &self.approvals_requested,
            &self.recoveries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
