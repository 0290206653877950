//! Fleet coordinator.
//!
//! Runs lifecycles for many agents as independent tokio tasks under a global
//! concurrency cap, with one non-terminal proposal per agent. A proposal
//! waiting for approval gives its execution slot back but keeps its agent
//! lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Semaphore};
use tracing::{error, info};

use crate::approval::Decision;
use crate::config::{BusyPolicy, EngineConfig, Mode};
use crate::domain::{
    AgentConfiguration, EngineError, EnhancementRequest, LifecycleRecord, Parameters,
    ProposalState, Result, TerminalReason,
};
use crate::events::EnhancementEvent;
use crate::lifecycle::{cancelled, EngineDeps, Orchestrator};
use crate::recovery::{plan_recovery, RecoveryReport};
use crate::store::LifecycleStore;

type Done = watch::Receiver<Option<LifecycleRecord>>;

struct Running {
    cancel: watch::Sender<bool>,
    done: Done,
}

struct Inner {
    orchestrator: Orchestrator,
    permits: Arc<Semaphore>,
    running: Mutex<HashMap<String, Running>>,
    /// Serializes decisions and cancellations of suspended proposals.
    settle: tokio::sync::Mutex<()>,
}

/// Cheap to clone; clones share the same fleet.
#[derive(Clone)]
pub struct FleetCoordinator {
    inner: Arc<Inner>,
}

/// Handle to a submitted proposal.
pub struct ProposalHandle {
    pub proposal_id: String,
    pub agent_id: String,
    done: Done,
    records: LifecycleStore,
}

impl ProposalHandle {
    /// Wait until the proposal is terminal or suspended awaiting approval.
    pub async fn wait(self) -> Result<LifecycleRecord> {
        wait_done(self.done, &self.records, &self.proposal_id).await
    }
}

async fn wait_done(mut done: Done, records: &LifecycleStore, proposal_id: &str) -> Result<LifecycleRecord> {
    loop {
        let settled = done.borrow_and_update().clone();
        if let Some(record) = settled {
            return Ok(record);
        }
        if done.changed().await.is_err() {
            let last = done.borrow().clone();
            if let Some(record) = last {
                return Ok(record);
            }
            // The task ended without a record; the store has the last state.
            return records.require(proposal_id).await;
        }
    }
}

/// Aggregate outcome counts across all recorded proposals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetStats {
    pub submitted: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub failed: usize,
    pub awaiting_approval: usize,
    pub in_progress: usize,
    #[serde(skip)]
    improvement_sum: f64,
}

impl FleetStats {
    fn concluded(&self) -> usize {
        self.committed + self.rolled_back + self.failed
    }

    fn ratio(part: usize, whole: usize) -> f64 {
        if whole == 0 {
            0.0
        } else {
            part as f64 / whole as f64
        }
    }

    /// Share of concluded proposals that committed.
    pub fn commit_rate(&self) -> f64 {
        Self::ratio(self.committed, self.concluded())
    }

    /// Share of concluded proposals that rolled back.
    pub fn rejection_rate(&self) -> f64 {
        Self::ratio(self.rolled_back, self.concluded())
    }

    /// Mean relative improvement of committed proposals.
    pub fn average_improvement(&self) -> f64 {
        if self.committed == 0 {
            0.0
        } else {
            self.improvement_sum / self.committed as f64
        }
    }

    fn add(&mut self, record: &LifecycleRecord) {
        self.submitted += 1;
        match record.state() {
            ProposalState::Committed => {
                self.committed += 1;
                self.improvement_sum += record
                    .comparison
                    .as_ref()
                    .map(|c| c.improvement_pct)
                    .unwrap_or(0.0);
            }
            ProposalState::RolledBack => self.rolled_back += 1,
            ProposalState::Failed => self.failed += 1,
            ProposalState::AwaitingApproval => self.awaiting_approval += 1,
            _ => self.in_progress += 1,
        }
    }
}

impl FleetCoordinator {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Result<Self> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.fleet.max_concurrent));
        Ok(Self {
            inner: Arc::new(Inner {
                orchestrator: Orchestrator::new(config, deps),
                permits,
                running: Mutex::new(HashMap::new()),
                settle: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    pub fn config(&self) -> &EngineConfig {
        self.inner.orchestrator.config()
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, Running>> {
        self.inner.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finished_handle(&self, record: LifecycleRecord) -> ProposalHandle {
        let proposal_id = record.proposal_id().to_string();
        let agent_id = record.agent_id().to_string();
        let (_tx, done) = watch::channel(Some(record));
        ProposalHandle {
            proposal_id,
            agent_id,
            done,
            records: self.orchestrator().records().clone(),
        }
    }

    // -- submission ---------------------------------------------------------

    /// Accept a request and start its lifecycle.
    ///
    /// Lifecycle outcomes, including a busy agent or a paused fleet, are
    /// reported through the record the handle resolves to. `Err` means the
    /// request could not even be recorded.
    pub async fn submit(&self, request: EnhancementRequest) -> Result<ProposalHandle> {
        let orchestrator = self.orchestrator();
        let record = orchestrator.create(request).await?;

        if self.config().fleet.mode == Mode::Paused {
            let record = orchestrator
                .reject(record, TerminalReason::FleetPaused, "fleet is paused")
                .await?;
            return Ok(self.finished_handle(record));
        }
        if self.config().fleet.busy_policy == BusyPolicy::Reject {
            // Admission is decided here, in submission order.
            if let Err(held) = orchestrator
                .locks()
                .try_acquire(record.agent_id(), record.proposal_id())
            {
                let record = orchestrator
                    .reject(record, TerminalReason::LockContention, held.to_string())
                    .await?;
                return Ok(self.finished_handle(record));
            }
        }
        Ok(self.spawn_lifecycle(record))
    }

    pub async fn submit_batch(
        &self,
        requests: impl IntoIterator<Item = EnhancementRequest>,
    ) -> Result<Vec<ProposalHandle>> {
        let mut handles = Vec::new();
        for request in requests {
            handles.push(self.submit(request).await?);
        }
        Ok(handles)
    }

    /// Submit and wait.
    pub async fn run(&self, request: EnhancementRequest) -> Result<LifecycleRecord> {
        self.submit(request).await?.wait().await
    }

    fn spawn_lifecycle(&self, record: LifecycleRecord) -> ProposalHandle {
        let proposal_id = record.proposal_id().to_string();
        let agent_id = record.agent_id().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(None);
        self.running().insert(
            proposal_id.clone(),
            Running {
                cancel: cancel_tx,
                done: done_rx.clone(),
            },
        );

        let fleet = self.clone();
        tokio::spawn(async move { fleet.execute(record, cancel_rx, done_tx).await });

        ProposalHandle {
            proposal_id,
            agent_id,
            done: done_rx,
            records: self.orchestrator().records().clone(),
        }
    }

    async fn execute(
        self,
        record: LifecycleRecord,
        mut cancel: watch::Receiver<bool>,
        done: watch::Sender<Option<LifecycleRecord>>,
    ) {
        let orchestrator = self.orchestrator();
        let proposal_id = record.proposal_id().to_string();
        let agent_id = record.agent_id().to_string();

        let mut admitted = true;
        if self.config().fleet.busy_policy == BusyPolicy::Queue
            && record.state() == ProposalState::Created
        {
            admitted = orchestrator
                .locks()
                .acquire_queued(&agent_id, &proposal_id, &mut cancel)
                .await;
        }

        let permit = if admitted {
            let permits = Arc::clone(&self.inner.permits);
            tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                _ = cancelled(&mut cancel) => None,
            }
        } else {
            None
        };

        let outcome = match permit {
            Some(permit) => {
                let outcome = orchestrator.drive(record, cancel).await;
                drop(permit);
                outcome
            }
            None => orchestrator.cancel_idle(record).await,
        };

        match outcome {
            Ok(record) => {
                let _ = done.send(Some(record));
            }
            Err(err) => {
                error!(proposal_id = %proposal_id, error = %err, "lifecycle task ended with an error");
            }
        }
        self.running().remove(&proposal_id);
    }

    // -- decisions and cancellation -----------------------------------------

    /// Deliver a reviewer decision. Duplicate decisions for a terminal
    /// proposal return its record unchanged.
    pub async fn on_decision(&self, request_id: &str, decision: Decision) -> Result<LifecycleRecord> {
        let proposal_id = self
            .orchestrator()
            .records()
            .resolve_approval(request_id)
            .await?
            .ok_or_else(|| EngineError::ApprovalRequestNotFound(request_id.to_string()))?;
        let _settle = self.inner.settle.lock().await;
        info!(request_id = %request_id, proposal_id = %proposal_id, decision = %decision, "approval decision received");
        self.orchestrator()
            .resolve_approval(&proposal_id, decision)
            .await
    }

    /// Cancel a proposal before it commits.
    ///
    /// Returns [`EngineError::AlreadyCommitted`] for a committed proposal and
    /// any other terminal record unchanged.
    pub async fn cancel(&self, proposal_id: &str) -> Result<LifecycleRecord> {
        let orchestrator = self.orchestrator();
        let record = orchestrator.records().require(proposal_id).await?;
        if record.state() == ProposalState::Committed {
            return Err(EngineError::AlreadyCommitted(proposal_id.to_string()));
        }
        if record.is_terminal() {
            return Ok(record);
        }

        let in_flight = {
            let running = self.running();
            running.get(proposal_id).map(|r| {
                let _ = r.cancel.send(true);
                r.done.clone()
            })
        };
        let record = match in_flight {
            Some(done) => wait_done(done, orchestrator.records(), proposal_id).await?,
            None => record,
        };

        let _settle = self.inner.settle.lock().await;
        // Re-read: a decision may have landed while waiting.
        let record = orchestrator.records().load(proposal_id).await?.unwrap_or(record);
        match record.state() {
            ProposalState::Committed => Err(EngineError::AlreadyCommitted(proposal_id.to_string())),
            _ if record.is_terminal() => Ok(record),
            _ => orchestrator.cancel_idle(record).await,
        }
    }

    // -- recovery -----------------------------------------------------------

    /// Resume every non-terminal proposal found in the store.
    ///
    /// Call once at startup, before new submissions. Resumed proposals run in
    /// the background; use [`wait`](Self::wait) to join them.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let in_flight: HashSet<String> = self.running().keys().cloned().collect();
        let plan = plan_recovery(self.orchestrator(), &in_flight).await?;
        for record in plan.to_drive {
            self.spawn_lifecycle(record);
        }
        Ok(plan.report)
    }

    /// Wait for a proposal to settle, whether or not this process started it.
    pub async fn wait(&self, proposal_id: &str) -> Result<LifecycleRecord> {
        let done = self.running().get(proposal_id).map(|r| r.done.clone());
        match done {
            Some(done) => wait_done(done, self.orchestrator().records(), proposal_id).await,
            None => self.orchestrator().records().require(proposal_id).await,
        }
    }

    // -- queries ------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<EnhancementEvent> {
        self.orchestrator().events().subscribe()
    }

    pub async fn stats(&self) -> Result<FleetStats> {
        let mut stats = FleetStats::default();
        for record in self.orchestrator().records().list().await? {
            stats.add(&record);
        }
        Ok(stats)
    }

    pub async fn record(&self, proposal_id: &str) -> Result<LifecycleRecord> {
        self.orchestrator().records().require(proposal_id).await
    }

    pub async fn records_for_agent(&self, agent_id: &str) -> Result<Vec<LifecycleRecord>> {
        let mut records = self.orchestrator().records().list().await?;
        records.retain(|r| r.agent_id() == agent_id);
        Ok(records)
    }

    pub async fn pending_approvals(&self) -> Result<Vec<LifecycleRecord>> {
        self.orchestrator()
            .records()
            .list_in_state(ProposalState::AwaitingApproval)
            .await
    }

    pub async fn register_agent(&self, agent_id: &str, parameters: Parameters) -> Result<AgentConfiguration> {
        self.orchestrator().configs().register(agent_id, parameters).await
    }

    pub async fn configuration(&self, agent_id: &str) -> Result<AgentConfiguration> {
        self.orchestrator().configs().require(agent_id).await
    }

    pub async fn history(&self, agent_id: &str) -> Result<Vec<AgentConfiguration>> {
        self.orchestrator().configs().history(agent_id).await
    }
}
