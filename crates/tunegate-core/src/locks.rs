//! Per-agent commit locks.
//!
//! One holder (a proposal id) per agent. The table is in-memory; after a
//! restart, recovery re-acquires the locks of every non-terminal record
//! before any new proposal is admitted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::{watch, Notify};

/// Returned when another proposal holds the agent lock.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("agent {agent_id} is locked by proposal {holder}")]
pub struct LockHeld {
    pub agent_id: String,
    pub holder: String,
}

#[derive(Default)]
pub struct AgentLocks {
    holders: Mutex<HashMap<String, String>>,
    released: Notify,
}

impl AgentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.holders.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the lock for `proposal_id`. Re-acquiring a lock already held by
    /// the same proposal succeeds.
    pub fn try_acquire(&self, agent_id: &str, proposal_id: &str) -> Result<(), LockHeld> {
        let mut table = self.table();
        match table.get(agent_id) {
            Some(holder) if holder != proposal_id => Err(LockHeld {
                agent_id: agent_id.to_string(),
                holder: holder.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                table.insert(agent_id.to_string(), proposal_id.to_string());
                Ok(())
            }
        }
    }

    /// Wait until the lock is free and take it.
    ///
    /// Returns `false` without taking the lock if `cancel` flips to `true`
    /// first.
    pub async fn acquire_queued(
        &self,
        agent_id: &str,
        proposal_id: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register interest before checking so a release between the
            // check and the await is not missed.
            notified.as_mut().enable();

            if *cancel.borrow() {
                return false;
            }
            if self.try_acquire(agent_id, proposal_id).is_ok() {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                changed = cancel.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Release the lock if `proposal_id` holds it. Returns whether it did.
    pub fn release(&self, agent_id: &str, proposal_id: &str) -> bool {
        let released = {
            let mut table = self.table();
            match table.get(agent_id) {
                Some(holder) if holder == proposal_id => {
                    table.remove(agent_id);
                    true
                }
                _ => false,
            }
        };
        if released {
            self.released.notify_waiters();
        }
        released
    }

    pub fn holder(&self, agent_id: &str) -> Option<String> {
        self.table().get(agent_id).cloned()
    }
}
