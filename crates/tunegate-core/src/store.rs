//! Typed stores over the key-value persistence interface.
//!
//! - [`ConfigStore`]: committed agent configurations, versioned, with history
//! - [`LifecycleStore`]: lifecycle records and the approval request index
//! - [`PatternStore`]: bounded learned-pattern history per agent

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use tunegate_state::{keys, KvStore, KvStoreExt};

use crate::domain::{
    AgentConfiguration, EngineError, LifecycleRecord, Parameters, ProposalState, Result,
};
use crate::proposer::LearnedPattern;

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

/// Durable per-agent record of the committed configuration.
///
/// The current configuration lives under `agents/<id>/config` and is only
/// replaced by a compare-and-put against the bytes read for the expected
/// version. Every committed version is also kept under
/// `agents/<id>/versions/<v>`.
#[derive(Clone)]
pub struct ConfigStore {
    kv: Arc<dyn KvStore>,
}

impl ConfigStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Register an agent at version 1. Returns the existing configuration
    /// unchanged if the agent is already registered.
    #[instrument(skip(self, parameters))]
    pub async fn register(&self, agent_id: &str, parameters: Parameters) -> Result<AgentConfiguration> {
        if let Some(existing) = self.current(agent_id).await? {
            return Ok(existing);
        }
        if let Some((name, _)) = parameters.iter().find(|(_, v)| !v.is_finite()) {
            return Err(EngineError::InvalidDelta(format!(
                "parameter {name} must be finite"
            )));
        }

        let initial = AgentConfiguration::initial(agent_id, parameters, Utc::now());
        let bytes = serde_json::to_vec(&initial)?;
        if self
            .kv
            .compare_and_put(&keys::agent_config(agent_id), None, bytes.clone())
            .await?
        {
            self.kv
                .put(&keys::agent_config_version(agent_id, initial.version), bytes)
                .await?;
            debug!(agent_id = %agent_id, "agent registered");
            return Ok(initial);
        }
        // Lost a registration race; the winner's configuration stands.
        self.require(agent_id).await
    }

    pub async fn current(&self, agent_id: &str) -> Result<Option<AgentConfiguration>> {
        Ok(self.kv.get_json(&keys::agent_config(agent_id)).await?)
    }

    pub async fn require(&self, agent_id: &str) -> Result<AgentConfiguration> {
        self.current(agent_id)
            .await?
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))
    }

    /// Replace the configuration at `expected_version` with `parameters`.
    ///
    /// Fails with [`EngineError::StaleConfiguration`] and writes nothing if
    /// the committed version is no longer `expected_version`.
    #[instrument(skip(self, parameters, now))]
    pub async fn commit(
        &self,
        agent_id: &str,
        expected_version: u64,
        parameters: Parameters,
        now: DateTime<Utc>,
    ) -> Result<AgentConfiguration> {
        let key = keys::agent_config(agent_id);
        let current_bytes = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))?;
        let current: AgentConfiguration = serde_json::from_slice(&current_bytes)?;
        if current.version != expected_version {
            return Err(EngineError::StaleConfiguration {
                agent_id: agent_id.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }

        // Backfill the entry of the version being replaced, in case its own
        // commit stopped between the compare-and-put and the history write.
        self.kv
            .compare_and_put(
                &keys::agent_config_version(agent_id, current.version),
                None,
                current_bytes.clone(),
            )
            .await?;

        let next = current.successor(parameters, now);
        let next_bytes = serde_json::to_vec(&next)?;
        if !self
            .kv
            .compare_and_put(&key, Some(&current_bytes), next_bytes.clone())
            .await?
        {
            let actual = self.require(agent_id).await?.version;
            return Err(EngineError::StaleConfiguration {
                agent_id: agent_id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        // Only the winner of the compare-and-put records history.
        self.kv
            .put(&keys::agent_config_version(agent_id, next.version), next_bytes)
            .await?;
        debug!(agent_id = %agent_id, version = next.version, "configuration committed");
        Ok(next)
    }

    /// Every committed configuration, newest first.
    pub async fn history(&self, agent_id: &str) -> Result<Vec<AgentConfiguration>> {
        let Some(current) = self.current(agent_id).await? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for key in self.kv.list(&keys::agent_config_versions_prefix(agent_id)).await? {
            if let Some(config) = self.kv.get_json::<AgentConfiguration>(&key).await? {
                if config.version < current.version {
                    out.push(config);
                }
            }
        }
        out.push(current);
        out.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(out)
    }

    /// Ids of all registered agents, sorted.
    pub async fn agents(&self) -> Result<Vec<String>> {
        Ok(self
            .kv
            .list(keys::AGENTS_PREFIX)
            .await?
            .iter()
            .filter_map(|k| keys::strip(keys::AGENTS_PREFIX, k)?.strip_suffix("/config"))
            .filter(|id| !id.contains('/'))
            .map(str::to_string)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// LifecycleStore
// ---------------------------------------------------------------------------

/// Lifecycle records keyed by proposal id, plus the approval request index.
#[derive(Clone)]
pub struct LifecycleStore {
    kv: Arc<dyn KvStore>,
}

impl LifecycleStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn save(&self, record: &LifecycleRecord) -> Result<()> {
        self.kv
            .put_json(&keys::proposal(record.proposal_id()), record)
            .await?;
        Ok(())
    }

    pub async fn load(&self, proposal_id: &str) -> Result<Option<LifecycleRecord>> {
        Ok(self.kv.get_json(&keys::proposal(proposal_id)).await?)
    }

    pub async fn require(&self, proposal_id: &str) -> Result<LifecycleRecord> {
        self.load(proposal_id)
            .await?
            .ok_or_else(|| EngineError::ProposalNotFound(proposal_id.to_string()))
    }

    /// All records, oldest first.
    pub async fn list(&self) -> Result<Vec<LifecycleRecord>> {
        let mut out = Vec::new();
        for key in self.kv.list(keys::PROPOSALS_PREFIX).await? {
            if let Some(record) = self.kv.get_json::<LifecycleRecord>(&key).await? {
                out.push(record);
            }
        }
        out.sort_by(|a, b| {
            a.proposal
                .created_at
                .cmp(&b.proposal.created_at)
                .then_with(|| a.proposal_id().cmp(b.proposal_id()))
        });
        Ok(out)
    }

    pub async fn list_non_terminal(&self) -> Result<Vec<LifecycleRecord>> {
        let mut records = self.list().await?;
        records.retain(|r| !r.is_terminal());
        Ok(records)
    }

    pub async fn list_in_state(&self, state: ProposalState) -> Result<Vec<LifecycleRecord>> {
        let mut records = self.list().await?;
        records.retain(|r| r.state() == state);
        Ok(records)
    }

    pub async fn index_approval(&self, request_id: &str, proposal_id: &str) -> Result<()> {
        self.kv
            .put(&keys::approval(request_id), proposal_id.as_bytes().to_vec())
            .await?;
        Ok(())
    }

    /// Proposal id for an approval request, if indexed.
    pub async fn resolve_approval(&self, request_id: &str) -> Result<Option<String>> {
        Ok(self
            .kv
            .get(&keys::approval(request_id))
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

// ---------------------------------------------------------------------------
// PatternStore
// ---------------------------------------------------------------------------

/// Learned-pattern history, oldest first, bounded per agent.
#[derive(Clone)]
pub struct PatternStore {
    kv: Arc<dyn KvStore>,
    max_patterns: usize,
}

impl PatternStore {
    pub fn new(kv: Arc<dyn KvStore>, max_patterns: usize) -> Self {
        Self {
            kv,
            max_patterns: max_patterns.max(1),
        }
    }

    pub async fn list(&self, agent_id: &str) -> Result<Vec<LearnedPattern>> {
        Ok(self
            .kv
            .get_json(&keys::agent_patterns(agent_id))
            .await?
            .unwrap_or_default())
    }

    /// Append `pattern`, dropping the oldest entries past the bound.
    /// Re-appending a proposal already present is a no-op.
    pub async fn append(&self, agent_id: &str, pattern: LearnedPattern) -> Result<()> {
        let mut patterns = self.list(agent_id).await?;
        if patterns.iter().any(|p| p.proposal_id == pattern.proposal_id) {
            return Ok(());
        }
        patterns.push(pattern);
        if patterns.len() > self.max_patterns {
            let excess = patterns.len() - self.max_patterns;
            patterns.drain(..excess);
        }
        self.kv
            .put_json(&keys::agent_patterns(agent_id), &patterns)
            .await?;
        Ok(())
    }
}
