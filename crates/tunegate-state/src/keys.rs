//! Key namespacing.
//!
//! Agent-scoped objects live under `agents/<agent_id>/`, proposal records under
//! `proposals/<proposal_id>`, and approval request indexes under
//! `approvals/<request_id>`.

/// Prefix under which all lifecycle records are stored.
pub const PROPOSALS_PREFIX: &str = "proposals/";

/// Prefix under which approval request indexes are stored.
pub const APPROVALS_PREFIX: &str = "approvals/";

/// Prefix under which agent-scoped objects are stored.
pub const AGENTS_PREFIX: &str = "agents/";

/// Current committed configuration of an agent.
pub fn agent_config(agent_id: &str) -> String {
    format!("{AGENTS_PREFIX}{agent_id}/config")
}

/// A historical committed configuration of an agent, by version.
pub fn agent_config_version(agent_id: &str, version: u64) -> String {
    format!("{AGENTS_PREFIX}{agent_id}/versions/{version:020}")
}

/// Prefix of all historical configurations of an agent.
pub fn agent_config_versions_prefix(agent_id: &str) -> String {
    format!("{AGENTS_PREFIX}{agent_id}/versions/")
}

/// Learned-pattern history of an agent.
pub fn agent_patterns(agent_id: &str) -> String {
    format!("{AGENTS_PREFIX}{agent_id}/patterns")
}

/// Lifecycle record of a proposal.
pub fn proposal(proposal_id: &str) -> String {
    format!("{PROPOSALS_PREFIX}{proposal_id}")
}

/// Approval request index entry (request id → proposal id).
pub fn approval(request_id: &str) -> String {
    format!("{APPROVALS_PREFIX}{request_id}")
}

/// Strip a namespace prefix from a listed key.
pub fn strip<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}
