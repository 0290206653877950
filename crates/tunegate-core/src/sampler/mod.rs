//! Samplers: run N independent trials of an agent's task.
//!
//! A [`Sampler`] must return exactly one [`TrialResult`] per scenario of the
//! plan or fail the whole invocation. Individual trial failures are results,
//! not errors.
//!
//! - [`ExecutorSampler`]: production sampler over a [`TaskExecutor`]
//! - [`ProcessExecutor`]: task executor that launches an external command
//! - [`SyntheticSampler`]: deterministic response surface (tests, demos)
//! - [`ScriptedSampler`]: replays prepared batches (tests)

pub mod executor;
pub mod process;
pub mod synthetic;

use async_trait::async_trait;

use crate::domain::{Parameters, ScenarioPlan, TrialResult};

pub use executor::{ExecutorSampler, TaskExecutor, TrialOutcome};
pub use process::ProcessExecutor;
pub use synthetic::{trials_with_moments, ScriptedSampler, SyntheticSampler};

/// Errors raised by samplers and task executors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplerError {
    /// The sampler returned a different number of results than scenarios.
    #[error("sampler returned {actual} results for {expected} scenarios")]
    WrongCount { expected: usize, actual: usize },

    /// The whole invocation failed.
    #[error("sampler failed: {0}")]
    Fatal(String),

    /// One trial failed. Absorbed into a failed `TrialResult` by the sampler.
    #[error("trial failed: {0}")]
    Trial(String),
}

/// Result type for sampler operations.
pub type SamplerResult<T> = std::result::Result<T, SamplerError>;

/// Executes the trials of one scenario plan under one parameter set.
#[async_trait]
pub trait Sampler: Send + Sync {
    async fn run(
        &self,
        agent_id: &str,
        parameters: &Parameters,
        plan: &ScenarioPlan,
    ) -> SamplerResult<Vec<TrialResult>>;
}

/// Enforce the all-or-nothing contract on a sampler's output.
pub fn ensure_complete(plan: &ScenarioPlan, results: Vec<TrialResult>) -> SamplerResult<Vec<TrialResult>> {
    let expected = plan.count as usize;
    if results.len() != expected {
        return Err(SamplerError::WrongCount {
            expected,
            actual: results.len(),
        });
    }
    Ok(results)
}
