//! Trials, scenario plans and performance summaries.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Outcome of one sampled execution of an agent's task.
///
/// Immutable once recorded. A trial that errored or timed out is kept as a
/// failed result with `error` set; it counts toward `n` and the success rate
/// but never toward the metric mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub round: u32,
    pub success: bool,
    pub metric_value: f64,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrialResult {
    pub fn succeeded(round: u32, metric_value: f64, duration_ms: f64) -> Self {
        Self {
            round,
            success: true,
            metric_value,
            duration_ms,
            error: None,
        }
    }

    pub fn failed(round: u32, duration_ms: f64, error: impl Into<String>) -> Self {
        Self {
            round,
            success: false,
            metric_value: 0.0,
            duration_ms,
            error: Some(error.into()),
        }
    }
}

/// Reduction of a batch of trials.
///
/// `n` counts every trial; `successes` counts the trials whose metric feeds
/// `mean` and `stddev` (sample standard deviation, `n - 1` denominator).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub n: usize,
    pub successes: usize,
    pub success_rate: f64,
    pub mean: f64,
    pub stddev: f64,
}

impl PerformanceSummary {
    /// Summary of `n` all-successful trials with the given moments.
    pub fn from_moments(n: usize, mean: f64, stddev: f64) -> Self {
        Self {
            n,
            successes: n,
            success_rate: if n == 0 { 0.0 } else { 1.0 },
            mean,
            stddev,
        }
    }
}

/// One logical scenario of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub index: u32,
    pub seed: u64,
}

/// Seeded scenario set shared by the baseline and candidate runs of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioPlan {
    pub seed: u64,
    pub count: u32,
}

impl ScenarioPlan {
    pub fn new(seed: u64, count: u32) -> Self {
        Self { seed, count }
    }

    /// Plan seeded from the first 8 bytes of `SHA-256(proposal_id)`.
    pub fn for_proposal(proposal_id: &str, count: u32) -> Self {
        let digest = Sha256::digest(proposal_id.as_bytes());
        let mut seed_bytes = [0u8; 8];
        seed_bytes.copy_from_slice(&digest[..8]);
        Self::new(u64::from_le_bytes(seed_bytes), count)
    }

    /// Expand the plan into its scenarios. Same plan, same scenarios.
    pub fn scenarios(&self) -> Vec<Scenario> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..self.count)
            .map(|index| Scenario {
                index,
                seed: rng.gen(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_is_deterministic_per_proposal() {
        let a = ScenarioPlan::for_proposal("prop-1", 5);
        let b = ScenarioPlan::for_proposal("prop-1", 5);
        let c = ScenarioPlan::for_proposal("prop-2", 5);
        assert_eq!(a, b);
        assert_eq!(a.scenarios(), b.scenarios());
        assert_ne!(a.seed, c.seed);
    }

    #[test]
    fn test_plan_expands_to_count() {
        let scenarios = ScenarioPlan::new(7, 12).scenarios();
        assert_eq!(scenarios.len(), 12);
        assert_eq!(scenarios[11].index, 11);
    }

    #[test]
    fn test_failed_trial_carries_error() {
        let t = TrialResult::failed(3, 12.0, "timeout");
        assert!(!t.success);
        assert_eq!(t.error.as_deref(), Some("timeout"));
    }
}
