//! Deterministic samplers for tests and demos.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Notify, Semaphore};

use super::{Sampler, SamplerError, SamplerResult};
use crate::domain::{Parameters, ScenarioPlan, TrialResult};

// ---------------------------------------------------------------------------
// SyntheticSampler
// ---------------------------------------------------------------------------

/// Quadratic response surface with seeded Gaussian noise.
///
/// `metric = peak - Σ curvature · (p - optimum_p)² + noise`, where noise is
/// drawn from `N(0, noise_sd²)` seeded by the scenario. The same scenario
/// under two parameter sets sees the same noise draw.
#[derive(Debug, Clone)]
pub struct SyntheticSampler {
    optimum: BTreeMap<String, f64>,
    peak: f64,
    curvature: f64,
    noise_sd: f64,
    failure_rate: f64,
}

impl SyntheticSampler {
    pub fn new(optimum: Parameters, peak: f64) -> Self {
        Self {
            optimum,
            peak,
            curvature: 1.0,
            noise_sd: 1.0,
            failure_rate: 0.0,
        }
    }

    pub fn with_curvature(mut self, curvature: f64) -> Self {
        self.curvature = curvature;
        self
    }

    pub fn with_noise(mut self, noise_sd: f64) -> Self {
        self.noise_sd = noise_sd.abs();
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Noise-free metric for `parameters`.
    pub fn expected_metric(&self, parameters: &Parameters) -> f64 {
        let penalty: f64 = self
            .optimum
            .iter()
            .map(|(name, opt)| {
                let value = parameters.get(name).copied().unwrap_or(*opt);
                self.curvature * (value - opt).powi(2)
            })
            .sum();
        self.peak - penalty
    }
}

/// Standard normal draw via Box-Muller.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[async_trait]
impl Sampler for SyntheticSampler {
    async fn run(
        &self,
        _agent_id: &str,
        parameters: &Parameters,
        plan: &ScenarioPlan,
    ) -> SamplerResult<Vec<TrialResult>> {
        let expected = self.expected_metric(parameters);
        Ok(plan
            .scenarios()
            .into_iter()
            .map(|scenario| {
                let mut rng = StdRng::seed_from_u64(scenario.seed);
                let noise = standard_normal(&mut rng) * self.noise_sd;
                let duration_ms = 5.0 + rng.gen::<f64>() * 20.0;
                if rng.gen::<f64>() < self.failure_rate {
                    TrialResult::failed(scenario.index, duration_ms, "synthetic failure")
                } else {
                    TrialResult::succeeded(scenario.index, expected + noise, duration_ms)
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ScriptedSampler
// ---------------------------------------------------------------------------

/// Replays prepared batches in call order.
///
/// Optionally blocks every call until [`ScriptedSampler::release`] is called,
/// so tests can hold a proposal mid-stage.
pub struct ScriptedSampler {
    batches: Mutex<VecDeque<SamplerResult<Vec<TrialResult>>>>,
    calls: AtomicUsize,
    blocking: bool,
    started: Notify,
    gate: Semaphore,
}

impl Default for ScriptedSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSampler {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            blocking: false,
            started: Notify::new(),
            gate: Semaphore::new(0),
        }
    }

    /// Every `run` waits for a [`release`](Self::release) permit.
    pub fn blocking() -> Self {
        Self {
            blocking: true,
            ..Self::new()
        }
    }

    /// Queue a batch of trials.
    pub fn push(&self, trials: Vec<TrialResult>) -> &Self {
        self.lock().push_back(Ok(trials));
        self
    }

    /// Queue a batch whose successful metrics have exactly the given moments.
    pub fn push_moments(&self, n: usize, mean: f64, stddev: f64) -> &Self {
        self.push(trials_with_moments(n, mean, stddev))
    }

    /// Queue a failing invocation.
    pub fn push_error(&self, err: SamplerError) -> &Self {
        self.lock().push_back(Err(err));
        self
    }

    /// Number of `run` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wait until a blocked `run` call has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Let `n` blocked calls proceed.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SamplerResult<Vec<TrialResult>>>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Sampler for ScriptedSampler {
    async fn run(
        &self,
        _agent_id: &str,
        _parameters: &Parameters,
        _plan: &ScenarioPlan,
    ) -> SamplerResult<Vec<TrialResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.blocking {
            self.started.notify_one();
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| SamplerError::Fatal(e.to_string()))?;
            permit.forget();
        }
        let next = self.lock().pop_front();
        next.unwrap_or_else(|| Err(SamplerError::Fatal("script exhausted".to_string())))
    }
}

/// `n` successful trials whose metrics have exactly `mean` and sample `stddev`.
pub fn trials_with_moments(n: usize, mean: f64, stddev: f64) -> Vec<TrialResult> {
    if n < 2 {
        return (0..n)
            .map(|i| TrialResult::succeeded(i as u32, mean, 1.0))
            .collect();
    }
    // Standardize the sequence 0, 1, ..., n-1 and rescale.
    let center = (n - 1) as f64 / 2.0;
    let spread = ((n * (n + 1)) as f64 / 12.0).sqrt();
    (0..n)
        .map(|i| {
            let z = (i as f64 - center) / spread;
            TrialResult::succeeded(i as u32, mean + stddev * z, 1.0)
        })
        .collect()
}
