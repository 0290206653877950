//! Production sampler over a pluggable task executor.
//!
//! Scenarios run concurrently, bounded by a semaphore. A trial that errors or
//! exceeds the per-trial timeout becomes a failed [`TrialResult`]; the batch
//! still returns one result per scenario.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use super::{ensure_complete, Sampler, SamplerError, SamplerResult};
use crate::domain::{Parameters, Scenario, ScenarioPlan, TrialResult};
use crate::metrics::METRICS;

/// What one task execution reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub success: bool,
    pub metric: f64,
}

/// Runs an agent's task once for one scenario.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        agent_id: &str,
        parameters: &Parameters,
        scenario: &Scenario,
    ) -> SamplerResult<TrialOutcome>;
}

/// [`Sampler`] that fans a plan out to a [`TaskExecutor`].
pub struct ExecutorSampler<E> {
    executor: E,
    max_parallel: usize,
    trial_timeout: Option<Duration>,
}

impl<E: TaskExecutor> ExecutorSampler<E> {
    pub fn new(executor: E, max_parallel: usize) -> Self {
        Self {
            executor,
            max_parallel: max_parallel.max(1),
            trial_timeout: None,
        }
    }

    pub fn with_trial_timeout(mut self, timeout: Duration) -> Self {
        self.trial_timeout = Some(timeout);
        self
    }

    async fn run_trial(
        &self,
        permits: &Semaphore,
        agent_id: &str,
        parameters: &Parameters,
        scenario: Scenario,
    ) -> SamplerResult<TrialResult> {
        let _permit = permits
            .acquire()
            .await
            .map_err(|e| SamplerError::Fatal(format!("trial permits closed: {e}")))?;

        let started = Instant::now();
        let fut = self.executor.execute(agent_id, parameters, &scenario);
        let outcome = match self.trial_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(SamplerError::Trial(format!(
                    "timed out after {}ms",
                    limit.as_millis()
                ))),
            },
            None => fut.await,
        };
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        METRICS.inc_trials_executed();

        Ok(match outcome {
            Ok(o) if o.metric.is_finite() => TrialResult {
                round: scenario.index,
                success: o.success,
                metric_value: o.metric,
                duration_ms,
                error: None,
            },
            Ok(_) => TrialResult::failed(scenario.index, duration_ms, "non-finite metric"),
            Err(SamplerError::Trial(reason)) => {
                debug!(round = scenario.index, %reason, "trial failed");
                TrialResult::failed(scenario.index, duration_ms, reason)
            }
            Err(fatal) => return Err(fatal),
        })
    }
}

#[async_trait]
impl<E: TaskExecutor> Sampler for ExecutorSampler<E> {
    #[instrument(skip(self, parameters, plan), fields(count = plan.count))]
    async fn run(
        &self,
        agent_id: &str,
        parameters: &Parameters,
        plan: &ScenarioPlan,
    ) -> SamplerResult<Vec<TrialResult>> {
        let permits = Semaphore::new(self.max_parallel);
        let trials = plan
            .scenarios()
            .into_iter()
            .map(|scenario| self.run_trial(&permits, agent_id, parameters, scenario));

        let mut results = Vec::with_capacity(plan.count as usize);
        for result in join_all(trials).await {
            results.push(result?);
        }
        results.sort_by_key(|t| t.round);

        let failed = results.iter().filter(|t| !t.success).count();
        if failed > 0 {
            warn!(agent_id = %agent_id, failed, total = results.len(), "trials failed");
        }
        ensure_complete(plan, results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingExecutor {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TaskExecutor for Arc<CountingExecutor> {
        async fn execute(
            &self,
            _agent_id: &str,
            _parameters: &Parameters,
            scenario: &Scenario,
        ) -> SamplerResult<TrialOutcome> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match scenario.index % 4 {
                3 => Err(SamplerError::Trial("flaky".to_string())),
                _ => Ok(TrialOutcome {
                    success: true,
                    metric: scenario.index as f64,
                }),
            }
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl TaskExecutor for SlowExecutor {
        async fn execute(
            &self,
            _agent_id: &str,
            _parameters: &Parameters,
            scenario: &Scenario,
        ) -> SamplerResult<TrialOutcome> {
            if scenario.index == 0 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(TrialOutcome {
                success: true,
                metric: 1.0,
            })
        }
    }

    struct BrokenExecutor;

    #[async_trait]
    impl TaskExecutor for BrokenExecutor {
        async fn execute(
            &self,
            _agent_id: &str,
            _parameters: &Parameters,
            _scenario: &Scenario,
        ) -> SamplerResult<TrialOutcome> {
            Err(SamplerError::Fatal("runtime unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_bounded_parallelism_and_absorbed_trial_errors() {
        let exec = Arc::new(CountingExecutor {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let sampler = ExecutorSampler::new(Arc::clone(&exec), 3);
        let plan = ScenarioPlan::new(11, 16);

        let results = sampler.run("a", &Parameters::new(), &plan).await.unwrap();
        assert_eq!(results.len(), 16);
        assert!(exec.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(results.iter().filter(|t| !t.success).count(), 4);
        assert!(results.windows(2).all(|w| w[0].round < w[1].round));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_failed_trial() {
        let sampler =
            ExecutorSampler::new(SlowExecutor, 4).with_trial_timeout(Duration::from_millis(100));
        let results = sampler
            .run("a", &Parameters::new(), &ScenarioPlan::new(1, 4))
            .await
            .unwrap();
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap_or("").contains("timed out"));
        assert!(results[1..].iter().all(|t| t.success));
    }

    #[tokio::test]
    async fn test_fatal_executor_error_fails_batch() {
        let sampler = ExecutorSampler::new(BrokenExecutor, 2);
        let err = sampler
            .run("a", &Parameters::new(), &ScenarioPlan::new(1, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, SamplerError::Fatal(_)));
    }
}
