//! Performance aggregation.
//!
//! Reduces a batch of [`TrialResult`]s to a [`PerformanceSummary`]. Pure and
//! deterministic: the same trials in any order yield the same summary.

use crate::domain::{PerformanceSummary, TrialResult};

/// Summarize `trials`.
///
/// `success_rate` is taken over all trials. `mean` and `stddev` use only
/// successful trials with a finite metric; `stddev` is the sample standard
/// deviation and is `0.0` with fewer than two such trials.
pub fn summarize(trials: &[TrialResult]) -> PerformanceSummary {
    let n = trials.len();
    let mut values: Vec<f64> = trials
        .iter()
        .filter(|t| t.success && t.metric_value.is_finite())
        .map(|t| t.metric_value)
        .collect();
    // Fixed summation order keeps the result independent of trial order.
    values.sort_by(f64::total_cmp);

    let successes = values.len();
    let success_rate = if n == 0 {
        0.0
    } else {
        trials.iter().filter(|t| t.success).count() as f64 / n as f64
    };

    let mean = if successes == 0 {
        0.0
    } else {
        values.iter().sum::<f64>() / successes as f64
    };

    let stddev = if successes < 2 {
        0.0
    } else {
        let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
        (ss / (successes - 1) as f64).sqrt()
    };

    PerformanceSummary {
        n,
        successes,
        success_rate,
        mean,
        stddev,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(round: u32, v: f64) -> TrialResult {
        TrialResult::succeeded(round, v, 1.0)
    }

    #[test]
    fn test_empty_batch() {
        let s = summarize(&[]);
        assert_eq!(s.n, 0);
        assert_eq!(s.success_rate, 0.0);
        assert_eq!(s.mean, 0.0);
        assert_eq!(s.stddev, 0.0);
    }

    #[test]
    fn test_mean_and_sample_stddev() {
        let trials: Vec<_> = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]
            .iter()
            .enumerate()
            .map(|(i, v)| ok(i as u32, *v))
            .collect();
        let s = summarize(&trials);
        assert_eq!(s.n, 8);
        assert_eq!(s.mean, 5.0);
        assert!((s.stddev - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_failed_trials_only_affect_success_rate() {
        let trials = vec![
            ok(0, 10.0),
            ok(1, 20.0),
            TrialResult::failed(2, 5.0, "boom"),
            TrialResult::failed(3, 5.0, "boom"),
        ];
        let s = summarize(&trials);
        assert_eq!(s.n, 4);
        assert_eq!(s.successes, 2);
        assert_eq!(s.success_rate, 0.5);
        assert_eq!(s.mean, 15.0);
    }

    #[test]
    fn test_order_insensitive() {
        let a: Vec<_> = (0..50).map(|i| ok(i, (i as f64 * 0.37).sin() * 1e3)).collect();
        let mut b = a.clone();
        b.reverse();
        assert_eq!(summarize(&a), summarize(&b));
    }
}
