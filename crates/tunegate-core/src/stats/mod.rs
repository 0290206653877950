//! Statistical comparator and significance gate.
//!
//! [`compare`] runs Welch's t-test on two [`PerformanceSummary`]s, computes
//! Cohen's d and the relative improvement, and applies the accept rule:
//! `p < alpha` AND `improvement > min_improvement_pct` AND
//! `effect > min_effect_size` (plus the optional success-rate guard).
//! Every failed condition is listed in `violations`.

pub mod distribution;

use serde::{Deserialize, Serialize};

use crate::domain::PerformanceSummary;

pub use distribution::{student_t_cdf, student_t_quantile, student_t_two_tailed};

/// Finite stand-in for an unbounded effect size (zero pooled variance).
pub const EFFECT_SIZE_CAP: f64 = 1e6;

/// Baseline means closer to zero than this make relative improvement undefined.
const MEAN_EPSILON: f64 = 1e-12;

/// Thresholds of the significance gate (`[gate]` section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
    /// Maximum p-value (exclusive).
    pub alpha: f64,
    /// Minimum relative improvement of the mean (exclusive), 0.05 = 5 %.
    pub min_improvement_pct: f64,
    /// Minimum Cohen's d (exclusive).
    pub min_effect_size: f64,
    /// Minimum trials per side before a comparison may run.
    pub min_sample_size: usize,
    /// Confidence level of the reported interval.
    pub confidence_level: f64,
    /// Largest tolerated drop in success rate; `None` disables the guard.
    pub max_success_rate_drop: Option<f64>,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            min_improvement_pct: 0.05,
            min_effect_size: 0.3,
            min_sample_size: 30,
            confidence_level: 0.95,
            max_success_rate_drop: None,
        }
    }
}

/// Confidence interval for `candidate_mean - baseline_mean`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
}

/// Which accept-rule condition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateCondition {
    PValue,
    Improvement,
    EffectSize,
    SuccessRate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateViolation {
    pub condition: GateCondition,
    pub reason: String,
}

/// Outcome of comparing a baseline and a candidate summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalComparison {
    pub p_value: f64,
    pub effect_size: f64,
    pub improvement_pct: f64,
    pub significant: bool,
    pub confidence_interval: ConfidenceInterval,
    pub mean_difference: f64,
    pub t_statistic: f64,
    pub degrees_of_freedom: f64,
    /// Empty when `significant`.
    pub violations: Vec<GateViolation>,
}

/// Comparison refused because a side is below the sample floor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("insufficient sample: baseline n={baseline_n}, candidate n={candidate_n}, minimum {minimum}")]
pub struct InsufficientSample {
    pub baseline_n: usize,
    pub candidate_n: usize,
    pub minimum: usize,
}

struct Welch {
    t: f64,
    df: f64,
    p: f64,
    se: f64,
}

/// Welch's t-test from summary moments, over the successful trials of each side.
fn welch(baseline: &PerformanceSummary, candidate: &PerformanceSummary) -> Welch {
    let diff = candidate.mean - baseline.mean;
    let (n1, n2) = (baseline.successes as f64, candidate.successes as f64);
    if baseline.successes < 2 || candidate.successes < 2 {
        return Welch {
            t: 0.0,
            df: 0.0,
            p: 1.0,
            se: 0.0,
        };
    }

    let v1 = baseline.stddev.powi(2) / n1;
    let v2 = candidate.stddev.powi(2) / n2;
    let se = (v1 + v2).sqrt();
    if se == 0.0 {
        // Both sides constant: any difference is certain.
        let (t, p) = if diff == 0.0 { (0.0, 1.0) } else { (diff.signum() * f64::MAX, 0.0) };
        return Welch {
            t,
            df: n1 + n2 - 2.0,
            p,
            se,
        };
    }

    let t = diff / se;
    let df = (v1 + v2).powi(2) / (v1.powi(2) / (n1 - 1.0) + v2.powi(2) / (n2 - 1.0));
    Welch {
        t,
        df,
        p: student_t_two_tailed(t, df),
        se,
    }
}

/// Cohen's d with pooled standard deviation.
fn cohens_d(baseline: &PerformanceSummary, candidate: &PerformanceSummary) -> f64 {
    let diff = candidate.mean - baseline.mean;
    let (n1, n2) = (baseline.successes as f64, candidate.successes as f64);
    if n1 + n2 <= 2.0 {
        return 0.0;
    }
    let pooled = (((n1 - 1.0).max(0.0) * baseline.stddev.powi(2)
        + (n2 - 1.0).max(0.0) * candidate.stddev.powi(2))
        / (n1 + n2 - 2.0))
        .sqrt();
    if pooled > 0.0 {
        diff / pooled
    } else if diff == 0.0 {
        0.0
    } else {
        diff.signum() * EFFECT_SIZE_CAP
    }
}

/// Relative improvement of the mean, `(candidate - baseline) / |baseline|`.
///
/// Dividing by the magnitude keeps the sign aligned with `t` and Cohen's d,
/// so a higher candidate mean counts as an improvement for metrics that are
/// negative (log-likelihoods, penalties) as well as positive ones.
fn improvement(baseline: &PerformanceSummary, candidate: &PerformanceSummary) -> f64 {
    if baseline.mean.abs() < MEAN_EPSILON {
        return 0.0;
    }
    (candidate.mean - baseline.mean) / baseline.mean.abs()
}

/// Compare two summaries and apply the significance gate.
///
/// Returns [`InsufficientSample`] without computing anything when either
/// side has fewer than `min_sample_size` trials.
pub fn compare(
    baseline: &PerformanceSummary,
    candidate: &PerformanceSummary,
    thresholds: &GateThresholds,
) -> Result<StatisticalComparison, InsufficientSample> {
    if baseline.n < thresholds.min_sample_size || candidate.n < thresholds.min_sample_size {
        return Err(InsufficientSample {
            baseline_n: baseline.n,
            candidate_n: candidate.n,
            minimum: thresholds.min_sample_size,
        });
    }

    let mean_difference = candidate.mean - baseline.mean;
    let w = welch(baseline, candidate);
    let effect_size = cohens_d(baseline, candidate);
    let improvement_pct = improvement(baseline, candidate);

    let half_width = if w.se > 0.0 && w.df > 0.0 {
        let q = student_t_quantile(1.0 - (1.0 - thresholds.confidence_level) / 2.0, w.df);
        q * w.se
    } else {
        0.0
    };
    let confidence_interval = ConfidenceInterval {
        lower: mean_difference - half_width,
        upper: mean_difference + half_width,
        level: thresholds.confidence_level,
    };

    let mut violations = Vec::new();
    if w.p >= thresholds.alpha {
        violations.push(GateViolation {
            condition: GateCondition::PValue,
            reason: format!("p-value {:.4} >= alpha {}", w.p, thresholds.alpha),
        });
    }
    if improvement_pct <= thresholds.min_improvement_pct {
        violations.push(GateViolation {
            condition: GateCondition::Improvement,
            reason: format!(
                "improvement {:.2}% <= minimum {:.2}%",
                improvement_pct * 100.0,
                thresholds.min_improvement_pct * 100.0
            ),
        });
    }
    if effect_size <= thresholds.min_effect_size {
        violations.push(GateViolation {
            condition: GateCondition::EffectSize,
            reason: format!(
                "effect size {:.3} <= minimum {}",
                effect_size, thresholds.min_effect_size
            ),
        });
    }
    if let Some(limit) = thresholds.max_success_rate_drop {
        let drop = baseline.success_rate - candidate.success_rate;
        if drop > limit {
            violations.push(GateViolation {
                condition: GateCondition::SuccessRate,
                reason: format!("success rate dropped by {:.3} (limit {limit})", drop),
            });
        }
    }

    Ok(StatisticalComparison {
        p_value: w.p,
        effect_size,
        improvement_pct,
        significant: violations.is_empty(),
        confidence_interval,
        mean_difference,
        t_statistic: if w.t.is_finite() { w.t } else { w.t.signum() * f64::MAX },
        degrees_of_freedom: w.df,
        violations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(n: usize, mean: f64, sd: f64) -> PerformanceSummary {
        PerformanceSummary::from_moments(n, mean, sd)
    }

    fn gate() -> GateThresholds {
        GateThresholds::default()
    }

    fn conditions(c: &StatisticalComparison) -> Vec<GateCondition> {
        c.violations.iter().map(|v| v.condition).collect()
    }

    #[test]
    fn test_clear_improvement_is_significant() {
        let c = compare(&summary(150, 150.0, 30.0), &summary(150, 172.0, 32.0), &gate()).unwrap();
        assert!(c.significant);
        assert!(c.p_value < 1e-6);
        assert!((c.improvement_pct - 22.0 / 150.0).abs() < 1e-12);
        assert!((c.effect_size - 0.709).abs() < 0.005);
        assert!((c.t_statistic - 6.1428).abs() < 1e-3);
        assert!(c.confidence_interval.lower > 0.0);
        assert!(c.confidence_interval.lower < 22.0 && c.confidence_interval.upper > 22.0);
    }

    #[test]
    fn test_small_improvement_fails_improvement_floor() {
        let c = compare(&summary(150, 150.0, 30.0), &summary(150, 152.0, 30.0), &gate()).unwrap();
        assert!(!c.significant);
        assert!(conditions(&c).contains(&GateCondition::Improvement));
    }

    #[test]
    fn test_large_samples_tiny_effect_only_fails_practical_conditions() {
        // Detectable but meaningless: p passes, improvement and effect do not.
        let c = compare(
            &summary(100_000, 100.0, 10.0),
            &summary(100_000, 101.0, 10.0),
            &gate(),
        )
        .unwrap();
        assert!(c.p_value < 0.05);
        assert_eq!(
            conditions(&c),
            vec![GateCondition::Improvement, GateCondition::EffectSize]
        );
    }

    #[test]
    fn test_each_condition_alone_blocks() {
        // Improvement and effect pass, p fails (small sample).
        let c = compare(&summary(30, 100.0, 20.0), &summary(30, 107.0, 20.0), &gate()).unwrap();
        assert!(c.improvement_pct > 0.05);
        assert!(c.effect_size > 0.3);
        assert_eq!(conditions(&c), vec![GateCondition::PValue]);

        // p and improvement pass, effect fails.
        let c = compare(
            &summary(5_000, 100.0, 40.0),
            &summary(5_000, 110.0, 40.0),
            &gate(),
        )
        .unwrap();
        assert!(c.p_value < 0.05 && c.improvement_pct > 0.05);
        assert_eq!(conditions(&c), vec![GateCondition::EffectSize]);
    }

    #[test]
    fn test_sample_floor_refuses_comparison() {
        let err = compare(&summary(10, 150.0, 30.0), &summary(10, 172.0, 32.0), &gate()).unwrap_err();
        assert_eq!(err.baseline_n, 10);
        assert_eq!(err.minimum, 30);

        let err = compare(&summary(30, 150.0, 30.0), &summary(29, 172.0, 32.0), &gate());
        assert!(err.is_err());
    }

    #[test]
    fn test_zero_variance_sides() {
        let same = compare(&summary(40, 5.0, 0.0), &summary(40, 5.0, 0.0), &gate()).unwrap();
        assert_eq!(same.p_value, 1.0);
        assert_eq!(same.effect_size, 0.0);
        assert!(!same.significant);

        let better = compare(&summary(40, 5.0, 0.0), &summary(40, 6.0, 0.0), &gate()).unwrap();
        assert_eq!(better.p_value, 0.0);
        assert_eq!(better.effect_size, EFFECT_SIZE_CAP);
        assert!(better.significant);
        assert!(serde_json::to_string(&better).is_ok());
    }

    #[test]
    fn test_zero_baseline_mean_has_no_relative_improvement() {
        let c = compare(&summary(50, 0.0, 1.0), &summary(50, 2.0, 1.0), &gate()).unwrap();
        assert_eq!(c.improvement_pct, 0.0);
        assert!(!c.significant);
    }

    #[test]
    fn test_negative_baseline_mean_uses_magnitude() {
        // -100 -> -80 is a 20 % gain on a higher-is-better metric.
        let c = compare(&summary(150, -100.0, 20.0), &summary(150, -80.0, 20.0), &gate()).unwrap();
        assert!((c.improvement_pct - 0.2).abs() < 1e-12);
        assert!(c.effect_size > 0.0 && c.t_statistic > 0.0);
        assert!(c.significant);

        let worse = compare(&summary(150, -100.0, 20.0), &summary(150, -120.0, 20.0), &gate()).unwrap();
        assert!((worse.improvement_pct + 0.2).abs() < 1e-12);
        assert!(!worse.significant);
        assert!(conditions(&worse).contains(&GateCondition::Improvement));
    }

    #[test]
    fn test_too_few_successes_is_not_significant() {
        let baseline = summary(40, 100.0, 5.0);
        let candidate = PerformanceSummary {
            n: 40,
            successes: 1,
            success_rate: 0.025,
            mean: 200.0,
            stddev: 0.0,
        };
        let c = compare(&baseline, &candidate, &gate()).unwrap();
        assert_eq!(c.p_value, 1.0);
        assert!(!c.significant);
    }

    #[test]
    fn test_success_rate_guard_is_optional() {
        let baseline = summary(100, 100.0, 10.0);
        let mut candidate = summary(100, 120.0, 10.0);
        candidate.success_rate = 0.7;

        assert!(compare(&baseline, &candidate, &gate()).unwrap().significant);

        let guarded = GateThresholds {
            max_success_rate_drop: Some(0.1),
            ..gate()
        };
        let c = compare(&baseline, &candidate, &guarded).unwrap();
        assert_eq!(conditions(&c), vec![GateCondition::SuccessRate]);
    }
}
