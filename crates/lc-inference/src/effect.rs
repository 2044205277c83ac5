//! Average treatment effect on the treated from matched pairs.

use lc_core::math::{mean, sample_variance};
use lc_core::{Error, Result};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::bootstrap_ci::{BootstrapCiMethod, mean_difference_interval};
use crate::identify::AdjustmentSet;
use crate::matching::MatchedPairSet;

/// How the confidence interval is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntervalMethod {
    /// `att ± t_{n-1} · sd(diff) / √n`.
    #[default]
    PairedT,
    /// Resample pairs with replacement.
    Bootstrap {
        /// Number of resamples.
        n_resamples: usize,
        /// Interval construction from the resampled means.
        #[serde(default)]
        method: BootstrapCiMethod,
    },
}

/// Effect estimation settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EffectConfig {
    /// Two-sided interval coverage, in (0, 1).
    pub confidence_level: f64,
    /// Interval construction.
    pub interval: IntervalMethod,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self { confidence_level: 0.95, interval: IntervalMethod::PairedT }
    }
}

impl EffectConfig {
    /// Range checks.
    pub fn validate(&self) -> Result<()> {
        let level = self.confidence_level;
        if !(level.is_finite() && level > 0.0 && level < 1.0) {
            return Err(Error::Validation(format!(
                "confidence_level must be in (0,1), got {level}"
            )));
        }
        if let IntervalMethod::Bootstrap { n_resamples, .. } = self.interval {
            if n_resamples < 2 {
                return Err(Error::Validation(format!(
                    "n_resamples must be >= 2, got {n_resamples}"
                )));
            }
        }
        Ok(())
    }
}

/// ATT with its interval and the sample it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectEstimate {
    /// Mean paired difference.
    pub att: f64,
    /// Standard error of `att`.
    pub std_error: f64,
    /// Lower interval bound.
    pub ci_lower: f64,
    /// Upper interval bound.
    pub ci_upper: f64,
    /// Interval coverage.
    pub confidence_level: f64,
    /// Interval construction used.
    pub interval_method: IntervalMethod,
    /// Treated units offered for matching.
    pub n_treated: usize,
    /// Matched pairs.
    pub n_matched: usize,
    /// Treated units without a match.
    pub n_dropped: usize,
    /// Distinct controls among the pairs.
    pub n_distinct_controls: usize,
    /// Controls offered for matching.
    pub n_controls: usize,
    /// Covariates the propensity model was fit on.
    pub adjustment_set: AdjustmentSet,
}

/// Mean of `treated_outcome - control_outcome` over the matched pairs.
///
/// `seed` drives the bootstrap; resample `b` uses `seed + b`. Fails with
/// [`Error::Estimation`] when there are no pairs. A single pair yields a
/// zero-width interval.
pub fn estimate_att(
    pairs: &MatchedPairSet,
    adjustment: &AdjustmentSet,
    config: &EffectConfig,
    seed: u64,
) -> Result<EffectEstimate> {
    config.validate()?;
    let diffs = pairs.differences();
    if diffs.is_empty() {
        return Err(Error::Estimation("no matched pairs to estimate the ATT from".into()));
    }
    if diffs.iter().any(|d| !d.is_finite()) {
        return Err(Error::Estimation("non-finite paired difference".into()));
    }

    let n = diffs.len();
    let att = mean(&diffs);
    let (std_error, ci_lower, ci_upper) = if n == 1 {
        tracing::warn!("single matched pair; confidence interval is degenerate");
        (0.0, att, att)
    } else {
        match config.interval {
            IntervalMethod::PairedT => paired_t(&diffs, att, config.confidence_level)?,
            IntervalMethod::Bootstrap { n_resamples, method } => {
                let level = config.confidence_level;
                let ci = mean_difference_interval(&diffs, n_resamples, method, level, seed)?;
                (ci.std_error, ci.lower, ci.upper)
            }
        }
    };

    tracing::debug!(att, std_error, ci_lower, ci_upper, n_pairs = n, "ATT estimated");

    Ok(EffectEstimate {
        att,
        std_error,
        ci_lower,
        ci_upper,
        confidence_level: config.confidence_level,
        interval_method: config.interval,
        n_treated: pairs.n_treated,
        n_matched: n,
        n_dropped: pairs.n_dropped(),
        n_distinct_controls: pairs.n_distinct_controls,
        n_controls: pairs.n_controls,
        adjustment_set: adjustment.clone(),
    })
}

fn paired_t(diffs: &[f64], att: f64, level: f64) -> Result<(f64, f64, f64)> {
    let n = diffs.len() as f64;
    let se = (sample_variance(diffs) / n).sqrt();
    let t = StudentsT::new(0.0, 1.0, n - 1.0)
        .map_err(|e| Error::Estimation(format!("t distribution: {e}")))?;
    let q = t.inverse_cdf(0.5 + level / 2.0);
    Ok((se, att - q * se, att + q * se))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::MatchedPair;
    use approx::assert_relative_eq;

    fn pair_set(diffs: &[f64]) -> MatchedPairSet {
        let pairs: Vec<MatchedPair> = diffs
            .iter()
            .enumerate()
            .map(|(i, &d)| MatchedPair {
                treated_id: i as u64,
                control_id: 1000 + i as u64,
                treated_outcome: 10.0 + d,
                control_outcome: 10.0,
                distance: 0.0,
            })
            .collect();
        MatchedPairSet {
            n_treated: pairs.len() + 1,
            n_controls: 2 * pairs.len(),
            n_dropped_caliper: 1,
            n_dropped_exhausted: 0,
            n_distinct_controls: pairs.len(),
            replacement: false,
            pairs,
        }
    }

    #[test]
    fn paired_t_interval_matches_hand_computation() {
        // diffs 1..=5: mean 3, sd sqrt(2.5), se sqrt(0.5), t_{4,0.975} = 2.776445
        let set = pair_set(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let est =
            estimate_att(&set, &AdjustmentSet::new(["x"]), &EffectConfig::default(), 0).unwrap();
        assert_relative_eq!(est.att, 3.0);
        assert_relative_eq!(est.std_error, 0.5f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(est.ci_upper - est.att, 2.776445 * 0.5f64.sqrt(), epsilon = 1e-5);
        assert_relative_eq!(est.att - est.ci_lower, est.ci_upper - est.att, epsilon = 1e-12);
        assert_eq!((est.n_treated, est.n_matched, est.n_dropped, est.n_controls), (6, 5, 1, 10));
    }

    #[test]
    fn empty_pairs_are_an_estimation_error() {
        let err =
            estimate_att(&pair_set(&[]), &AdjustmentSet::default(), &EffectConfig::default(), 0)
                .unwrap_err();
        assert!(matches!(err, Error::Estimation(_)));
    }

    #[test]
    fn single_pair_gives_degenerate_interval() {
        let est =
            estimate_att(&pair_set(&[7.0]), &AdjustmentSet::default(), &EffectConfig::default(), 0)
                .unwrap();
        assert_eq!((est.att, est.ci_lower, est.ci_upper, est.std_error), (7.0, 7.0, 7.0, 0.0));
    }

    #[test]
    fn bootstrap_is_seeded_and_brackets_the_estimate() {
        let diffs: Vec<f64> = (0..200).map(|i| 100.0 + ((i * 37) % 21) as f64 - 10.0).collect();
        let set = pair_set(&diffs);
        for method in [BootstrapCiMethod::Percentile, BootstrapCiMethod::Bca] {
            let config = EffectConfig {
                interval: IntervalMethod::Bootstrap { n_resamples: 400, method },
                ..Default::default()
            };
            let a = estimate_att(&set, &AdjustmentSet::default(), &config, 11).unwrap();
            let b = estimate_att(&set, &AdjustmentSet::default(), &config, 11).unwrap();
            assert_eq!(a, b);
            assert!(a.ci_lower < a.att && a.att < a.ci_upper, "{a:?}");
            // Bootstrap SE of a mean is close to the analytic one.
            let analytic = (sample_variance(&diffs) / diffs.len() as f64).sqrt();
            assert_relative_eq!(a.std_error, analytic, max_relative = 0.25);
        }
    }

    #[test]
    fn bca_on_two_pairs_is_an_interval_not_an_error() {
        let config = EffectConfig {
            interval: IntervalMethod::Bootstrap {
                n_resamples: 200,
                method: BootstrapCiMethod::Bca,
            },
            ..Default::default()
        };
        let est =
            estimate_att(&pair_set(&[1.0, 3.0]), &AdjustmentSet::default(), &config, 5).unwrap();
        assert_eq!(est.att, 2.0);
        assert!(est.ci_lower <= est.att && est.att <= est.ci_upper, "{est:?}");
        assert!(est.ci_lower >= 1.0 && est.ci_upper <= 3.0, "{est:?}");
    }

    #[test]
    fn config_ranges_are_checked() {
        assert!(EffectConfig { confidence_level: 1.0, ..Default::default() }.validate().is_err());
        let config = EffectConfig {
            interval: IntervalMethod::Bootstrap { n_resamples: 1, method: BootstrapCiMethod::Bca },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn interval_method_serializes_as_tagged_map() {
        let method = IntervalMethod::Bootstrap { n_resamples: 10, method: BootstrapCiMethod::Bca };
        let json = serde_json::to_string(&method).unwrap();
        assert_eq!(json, r#"{"kind":"bootstrap","n_resamples":10,"method":"bca"}"#);
        let back: IntervalMethod = serde_json::from_str(r#"{"kind":"paired_t"}"#).unwrap();
        assert_eq!(back, IntervalMethod::PairedT);
    }
}
