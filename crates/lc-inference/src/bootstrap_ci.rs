//! Bootstrap interval for the mean paired difference.
//!
//! Pairs are resampled with replacement; resample `b` draws from
//! `StdRng::seed_from_u64(seed + b)` so the interval does not depend on the
//! rayon thread count. BCa follows Efron (1987) with the acceleration taken
//! from the leave-one-out means of the differences.

use lc_core::math::{mean, sample_variance};
use lc_core::{Error, Result};
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Keeps adjusted quantile levels off 0 and 1.
const LEVEL_FLOOR: f64 = 1e-12;

/// How the interval is read off the resampled means.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapCiMethod {
    /// Equal-tailed quantiles of the resampled means.
    #[default]
    Percentile,
    /// Bias-corrected and accelerated quantiles.
    Bca,
}

/// BCa correction constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BcaDiagnostics {
    /// Bias correction: `Φ⁻¹` of the share of resampled means below the ATT.
    pub z0: f64,
    /// Jackknife acceleration.
    pub acceleration: f64,
}

/// Bootstrap interval around the mean paired difference.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapInterval {
    /// Lower bound.
    pub lower: f64,
    /// Upper bound.
    pub upper: f64,
    /// Standard deviation of the resampled means.
    pub std_error: f64,
    /// Present for [`BootstrapCiMethod::Bca`].
    pub bca: Option<BcaDiagnostics>,
}

/// Interval for `mean(diffs)` at `confidence_level` from `n_resamples`
/// resampled means. Needs at least two differences.
pub fn mean_difference_interval(
    diffs: &[f64],
    n_resamples: usize,
    method: BootstrapCiMethod,
    confidence_level: f64,
    seed: u64,
) -> Result<BootstrapInterval> {
    if !(confidence_level.is_finite() && confidence_level > 0.0 && confidence_level < 1.0) {
        return Err(Error::Validation(format!(
            "confidence_level must be in (0,1), got {confidence_level}"
        )));
    }
    if n_resamples < 2 {
        return Err(Error::Validation(format!("n_resamples must be >= 2, got {n_resamples}")));
    }
    if diffs.len() < 2 {
        return Err(Error::Estimation(format!(
            "bootstrap needs at least 2 paired differences, got {}",
            diffs.len()
        )));
    }

    let att = mean(diffs);
    let mut means = resampled_means(diffs, n_resamples, seed);
    let std_error = sample_variance(&means).sqrt();
    means.sort_by(f64::total_cmp);

    let tail = (1.0 - confidence_level) / 2.0;
    let (lo_level, hi_level, bca) = match method {
        BootstrapCiMethod::Percentile => (tail, 1.0 - tail, None),
        BootstrapCiMethod::Bca => {
            let diag = BcaDiagnostics {
                z0: bias_correction(att, &means),
                acceleration: acceleration(diffs),
            };
            let lo = bca_level(tail, diag);
            let hi = bca_level(1.0 - tail, diag);
            tracing::debug!(z0 = diag.z0, acceleration = diag.acceleration, lo, hi, "BCa levels");
            (lo, hi, Some(diag))
        }
    };

    Ok(BootstrapInterval {
        lower: interpolate(&means, lo_level),
        upper: interpolate(&means, hi_level),
        std_error,
        bca,
    })
}

fn resampled_means(diffs: &[f64], n_resamples: usize, seed: u64) -> Vec<f64> {
    let n = diffs.len();
    (0..n_resamples)
        .into_par_iter()
        .map(|b| {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(b as u64));
            (0..n).map(|_| diffs[rng.random_range(0..n)]).sum::<f64>() / n as f64
        })
        .collect()
}

/// Value at fractional rank `level·(n-1)` of sorted means.
fn interpolate(sorted: &[f64], level: f64) -> f64 {
    let pos = level.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let below = pos.floor() as usize;
    let above = (below + 1).min(sorted.len() - 1);
    let w = pos - below as f64;
    sorted[below] + w * (sorted[above] - sorted[below])
}

/// Ties with the ATT count half, which keeps `z0 = 0` for a symmetric
/// resample distribution on a lattice.
fn bias_correction(att: f64, sorted_means: &[f64]) -> f64 {
    let below = sorted_means.partition_point(|&m| m < att);
    let ties = sorted_means[below..].partition_point(|&m| m == att);
    let share = (below as f64 + 0.5 * ties as f64) / sorted_means.len() as f64;
    Normal::standard().inverse_cdf(share.clamp(LEVEL_FLOOR, 1.0 - LEVEL_FLOOR))
}

/// The leave-one-out mean without `d_i` sits `(d_i - d̄)/(n-1)` below `d̄`, so
/// the jackknife acceleration reduces to the skewness sum of the centred
/// differences. Zero when they do not vary.
fn acceleration(diffs: &[f64]) -> f64 {
    let m = mean(diffs);
    let (sum2, sum3) = diffs.iter().fold((0.0, 0.0), |(s2, s3), &d| {
        let c = d - m;
        (s2 + c * c, s3 + c * c * c)
    });
    if sum2 > 0.0 { sum3 / (6.0 * sum2.powf(1.5)) } else { 0.0 }
}

fn bca_level(level: f64, diag: BcaDiagnostics) -> f64 {
    let normal = Normal::standard();
    let z = diag.z0 + normal.inverse_cdf(level);
    let denom = 1.0 - diag.acceleration * z;
    if denom <= 0.0 {
        return 1.0 - LEVEL_FLOOR;
    }
    normal.cdf(diag.z0 + z / denom).clamp(LEVEL_FLOOR, 1.0 - LEVEL_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn two_pairs_get_a_bca_interval() {
        let ci =
            mean_difference_interval(&[1.0, 3.0], 200, BootstrapCiMethod::Bca, 0.95, 4).unwrap();
        let diag = ci.bca.unwrap();
        assert_eq!(diag.acceleration, 0.0);
        assert!(1.0 <= ci.lower && ci.lower <= 2.0 && 2.0 <= ci.upper && ci.upper <= 3.0, "{ci:?}");
    }

    #[test]
    fn acceleration_matches_leave_one_out_means() {
        let diffs = [0.0, 0.0, 0.0, 3.0, 1.5, -0.5];
        let n = diffs.len() as f64;
        let total: f64 = diffs.iter().sum();
        let loo: Vec<f64> = diffs.iter().map(|d| (total - d) / (n - 1.0)).collect();
        let loo_mean = mean(&loo);
        let s2: f64 = loo.iter().map(|t| (loo_mean - t).powi(2)).sum();
        let s3: f64 = loo.iter().map(|t| (loo_mean - t).powi(3)).sum();
        assert_relative_eq!(acceleration(&diffs), s3 / (6.0 * s2.powf(1.5)), epsilon = 1e-12);

        assert_relative_eq!(acceleration(&[0.0, 0.0, 0.0, 3.0]), 0.096225, epsilon = 1e-6);
        assert_eq!(acceleration(&[2.0, 4.0, 6.0]), 0.0);
        assert_eq!(acceleration(&[5.0; 4]), 0.0);
    }

    #[test]
    fn bca_moves_a_right_skewed_interval_up() {
        // 5 of 20 matched pairs carry the whole effect.
        let diffs: Vec<f64> = (0..20).map(|i| if i % 4 == 0 { 10.0 } else { 0.0 }).collect();
        let interval = |method| mean_difference_interval(&diffs, 2000, method, 0.95, 17).unwrap();
        let pct = interval(BootstrapCiMethod::Percentile);
        let bca = interval(BootstrapCiMethod::Bca);
        assert_eq!(pct.std_error, bca.std_error);
        assert!(bca.bca.unwrap().acceleration > 0.0);
        assert!(bca.lower >= pct.lower && bca.upper >= pct.upper, "{pct:?} {bca:?}");
        assert!(pct.lower < 2.5 && 2.5 < pct.upper);
    }

    #[test]
    fn percentile_bounds_stay_inside_the_observed_range() {
        let diffs: Vec<f64> = (0..50).map(|i| ((i * 13) % 17) as f64).collect();
        let method = BootstrapCiMethod::Percentile;
        let interval = || mean_difference_interval(&diffs, 500, method, 0.9, 3).unwrap();
        let ci = interval();
        let att = mean(&diffs);
        assert!(ci.bca.is_none());
        assert!(0.0 <= ci.lower && ci.lower < att && att < ci.upper && ci.upper <= 16.0);
        assert_eq!(ci, interval());
    }

    #[test]
    fn rejects_bad_settings() {
        let d = [1.0, 2.0, 3.0];
        assert!(matches!(
            mean_difference_interval(&d, 100, BootstrapCiMethod::Bca, 1.0, 0),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            mean_difference_interval(&d, 1, BootstrapCiMethod::Percentile, 0.9, 0),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            mean_difference_interval(&[1.0], 100, BootstrapCiMethod::Percentile, 0.9, 0),
            Err(Error::Estimation(_))
        ));
    }
}
