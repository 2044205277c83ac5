//! Refutation checks: re-run the estimator under controlled perturbations
//! and compare with the baseline ATT.
//!
//! A check that fails its tolerance is a result (`passed == false`), never an
//! error. Errors are reserved for perturbed runs that cannot be estimated at
//! all, and come back as [`Error::Refutation`] naming the check.
//! [`refute_each`] keeps the verdicts of the checks that did finish.

use lc_core::{CohortTable, Covariate, Error, Result};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::effect::EffectEstimate;
use crate::graph::CausalGraph;
use crate::pipeline::CausalEstimator;

/// Name of the covariate injected by the random-common-cause check.
pub const RANDOM_COMMON_CAUSE: &str = "random_common_cause";

const PLACEBO_SEED_OFFSET: u64 = 0x1001;
const COMMON_CAUSE_SEED_OFFSET: u64 = 0x2002;
const SUBSET_SEED_OFFSET: u64 = 0x3003;

/// Allowed deviation from the expected effect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tolerance {
    /// Fraction of `|baseline ATT|`.
    Relative(f64),
    /// Fixed effect units.
    Absolute(f64),
    /// Multiple of the perturbed estimate's standard error.
    StandardErrors(f64),
}

impl Tolerance {
    /// `scale` widens the sample-size-free tolerances for subsets.
    fn threshold(self, baseline: f64, perturbed_std_error: f64, scale: f64) -> f64 {
        match self {
            Tolerance::Relative(r) => r * baseline.abs() * scale,
            Tolerance::Absolute(a) => a * scale,
            Tolerance::StandardErrors(z) => z * perturbed_std_error,
        }
    }

    fn validate(self) -> Result<()> {
        let v = match self {
            Tolerance::Relative(v) | Tolerance::Absolute(v) | Tolerance::StandardErrors(v) => v,
        };
        if v.is_finite() && v >= 0.0 {
            Ok(())
        } else {
            Err(Error::Validation(format!("tolerance must be finite and >= 0, got {v}")))
        }
    }
}

fn placebo_tolerance() -> Tolerance {
    Tolerance::StandardErrors(3.0)
}

fn stable_tolerance() -> Tolerance {
    Tolerance::Relative(0.05)
}

fn subset_fraction() -> f64 {
    0.9
}

/// Supported refutation checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefutationCheck {
    /// Replace treatment with Bernoulli draws at the observed rate; the
    /// effect should vanish.
    PlaceboTreatment {
        /// Allowed `|new ATT|`.
        #[serde(default = "placebo_tolerance")]
        tolerance: Tolerance,
    },
    /// Add an independent standard-normal common cause; the effect should
    /// not move.
    RandomCommonCause {
        /// Allowed `|new - baseline|`.
        #[serde(default = "stable_tolerance")]
        tolerance: Tolerance,
    },
    /// Re-estimate on a random subset of units; the effect should not move
    /// beyond sampling noise.
    DataSubset {
        /// Fraction of units kept, in (0, 1].
        #[serde(default = "subset_fraction")]
        fraction: f64,
        /// Allowed `|new - baseline|` at the full sample size. Relative and
        /// absolute tolerances are scaled by `1/√fraction`.
        #[serde(default = "stable_tolerance")]
        tolerance: Tolerance,
    },
}

impl RefutationCheck {
    /// Placebo treatment allowing three standard errors of the placebo ATT.
    pub fn placebo() -> Self {
        RefutationCheck::PlaceboTreatment { tolerance: placebo_tolerance() }
    }

    /// Random common cause with the default 5% relative tolerance.
    pub fn random_common_cause() -> Self {
        RefutationCheck::RandomCommonCause { tolerance: stable_tolerance() }
    }

    /// 90% subset with the default 5% relative tolerance.
    pub fn data_subset() -> Self {
        RefutationCheck::DataSubset { fraction: subset_fraction(), tolerance: stable_tolerance() }
    }

    /// All three checks with defaults.
    pub fn all() -> Vec<Self> {
        vec![Self::placebo(), Self::random_common_cause(), Self::data_subset()]
    }

    /// Stable identifier used in reports and errors.
    pub fn name(&self) -> &'static str {
        match self {
            RefutationCheck::PlaceboTreatment { .. } => "placebo_treatment",
            RefutationCheck::RandomCommonCause { .. } => "random_common_cause",
            RefutationCheck::DataSubset { .. } => "data_subset",
        }
    }

    /// Range checks.
    pub fn validate(&self) -> Result<()> {
        match *self {
            RefutationCheck::PlaceboTreatment { tolerance }
            | RefutationCheck::RandomCommonCause { tolerance } => tolerance.validate(),
            RefutationCheck::DataSubset { fraction, tolerance } => {
                if !(fraction.is_finite() && fraction > 0.0 && fraction <= 1.0) {
                    return Err(Error::Validation(format!(
                        "subset fraction must be in (0,1], got {fraction}"
                    )));
                }
                tolerance.validate()
            }
        }
    }

    fn seed_offset(&self) -> u64 {
        match self {
            RefutationCheck::PlaceboTreatment { .. } => PLACEBO_SEED_OFFSET,
            RefutationCheck::RandomCommonCause { .. } => COMMON_CAUSE_SEED_OFFSET,
            RefutationCheck::DataSubset { .. } => SUBSET_SEED_OFFSET,
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefutationResult {
    /// Check name.
    pub check: String,
    /// Baseline ATT.
    pub baseline: f64,
    /// ATT under the perturbation.
    pub new_effect: f64,
    /// Effect expected under the perturbation.
    pub expected: f64,
    /// `|new_effect - expected|`.
    pub deviation: f64,
    /// Largest deviation that passes.
    pub threshold: f64,
    /// `deviation <= threshold`.
    pub passed: bool,
}

/// Verdicts of a refutation pass that may have stopped short on some checks.
#[derive(Debug, Default)]
pub struct RefutationOutcome {
    /// Checks that reached a verdict, in configured order.
    pub results: Vec<RefutationResult>,
    /// Checks whose perturbed run errored, as [`Error::Refutation`], in
    /// configured order.
    pub errors: Vec<Error>,
}

impl RefutationOutcome {
    /// All verdicts, or the first error.
    pub fn into_result(self) -> Result<Vec<RefutationResult>> {
        match self.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self.results),
        }
    }
}

/// Run `checks` against `baseline`, in parallel, results in `checks` order.
/// Fails on the first check whose perturbed run errors.
///
/// Check `c` draws from `StdRng::seed_from_u64(seed + offset(c))` with a
/// fixed per-kind offset, so results do not depend on which other checks
/// are configured.
pub fn refute(
    estimator: &CausalEstimator,
    graph: &CausalGraph,
    table: &CohortTable,
    baseline: &EffectEstimate,
    checks: &[RefutationCheck],
    seed: u64,
) -> Result<Vec<RefutationResult>> {
    refute_each(estimator, graph, table, baseline, checks, seed)?.into_result()
}

/// Like [`refute`], but a perturbed run that errors only removes its own
/// check from the verdicts. Invalid checks are still an error up front.
pub fn refute_each(
    estimator: &CausalEstimator,
    graph: &CausalGraph,
    table: &CohortTable,
    baseline: &EffectEstimate,
    checks: &[RefutationCheck],
    seed: u64,
) -> Result<RefutationOutcome> {
    for check in checks {
        check.validate()?;
    }
    let runs: Vec<Result<RefutationResult>> = checks
        .par_iter()
        .map(|check| {
            let check_seed = seed.wrapping_add(check.seed_offset());
            run_check(estimator, graph, table, baseline.att, check, check_seed)
                .map_err(|e| Error::refutation(check.name(), e))
        })
        .collect();

    let mut outcome = RefutationOutcome::default();
    for run in runs {
        match run {
            Ok(r) if r.passed => {
                tracing::info!(
                    check = %r.check,
                    new_effect = r.new_effect,
                    deviation = r.deviation,
                    "refutation passed"
                );
                outcome.results.push(r);
            }
            Ok(r) => {
                tracing::warn!(
                    check = %r.check,
                    new_effect = r.new_effect,
                    deviation = r.deviation,
                    threshold = r.threshold,
                    "refutation failed"
                );
                outcome.results.push(r);
            }
            Err(err) => {
                tracing::warn!(error = %err, "refutation run errored");
                outcome.errors.push(err);
            }
        }
    }
    Ok(outcome)
}

fn run_check(
    estimator: &CausalEstimator,
    graph: &CausalGraph,
    table: &CohortTable,
    baseline: f64,
    check: &RefutationCheck,
    seed: u64,
) -> Result<RefutationResult> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let (new_effect, expected, threshold) = match *check {
        RefutationCheck::PlaceboTreatment { tolerance } => {
            let rate = table.treatment_rate();
            let placebo: Vec<bool> = (0..table.len()).map(|_| rng.random_bool(rate)).collect();
            let perturbed = table.with_treatment(&placebo)?;
            let run = estimator.estimate(graph, &perturbed, seed)?;
            (run.effect.att, 0.0, tolerance.threshold(baseline, run.effect.std_error, 1.0))
        }
        RefutationCheck::RandomCommonCause { tolerance } => {
            let noise: Vec<f64> =
                (0..table.len()).map(|_| StandardNormal.sample(&mut rng)).collect();
            let perturbed =
                table.with_covariate(Covariate::numeric(RANDOM_COMMON_CAUSE), &noise)?;
            let widened = graph.with_common_cause(RANDOM_COMMON_CAUSE)?;
            let run = estimator.estimate(&widened, &perturbed, seed)?;
            (run.effect.att, baseline, tolerance.threshold(baseline, run.effect.std_error, 1.0))
        }
        RefutationCheck::DataSubset { fraction, tolerance } => {
            let n = table.len();
            let k = ((fraction * n as f64).round() as usize).min(n);
            let mut keep = rand::seq::index::sample(&mut rng, n, k).into_vec();
            keep.sort_unstable();
            let perturbed = table.subset(&keep)?;
            let run = estimator.estimate(graph, &perturbed, seed)?;
            let scale = 1.0 / fraction.sqrt();
            (run.effect.att, baseline, tolerance.threshold(baseline, run.effect.std_error, scale))
        }
    };

    let deviation = (new_effect - expected).abs();
    tracing::debug!(
        check = check.name(),
        new_effect,
        expected,
        deviation,
        threshold,
        "refutation run"
    );
    Ok(RefutationResult {
        check: check.name().to_string(),
        baseline,
        new_effect,
        expected,
        deviation,
        threshold,
        passed: deviation <= threshold,
    })
}
