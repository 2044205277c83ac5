//! Propensity scores via logistic regression.
//!
//! Treatment is regressed on the adjustment-set covariates with an intercept,
//! by Newton–Raphson (IRLS) on standardized design columns. Categorical
//! covariates are one-hot encoded against their smallest observed level.
//! The start point is fixed (β = 0), so fitting is deterministic.

use lc_core::math::{log1pexp, sigmoid};
use lc_core::{CohortTable, CovariateKind, Error, Result, UnitRecord};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::identify::AdjustmentSet;

/// Linear predictor magnitude beyond which the fit is treated as
/// (quasi-)separated: probabilities are within ~1e-13 of 0 or 1.
const SEPARATION_ETA: f64 = 30.0;

/// Relative threshold on singular values of XᵀX for the rank check.
const RANK_RTOL: f64 = 1e-10;

/// Optimizer settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PropensityConfig {
    /// Newton iteration cap; exceeding it is an [`Error::Estimation`].
    pub max_iter: usize,
    /// Convergence threshold on the largest coefficient update.
    pub tolerance: f64,
}

impl Default for PropensityConfig {
    fn default() -> Self {
        Self { max_iter: 100, tolerance: 1e-8 }
    }
}

impl PropensityConfig {
    /// Range checks.
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(Error::Validation("propensity.max_iter must be > 0".into()));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(Error::Validation(format!(
                "propensity.tolerance must be finite and > 0, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum FeatureKind {
    Value,
    Level(f64),
}

/// One standardized design column derived from a table covariate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Feature {
    name: String,
    column: usize,
    kind: FeatureKind,
    mean: f64,
    scale: f64,
}

impl Feature {
    #[inline]
    fn raw(&self, unit: &UnitRecord) -> f64 {
        let v = unit.covariates[self.column];
        match self.kind {
            FeatureKind::Value => v,
            FeatureKind::Level(level) => {
                if v == level {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    #[inline]
    fn standardized(&self, unit: &UnitRecord) -> f64 {
        (self.raw(unit) - self.mean) / self.scale
    }
}

/// Fitted propensity model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropensityModel {
    adjustment_set: AdjustmentSet,
    columns: Vec<String>,
    features: Vec<Feature>,
    /// Intercept first, then one coefficient per standardized feature.
    coefficients: Vec<f64>,
    n_iter: usize,
    converged: bool,
    near_separation: bool,
    nll: f64,
}

/// Scores for every unit of a table, in table order.
#[derive(Debug, Clone, PartialEq)]
pub struct PropensityScores {
    /// P(treatment = 1 | covariates), one per unit.
    pub scores: Vec<f64>,
    /// Count of scores equal to exactly 0 or 1.
    pub n_extreme: usize,
}

/// Summary of a propensity fit for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropensitySummary {
    /// Newton iterations used.
    pub n_iter: usize,
    /// Coefficient updates fell below tolerance.
    pub converged: bool,
    /// The fit stopped on (quasi-)complete separation.
    pub near_separation: bool,
    /// Scores equal to exactly 0 or 1.
    pub n_extreme_scores: usize,
    /// Smallest score.
    pub min_score: f64,
    /// Largest score.
    pub max_score: f64,
    /// Negative log-likelihood at the solution.
    pub nll: f64,
}

impl PropensityModel {
    /// Fit `P(treatment | adjustment-set covariates)` on `table`.
    ///
    /// Fails with [`Error::Estimation`] when the table is empty, treatment is
    /// constant, an adjustment variable is not a table column, the design is
    /// rank-deficient, or Newton iteration does not converge within
    /// `config.max_iter`.
    pub fn fit(
        table: &CohortTable,
        adjustment: &AdjustmentSet,
        config: &PropensityConfig,
    ) -> Result<Self> {
        config.validate()?;
        let n = table.len();
        if n == 0 {
            return Err(Error::Estimation("cannot fit propensity model on an empty table".into()));
        }
        let n_treated = table.n_treated();
        if n_treated == 0 || n_treated == n {
            return Err(Error::Estimation(format!(
                "treatment is constant across all {n} units; nothing to model"
            )));
        }

        let features = build_features(table, adjustment)?;
        let p = features.len() + 1;
        let x = DMatrix::from_fn(n, p, |i, j| {
            if j == 0 { 1.0 } else { features[j - 1].standardized(&table.units()[i]) }
        });
        let y = DVector::from_iterator(
            n,
            table.units().iter().map(|u| if u.treatment { 1.0 } else { 0.0 }),
        );

        check_rank(&x, &features)?;

        let mut beta = DVector::<f64>::zeros(p);
        let mut converged = false;
        let mut near_separation = false;
        let mut n_iter = 0;

        while n_iter < config.max_iter {
            n_iter += 1;
            let eta = &x * &beta;
            let mu = eta.map(sigmoid);
            let w = mu.map(|m| m * (1.0 - m));
            let grad = x.transpose() * (&y - &mu);
            let xw = DMatrix::from_fn(n, p, |i, j| x[(i, j)] * w[i]);
            let hessian = x.transpose() * xw;

            let chol = hessian.cholesky().ok_or_else(|| {
                Error::Estimation(format!(
                    "propensity Newton system is singular at iteration {n_iter}"
                ))
            })?;
            let delta = chol.solve(&grad);
            if delta.iter().any(|v| !v.is_finite()) {
                return Err(Error::Estimation(format!(
                    "non-finite propensity update at iteration {n_iter}"
                )));
            }
            beta += &delta;

            if delta.amax() < config.tolerance {
                converged = true;
                break;
            }
            if (&x * &beta).amax() > SEPARATION_ETA {
                near_separation = true;
                break;
            }
        }

        if !converged && !near_separation {
            return Err(Error::Estimation(format!(
                "propensity fit did not converge within {} iterations",
                config.max_iter
            )));
        }
        if near_separation {
            tracing::warn!(
                n_iter,
                "treatment is (quasi-)separated by the adjustment covariates; scores near 0/1"
            );
        }

        let eta = &x * &beta;
        let nll: f64 = eta.iter().zip(y.iter()).map(|(&e, &yi)| log1pexp(e) - yi * e).sum();
        tracing::debug!(n_iter, converged, nll, "propensity model fitted");

        Ok(Self {
            adjustment_set: adjustment.clone(),
            columns: table.covariates().iter().map(|c| c.name.clone()).collect(),
            features,
            coefficients: beta.iter().copied().collect(),
            n_iter,
            converged,
            near_separation,
            nll,
        })
    }

    /// Propensity score of one unit, in [0, 1].
    ///
    /// `unit` must come from a table with the same covariate columns as the
    /// one the model was fitted on; use [`PropensityModel::score_all`] when
    /// that is not guaranteed.
    pub fn score(&self, unit: &UnitRecord) -> f64 {
        let eta = self.coefficients[0]
            + self
                .features
                .iter()
                .zip(&self.coefficients[1..])
                .map(|(f, &b)| b * f.standardized(unit))
                .sum::<f64>();
        sigmoid(eta)
    }

    /// Scores for every unit of `table`, checking its column layout first.
    pub fn score_all(&self, table: &CohortTable) -> Result<PropensityScores> {
        let same_layout = table.covariates().len() == self.columns.len()
            && table.covariates().iter().zip(&self.columns).all(|(c, n)| &c.name == n);
        if !same_layout {
            return Err(Error::Estimation(
                "table covariate columns differ from the fitted propensity model's".into(),
            ));
        }

        let scores: Vec<f64> = table.units().iter().map(|u| self.score(u)).collect();
        let n_extreme = scores.iter().filter(|&&s| s == 0.0 || s == 1.0).count();
        if n_extreme > 0 {
            tracing::warn!(n_extreme, "propensity scores of exactly 0 or 1 (near separation)");
        }
        Ok(PropensityScores { scores, n_extreme })
    }

    /// Adjustment set the model conditions on.
    pub fn adjustment_set(&self) -> &AdjustmentSet {
        &self.adjustment_set
    }

    /// Coefficients on the standardized scale, intercept first.
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Names of the design columns after encoding (without the intercept).
    pub fn feature_names(&self) -> Vec<String> {
        self.features
            .iter()
            .map(|f| match f.kind {
                FeatureKind::Value => f.name.clone(),
                FeatureKind::Level(level) => format!("{}={level}", f.name),
            })
            .collect()
    }

    /// `true` when Newton updates fell below tolerance.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// `true` when the fit stopped on (quasi-)separation.
    pub fn near_separation(&self) -> bool {
        self.near_separation
    }

    /// Fit summary combined with the score distribution.
    pub fn summary(&self, scores: &PropensityScores) -> PropensitySummary {
        let min_score = scores.scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max_score = scores.scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        PropensitySummary {
            n_iter: self.n_iter,
            converged: self.converged,
            near_separation: self.near_separation,
            n_extreme_scores: scores.n_extreme,
            min_score,
            max_score,
            nll: self.nll,
        }
    }
}

fn build_features(table: &CohortTable, adjustment: &AdjustmentSet) -> Result<Vec<Feature>> {
    let n = table.len() as f64;
    let mut features = Vec::new();
    for name in adjustment.iter() {
        let column = table.covariate_index(name).ok_or_else(|| {
            Error::Estimation(format!(
                "adjustment variable '{name}' is not a column of the cohort table"
            ))
        })?;
        let values = table.column(column);
        let kinds = match table.covariates()[column].kind {
            CovariateKind::Numeric => vec![FeatureKind::Value],
            CovariateKind::Categorical => {
                let mut levels = values.clone();
                levels.sort_by(f64::total_cmp);
                levels.dedup();
                levels.into_iter().skip(1).map(FeatureKind::Level).collect()
            }
        };
        if kinds.is_empty() {
            return Err(Error::Estimation(format!(
                "categorical covariate '{name}' has a single level; design matrix is rank-deficient"
            )));
        }

        for kind in kinds {
            let mut f = Feature { name: name.to_string(), column, kind, mean: 0.0, scale: 1.0 };
            let raw: Vec<f64> = table.units().iter().map(|u| f.raw(u)).collect();
            let mean = raw.iter().sum::<f64>() / n;
            let var = raw.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
            let scale = var.sqrt();
            if !(scale.is_finite() && scale > 1e-12 * mean.abs().max(1.0)) {
                return Err(Error::Estimation(format!(
                    "covariate '{name}' is constant; design matrix is rank-deficient"
                )));
            }
            f.mean = mean;
            f.scale = scale;
            features.push(f);
        }
    }
    Ok(features)
}

fn check_rank(x: &DMatrix<f64>, features: &[Feature]) -> Result<()> {
    let p = x.ncols();
    let xtx = x.transpose() * x;
    let sv = xtx.svd(false, false).singular_values;
    let max = sv.max();
    let rank = sv.iter().filter(|&&s| s > max * RANK_RTOL).count();
    if rank < p {
        let names: Vec<&str> = features.iter().map(|f| f.name.as_str()).collect();
        return Err(Error::Estimation(format!(
            "adjustment covariates [{}] are perfectly collinear (design rank {rank} < {p})",
            names.join(", ")
        )));
    }
    Ok(())
}
