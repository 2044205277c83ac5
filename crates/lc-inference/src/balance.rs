//! Covariate balance diagnostics (standardized mean differences).
//!
//! SMD = (mean_treated - mean_control) / sqrt((var_treated + var_control) / 2),
//! computed on the full sample and on the matched sample (controls counted
//! once per pair they appear in). Categorical covariates get one row per
//! level indicator.

use std::collections::HashMap;

use lc_core::math::{mean, sample_variance};
use lc_core::{CohortTable, CovariateKind, Error, Result, UnitRecord};
use serde::{Deserialize, Serialize};

use crate::identify::AdjustmentSet;
use crate::matching::MatchedPairSet;

/// Balance of one design covariate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    /// Covariate (or `name=level` for a categorical indicator).
    pub covariate: String,
    /// SMD over all treated vs all controls.
    pub smd_before: f64,
    /// SMD over matched treated vs their matched controls.
    pub smd_after: f64,
}

/// SMD for every adjustment covariate. Covariates absent from the table are
/// an [`Error::Validation`].
pub fn covariate_balance(
    table: &CohortTable,
    adjustment: &AdjustmentSet,
    matched: &MatchedPairSet,
) -> Result<Vec<BalanceRow>> {
    let by_id: HashMap<u64, &UnitRecord> = table.units().iter().map(|u| (u.user_id, u)).collect();
    let lookup = |id: u64| {
        by_id
            .get(&id)
            .copied()
            .ok_or_else(|| {
                Error::Validation(format!("matched user_id {id} not in the cohort table"))
            })
    };
    let matched_t: Vec<&UnitRecord> =
        matched.pairs.iter().map(|p| lookup(p.treated_id)).collect::<Result<_>>()?;
    let matched_c: Vec<&UnitRecord> =
        matched.pairs.iter().map(|p| lookup(p.control_id)).collect::<Result<_>>()?;
    let all_t: Vec<&UnitRecord> = table.treated().collect();
    let all_c: Vec<&UnitRecord> = table.controls().collect();

    let mut rows = Vec::new();
    for name in adjustment.iter() {
        let col = table
            .covariate_index(name)
            .ok_or_else(|| {
                Error::Validation(format!("covariate '{name}' not in the cohort table"))
            })?;
        match table.covariates()[col].kind {
            CovariateKind::Numeric => {
                let value = |u: &UnitRecord| u.covariates[col];
                rows.push(row(name.to_string(), &value, &all_t, &all_c, &matched_t, &matched_c));
            }
            CovariateKind::Categorical => {
                let mut levels = table.column(col);
                levels.sort_by(f64::total_cmp);
                levels.dedup();
                for level in levels {
                    let value = |u: &UnitRecord| if u.covariates[col] == level { 1.0 } else { 0.0 };
                    let label = format!("{name}={level}");
                    rows.push(row(label, &value, &all_t, &all_c, &matched_t, &matched_c));
                }
            }
        }
    }
    Ok(rows)
}

fn row(
    covariate: String,
    value: &dyn Fn(&UnitRecord) -> f64,
    all_t: &[&UnitRecord],
    all_c: &[&UnitRecord],
    matched_t: &[&UnitRecord],
    matched_c: &[&UnitRecord],
) -> BalanceRow {
    let collect = |units: &[&UnitRecord]| units.iter().map(|u| value(u)).collect::<Vec<f64>>();
    BalanceRow {
        covariate,
        smd_before: smd(&collect(all_t), &collect(all_c)),
        smd_after: smd(&collect(matched_t), &collect(matched_c)),
    }
}

/// Standardized mean difference; 0 when both groups are constant and equal.
pub fn smd(treated: &[f64], control: &[f64]) -> f64 {
    let diff = mean(treated) - mean(control);
    let var_t = if treated.len() < 2 { 0.0 } else { sample_variance(treated) };
    let var_c = if control.len() < 2 { 0.0 } else { sample_variance(control) };
    let pooled = ((var_t + var_c) / 2.0).sqrt();
    if pooled > 0.0 {
        diff / pooled
    } else if diff == 0.0 {
        0.0
    } else {
        diff.signum() * f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::{MatchPolicy, ScoredUnit, match_units};
    use approx::assert_relative_eq;
    use lc_core::Covariate;

    #[test]
    fn smd_of_shifted_groups() {
        let t = [1.0, 2.0, 3.0];
        let c = [0.0, 1.0, 2.0];
        assert_relative_eq!(smd(&t, &c), 1.0);
        assert_eq!(smd(&[1.0, 1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn matching_on_the_covariate_improves_balance() {
        // Treated sit at high x; controls cover the whole range on a grid
        // twice as fine, so every treated x has a control at the same x.
        let mut units = Vec::new();
        for i in 0..10u64 {
            units.push(UnitRecord {
                user_id: i,
                treatment: true,
                covariates: vec![5.0 + i as f64 * 0.1, 1.0],
                outcome: 0.0,
            });
        }
        for i in 0..160u64 {
            units.push(UnitRecord {
                user_id: 100 + i,
                treatment: false,
                covariates: vec![i as f64 * 0.05, (i % 2) as f64],
                outcome: 0.0,
            });
        }
        let covariates = vec![Covariate::numeric("x"), Covariate::categorical("g")];
        let table = CohortTable::new(covariates, units).unwrap();

        // Use x itself (rescaled into [0, 1]) as the score.
        let score = |u: &UnitRecord| u.covariates[0] / 10.0;
        let treated: Vec<ScoredUnit<'_>> =
            table.treated().map(|u| ScoredUnit { unit: u, score: score(u) }).collect();
        let controls: Vec<ScoredUnit<'_>> =
            table.controls().map(|u| ScoredUnit { unit: u, score: score(u) }).collect();
        let policy = MatchPolicy { caliper: None, ..MatchPolicy::default() };
        let matched = match_units(&treated, &controls, &policy).unwrap();
        assert_eq!(matched.n_matched(), 10);

        let rows = covariate_balance(&table, &AdjustmentSet::new(["x", "g"]), &matched).unwrap();
        let labels: Vec<&str> = rows.iter().map(|r| r.covariate.as_str()).collect();
        assert_eq!(labels, vec!["g=0", "g=1", "x"]);
        let x = &rows[2];
        assert!(x.smd_before > 0.5, "{x:?}");
        assert!(x.smd_after.abs() < 1e-6, "{x:?}");
        assert!(x.smd_after.abs() < x.smd_before.abs(), "{x:?}");
    }
}
