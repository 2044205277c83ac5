//! Pre/post aggregation of the panel around one signup month.

use std::collections::BTreeMap;

use lc_core::{CohortTable, Covariate, Error, Result, UnitRecord};
use serde::{Deserialize, Serialize};

use crate::panel::PanelRow;

/// Covariate column holding mean pre-period spend.
pub const PRE_SPEND: &str = "pre_spend";

/// Which months count as pre and post relative to the target signup month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CohortWindow {
    /// Target enrollment month; the cohort is its enrollees plus never-enrolled users.
    pub signup_month: u32,
    /// Count the signup month itself as post-period.
    pub post_includes_signup_month: bool,
}

impl Default for CohortWindow {
    fn default() -> Self {
        Self { signup_month: 3, post_includes_signup_month: false }
    }
}

impl CohortWindow {
    fn is_pre(&self, month: u32) -> bool {
        month < self.signup_month
    }

    fn is_post(&self, month: u32) -> bool {
        month > self.signup_month || (self.post_includes_signup_month && month == self.signup_month)
    }
}

/// One user of the cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortRecord {
    /// User id.
    pub user_id: u64,
    /// 0 or the target month.
    pub signup_month: u32,
    /// Enrolled in the target month.
    pub treatment: bool,
    /// Mean spend over pre-period months.
    pub pre_spend: f64,
    /// Mean spend over post-period months.
    pub post_spend: f64,
}

#[derive(Default)]
struct Acc {
    signup_month: u32,
    treatment: bool,
    pre: (f64, usize),
    post: (f64, usize),
}

/// Aggregate panel rows into one record per cohort user, ascending
/// `user_id`.
///
/// Users enrolled in another month are excluded; users with an empty pre or
/// post window are skipped. Rows that disagree on a user's enrollment are an
/// [`Error::Validation`].
pub fn prepare_cohort(rows: &[PanelRow], window: &CohortWindow) -> Result<Vec<CohortRecord>> {
    if window.signup_month == 0 {
        return Err(Error::Validation("cohort signup_month must be >= 1".into()));
    }

    let mut users: BTreeMap<u64, Acc> = BTreeMap::new();
    for row in rows {
        if row.treatment != (row.signup_month > 0) {
            return Err(Error::Validation(format!(
                "user {}: treatment flag disagrees with signup_month {}",
                row.user_id, row.signup_month
            )));
        }
        if row.signup_month != 0 && row.signup_month != window.signup_month {
            continue;
        }
        if !row.spend.is_finite() {
            return Err(Error::Validation(format!("user {}: non-finite spend", row.user_id)));
        }

        let acc = users.entry(row.user_id).or_insert_with(|| Acc {
            signup_month: row.signup_month,
            treatment: row.treatment,
            ..Acc::default()
        });
        if acc.signup_month != row.signup_month {
            return Err(Error::Validation(format!(
                "user {}: conflicting signup months {} and {}",
                row.user_id, acc.signup_month, row.signup_month
            )));
        }
        if window.is_pre(row.month) {
            acc.pre.0 += row.spend;
            acc.pre.1 += 1;
        }
        if window.is_post(row.month) {
            acc.post.0 += row.spend;
            acc.post.1 += 1;
        }
    }

    let mut skipped = 0usize;
    let records: Vec<CohortRecord> = users
        .into_iter()
        .filter_map(|(user_id, acc)| {
            if acc.pre.1 == 0 || acc.post.1 == 0 {
                skipped += 1;
                return None;
            }
            Some(CohortRecord {
                user_id,
                signup_month: acc.signup_month,
                treatment: acc.treatment,
                pre_spend: acc.pre.0 / acc.pre.1 as f64,
                post_spend: acc.post.0 / acc.post.1 as f64,
            })
        })
        .collect();

    if skipped > 0 {
        tracing::warn!(
            skipped,
            signup_month = window.signup_month,
            "users with an empty pre or post window skipped"
        );
    }
    tracing::debug!(
        n_users = records.len(),
        n_treated = records.iter().filter(|r| r.treatment).count(),
        "cohort prepared"
    );
    Ok(records)
}

/// Cohort as an estimation table: covariate `pre_spend`, outcome
/// `post_spend`.
pub fn cohort_table(records: &[CohortRecord]) -> Result<CohortTable> {
    let units = records
        .iter()
        .map(|r| UnitRecord {
            user_id: r.user_id,
            treatment: r.treatment,
            covariates: vec![r.pre_spend],
            outcome: r.post_spend,
        })
        .collect();
    CohortTable::new(vec![Covariate::numeric(PRE_SPEND)], units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::{SimulationConfig, simulate_panel};
    use approx::assert_relative_eq;

    fn row(user_id: u64, signup_month: u32, month: u32, spend: f64) -> PanelRow {
        PanelRow { user_id, signup_month, month, spend, treatment: signup_month > 0 }
    }

    fn hand_panel() -> Vec<PanelRow> {
        let mut rows = Vec::new();
        for month in 1..=5 {
            rows.push(row(1, 3, month, f64::from(month) * 10.0));
            rows.push(row(2, 0, month, 1.0));
            rows.push(row(3, 4, month, 99.0));
        }
        rows
    }

    #[test]
    fn means_follow_the_window() {
        let records = prepare_cohort(&hand_panel(), &CohortWindow::default()).unwrap();
        assert_eq!(records.len(), 2);
        let treated = &records[0];
        assert_eq!((treated.user_id, treated.signup_month, treated.treatment), (1, 3, true));
        assert_relative_eq!(treated.pre_spend, 15.0);
        assert_relative_eq!(treated.post_spend, 45.0);
        assert_relative_eq!(records[1].post_spend, 1.0);

        let inclusive =
            CohortWindow { post_includes_signup_month: true, ..CohortWindow::default() };
        let records = prepare_cohort(&hand_panel(), &inclusive).unwrap();
        assert_relative_eq!(records[0].post_spend, 40.0);
    }

    #[test]
    fn empty_windows_are_skipped() {
        let window = CohortWindow { signup_month: 1, post_includes_signup_month: false };
        assert!(prepare_cohort(&hand_panel(), &window).unwrap().is_empty());
    }

    #[test]
    fn inconsistent_rows_are_rejected() {
        let mut rows = hand_panel();
        rows[0].treatment = false;
        let window = CohortWindow::default();
        assert!(matches!(prepare_cohort(&rows, &window), Err(Error::Validation(_))));
        let month_zero = CohortWindow { signup_month: 0, ..window };
        assert!(prepare_cohort(&hand_panel(), &month_zero).is_err());
    }

    #[test]
    fn simulated_cohort_keeps_only_relevant_users() {
        let config = SimulationConfig { num_users: 1000, ..SimulationConfig::default() };
        let rows = simulate_panel(&config, 0).unwrap();
        let records = prepare_cohort(&rows, &CohortWindow::default()).unwrap();
        assert!(!records.is_empty());
        assert!(records.iter().all(|r| r.signup_month == 0 || r.signup_month == 3));
        assert!(records.iter().any(|r| r.treatment));

        let table = cohort_table(&records).unwrap();
        assert_eq!(table.len(), records.len());
        assert_eq!(table.covariate_index(PRE_SPEND), Some(0));
    }
}
