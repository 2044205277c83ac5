//! Nearest-neighbour propensity-score matching for the ATT.
//!
//! Treated units are processed in ascending `user_id`. Each takes the
//! control minimizing `|score_t - score_c|` (controls already used are
//! skipped when matching without replacement); equidistant controls are
//! resolved by the configured [`TieBreak`]. A treated unit whose nearest
//! control lies outside the caliper is dropped and counted.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use lc_core::{Error, Result, UnitRecord};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Rule for choosing among equidistant controls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Prefer the control with the smallest `user_id`.
    #[default]
    LowestUserId,
    /// Prefer the control with the largest `user_id`.
    HighestUserId,
}

/// Matching policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchPolicy {
    /// Allow one control to serve several treated units.
    pub replacement: bool,
    /// Maximum propensity-score distance; `None` disables the caliper.
    pub caliper: Option<f64>,
    /// Equidistant-control rule.
    pub tie_break: TieBreak,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self { replacement: false, caliper: Some(0.05), tie_break: TieBreak::LowestUserId }
    }
}

impl MatchPolicy {
    /// Range checks.
    pub fn validate(&self) -> Result<()> {
        match self.caliper {
            Some(c) if !(c.is_finite() && c >= 0.0) => {
                Err(Error::Matcher(format!("caliper must be finite and >= 0, got {c}")))
            }
            _ => Ok(()),
        }
    }
}

/// A unit paired with its propensity score.
#[derive(Debug, Clone, Copy)]
pub struct ScoredUnit<'a> {
    /// The unit record.
    pub unit: &'a UnitRecord,
    /// Its propensity score.
    pub score: f64,
}

/// One treated unit and its matched control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedPair {
    /// Treated unit id.
    pub treated_id: u64,
    /// Matched control id.
    pub control_id: u64,
    /// Treated outcome.
    pub treated_outcome: f64,
    /// Control outcome.
    pub control_outcome: f64,
    /// `|score_t - score_c|`.
    pub distance: f64,
}

impl MatchedPair {
    /// Treated minus control outcome.
    #[inline]
    pub fn difference(&self) -> f64 {
        self.treated_outcome - self.control_outcome
    }
}

/// Result of matching.
///
/// `pairs.len() + n_dropped_caliper + n_dropped_exhausted == n_treated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedPairSet {
    /// Pairs in treated processing order (ascending treated `user_id`).
    pub pairs: Vec<MatchedPair>,
    /// Treated units offered for matching.
    pub n_treated: usize,
    /// Controls offered for matching.
    pub n_controls: usize,
    /// Treated units whose nearest control lay outside the caliper.
    pub n_dropped_caliper: usize,
    /// Treated units left with no unused control (without replacement only).
    pub n_dropped_exhausted: usize,
    /// Distinct controls appearing in `pairs`.
    pub n_distinct_controls: usize,
    /// Whether controls could be reused.
    pub replacement: bool,
}

impl MatchedPairSet {
    /// Number of matched treated units.
    pub fn n_matched(&self) -> usize {
        self.pairs.len()
    }

    /// Total treated units dropped for any reason.
    pub fn n_dropped(&self) -> usize {
        self.n_dropped_caliper + self.n_dropped_exhausted
    }

    /// Fraction of treated units that found a match.
    pub fn coverage(&self) -> f64 {
        if self.n_treated == 0 { 0.0 } else { self.pairs.len() as f64 / self.n_treated as f64 }
    }

    /// Paired outcome differences, in pair order.
    pub fn differences(&self) -> Vec<f64> {
        self.pairs.iter().map(MatchedPair::difference).collect()
    }
}

enum Outcome {
    Matched(MatchedPair),
    Caliper,
    Exhausted,
}

/// Match every treated unit to a control by propensity-score proximity.
///
/// Fails with [`Error::Matcher`] when either group is empty, a score is not
/// in [0, 1], or no treated unit ends up matched.
pub fn match_units(
    treated: &[ScoredUnit<'_>],
    controls: &[ScoredUnit<'_>],
    policy: &MatchPolicy,
) -> Result<MatchedPairSet> {
    policy.validate()?;
    if controls.is_empty() {
        return Err(Error::Matcher("no control units available for matching".into()));
    }
    if treated.is_empty() {
        return Err(Error::Matcher("no treated units to match".into()));
    }
    if let Some(bad) = treated.iter().chain(controls).find(|s| !(0.0..=1.0).contains(&s.score)) {
        return Err(Error::Matcher(format!(
            "user_id {} has propensity score {} outside [0, 1]",
            bad.unit.user_id, bad.score
        )));
    }

    let mut order: Vec<&ScoredUnit<'_>> = treated.iter().collect();
    order.sort_by_key(|s| s.unit.user_id);

    let mut pool: Vec<&ScoredUnit<'_>> = controls.iter().collect();
    pool.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.unit.user_id.cmp(&b.unit.user_id)));

    let outcomes: Vec<Outcome> = if policy.replacement {
        // No shared state between treated units: embarrassingly parallel.
        let used = vec![false; pool.len()];
        order.par_iter().map(|t| match_one(t, &pool, &used, policy)).map(|(o, _)| o).collect()
    } else {
        let mut used = vec![false; pool.len()];
        order
            .iter()
            .map(|t| {
                let (outcome, chosen) = match_one(t, &pool, &used, policy);
                if let Some(k) = chosen {
                    used[k] = true;
                }
                outcome
            })
            .collect()
    };

    let mut pairs = Vec::with_capacity(order.len());
    let mut n_dropped_caliper = 0;
    let mut n_dropped_exhausted = 0;
    for outcome in outcomes {
        match outcome {
            Outcome::Matched(pair) => pairs.push(pair),
            Outcome::Caliper => n_dropped_caliper += 1,
            Outcome::Exhausted => n_dropped_exhausted += 1,
        }
    }
    let n_distinct_controls = pairs.iter().map(|p| p.control_id).collect::<BTreeSet<_>>().len();

    if n_dropped_caliper > 0 {
        tracing::warn!(
            n_dropped_caliper,
            caliper = ?policy.caliper,
            "treated units without a control inside the caliper"
        );
    }
    if n_dropped_exhausted > 0 {
        tracing::warn!(n_dropped_exhausted, "treated units left unmatched after controls ran out");
    }
    if pairs.is_empty() {
        return Err(Error::Matcher(format!(
            "none of {} treated units could be matched (caliper {:?})",
            order.len(),
            policy.caliper
        )));
    }
    tracing::debug!(
        n_matched = pairs.len(),
        n_distinct_controls,
        replacement = policy.replacement,
        "matching complete"
    );

    Ok(MatchedPairSet {
        pairs,
        n_treated: order.len(),
        n_controls: pool.len(),
        n_dropped_caliper,
        n_dropped_exhausted,
        n_distinct_controls,
        replacement: policy.replacement,
    })
}

/// Nearest unused control for one treated unit. Returns the outcome and the
/// pool index that was consumed, if any.
fn match_one(
    t: &ScoredUnit<'_>,
    pool: &[&ScoredUnit<'_>],
    used: &[bool],
    policy: &MatchPolicy,
) -> (Outcome, Option<usize>) {
    let pos = pool.partition_point(|c| c.score < t.score);
    let left = (0..pos).rev().find(|&k| !used[k]);
    let right = (pos..pool.len()).find(|&k| !used[k]);

    let dist = |k: usize| (pool[k].score - t.score).abs();
    let best = match (left.map(dist), right.map(dist)) {
        (None, None) => return (Outcome::Exhausted, None),
        (Some(d), None) | (None, Some(d)) => d,
        (Some(dl), Some(dr)) => dl.min(dr),
    };
    if policy.caliper.is_some_and(|c| best > c) {
        return (Outcome::Caliper, None);
    }

    // Every unused control at distance `best` shares a score with `left` or
    // `right`; those form contiguous runs in the sorted pool.
    let mut candidates = Vec::new();
    for k in [left, right].into_iter().flatten() {
        if dist(k) != best {
            continue;
        }
        let s = pool[k].score;
        let lo = pool[..k].iter().rposition(|c| c.score != s).map_or(0, |i| i + 1);
        let hi = pool[k..].iter().position(|c| c.score != s).map_or(pool.len(), |i| k + i);
        candidates.extend((lo..hi).filter(|&i| !used[i]));
    }
    let chosen = candidates
        .into_iter()
        .min_by(|&a, &b| tie_order(policy.tie_break, pool[a].unit.user_id, pool[b].unit.user_id));
    let Some(k) = chosen else {
        return (Outcome::Exhausted, None);
    };

    let c = pool[k];
    let pair = MatchedPair {
        treated_id: t.unit.user_id,
        control_id: c.unit.user_id,
        treated_outcome: t.unit.outcome,
        control_outcome: c.unit.outcome,
        distance: best,
    };
    (Outcome::Matched(pair), Some(k))
}

fn tie_order(rule: TieBreak, a: u64, b: u64) -> Ordering {
    match rule {
        TieBreak::LowestUserId => a.cmp(&b),
        TieBreak::HighestUserId => b.cmp(&a),
    }
}
