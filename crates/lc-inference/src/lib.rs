//! # lc-inference
//!
//! Causal estimation of loyalty-program effects.
//!
//! This crate provides:
//! - causal DAGs with a DOT surface and backdoor identification,
//! - logistic propensity scores and nearest-neighbour matching,
//! - ATT estimates with paired-t or bootstrap intervals,
//! - placebo / random-common-cause / data-subset refutation,
//! - a pipeline that ties them together into a serializable report.
//!
//! Everything except [`pipeline`] is a pure function of its inputs; the
//! pipeline only adds logging.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Covariate balance (standardized mean differences).
pub mod balance;
/// Percentile and BCa bootstrap intervals.
pub mod bootstrap_ci;
/// Serde configuration sections.
pub mod config;
mod dot;
/// ATT from matched pairs.
pub mod effect;
/// Causal DAG.
pub mod graph;
/// Backdoor identification and d-separation.
pub mod identify;
/// Propensity-score matching.
pub mod matching;
/// Orchestration and reporting.
pub mod pipeline;
/// Logistic propensity model.
pub mod propensity;
/// Refutation checks.
pub mod refute;

pub use balance::{BalanceRow, covariate_balance};
pub use config::AnalysisConfig;
pub use effect::{EffectConfig, EffectEstimate, IntervalMethod, estimate_att};
pub use graph::{CausalGraph, GraphSpec, Variable, loyalty_graph};
pub use identify::{AdjustmentSet, Identification, identify_adjustment_set, is_d_separated};
pub use matching::{MatchPolicy, MatchedPair, MatchedPairSet, ScoredUnit, TieBreak, match_units};
pub use pipeline::{
    AnalysisReport, CausalEstimator, CausalPipeline, EstimationMethod, EstimationRun,
    PipelineConfig, ReportStatus, TargetUnits,
};
pub use propensity::{PropensityConfig, PropensityModel, PropensityScores};
pub use refute::{
    RefutationCheck, RefutationOutcome, RefutationResult, Tolerance, refute, refute_each,
};
