//! Identify → estimate → refute orchestration.

use lc_core::{CohortTable, Error, Result};
use serde::{Deserialize, Serialize};

use crate::balance::{BalanceRow, covariate_balance};
use crate::effect::{EffectConfig, EffectEstimate, estimate_att};
use crate::graph::CausalGraph;
use crate::identify::{Identification, identify_adjustment_set};
use crate::matching::{MatchPolicy, MatchedPairSet, ScoredUnit, match_units};
use crate::propensity::{PropensityConfig, PropensityModel, PropensityScores, PropensitySummary};
use crate::refute::{RefutationCheck, RefutationOutcome, RefutationResult, refute, refute_each};

/// Supported estimation strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Backdoor adjustment through propensity-score nearest-neighbour
    /// matching.
    #[default]
    #[serde(alias = "backdoor.propensity_score_matching")]
    PropensityScoreMatching,
}

/// Population the effect is averaged over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetUnits {
    /// Average treatment effect on the treated.
    #[default]
    Att,
}

/// The composed identify → score → match → estimate function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CausalEstimator {
    /// Estimation strategy.
    pub method: EstimationMethod,
    /// Target population.
    pub target_units: TargetUnits,
    /// Propensity fit settings.
    pub propensity: PropensityConfig,
    /// Matching policy.
    pub matching: MatchPolicy,
    /// Effect and interval settings.
    pub effect: EffectConfig,
}

/// Everything one estimation pass produced.
#[derive(Debug, Clone)]
pub struct EstimationRun {
    /// Adjustment set and how it was found.
    pub identification: Identification,
    /// Fitted propensity model.
    pub model: PropensityModel,
    /// Scores in table order.
    pub scores: PropensityScores,
    /// Matched sample.
    pub matched: MatchedPairSet,
    /// ATT with interval.
    pub effect: EffectEstimate,
}

impl CausalEstimator {
    /// Range checks on every stage's settings.
    pub fn validate(&self) -> Result<()> {
        self.propensity.validate()?;
        self.matching.validate()?;
        self.effect.validate()
    }

    /// Run one estimation pass of `graph` on `table`. Pure apart from
    /// logging; `seed` only feeds the bootstrap interval.
    pub fn estimate(
        &self,
        graph: &CausalGraph,
        table: &CohortTable,
        seed: u64,
    ) -> Result<EstimationRun> {
        self.estimate_identified(identify_adjustment_set(graph)?, table, seed)
    }

    /// Estimation pass for an adjustment set that is already identified.
    pub fn estimate_identified(
        &self,
        identification: Identification,
        table: &CohortTable,
        seed: u64,
    ) -> Result<EstimationRun> {
        match (self.method, self.target_units) {
            (EstimationMethod::PropensityScoreMatching, TargetUnits::Att) => {
                self.propensity_score_matching(table, identification, seed)
            }
        }
    }

    fn propensity_score_matching(
        &self,
        table: &CohortTable,
        identification: Identification,
        seed: u64,
    ) -> Result<EstimationRun> {
        let adjustment = &identification.adjustment_set;
        let model = PropensityModel::fit(table, adjustment, &self.propensity)?;
        let scores = model.score_all(table)?;

        let (treated, controls): (Vec<ScoredUnit<'_>>, Vec<ScoredUnit<'_>>) = table
            .units()
            .iter()
            .zip(&scores.scores)
            .map(|(unit, &score)| ScoredUnit { unit, score })
            .partition(|s| s.unit.treatment);

        let matched = match_units(&treated, &controls, &self.matching)?;
        let effect = estimate_att(&matched, adjustment, &self.effect, seed)?;
        Ok(EstimationRun { identification, model, scores, matched, effect })
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Estimation pass.
    pub estimator: CausalEstimator,
    /// Refutation checks, run in this order; empty skips refutation.
    pub checks: Vec<RefutationCheck>,
    /// Root seed for the bootstrap and the refutation draws.
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { estimator: CausalEstimator::default(), checks: RefutationCheck::all(), seed: 42 }
    }
}

/// How far the run got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReportStatus {
    /// Estimate and all configured refutations available.
    Complete,
    /// No refutation checks were configured.
    RefutationSkipped,
    /// A perturbed re-run errored; the baseline estimate is still valid.
    RefutationFailed {
        /// Failing check, when known.
        check: Option<String>,
        /// Error message.
        error: String,
    },
}

/// Terminal, serializable artifact of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Graph in DOT form.
    pub graph_dot: String,
    /// Adjustment set and search stage.
    pub identification: Identification,
    /// Propensity fit summary.
    pub propensity: PropensitySummary,
    /// ATT, interval and sample sizes.
    pub effect: EffectEstimate,
    /// Covariate balance before/after matching.
    pub balance: Vec<BalanceRow>,
    /// Refutation verdicts, in configured order.
    pub refutations: Vec<RefutationResult>,
    /// Run status.
    pub status: ReportStatus,
    /// Root seed.
    pub seed: u64,
}

impl AnalysisReport {
    /// `true` when refutation ran and every check passed.
    pub fn all_refutations_passed(&self) -> bool {
        self.status == ReportStatus::Complete && self.refutations.iter().all(|r| r.passed)
    }
}

/// A causal graph bound to pipeline settings.
#[derive(Debug, Clone)]
pub struct CausalPipeline {
    graph: CausalGraph,
    config: PipelineConfig,
}

impl CausalPipeline {
    /// Validate settings and bind them to `graph`.
    pub fn new(graph: CausalGraph, config: PipelineConfig) -> Result<Self> {
        config.estimator.validate()?;
        for check in &config.checks {
            check.validate()?;
        }
        Ok(Self { graph, config })
    }

    /// The bound graph.
    pub fn graph(&self) -> &CausalGraph {
        &self.graph
    }

    /// The bound settings.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Backdoor adjustment set for the bound graph.
    pub fn identify(&self) -> Result<Identification> {
        identify_adjustment_set(&self.graph)
    }

    /// Baseline estimation pass.
    pub fn estimate(&self, table: &CohortTable) -> Result<EstimationRun> {
        self.config.estimator.estimate(&self.graph, table, self.config.seed)
    }

    /// Configured refutation checks against `baseline`; fails on the first
    /// errored check.
    pub fn refute(
        &self,
        table: &CohortTable,
        baseline: &EffectEstimate,
    ) -> Result<Vec<RefutationResult>> {
        let PipelineConfig { estimator, checks, seed } = &self.config;
        refute(estimator, &self.graph, table, baseline, checks, *seed)
    }

    /// Configured refutation checks against `baseline`, keeping the
    /// verdicts of checks that finished when others error.
    pub fn refute_each(
        &self,
        table: &CohortTable,
        baseline: &EffectEstimate,
    ) -> Result<RefutationOutcome> {
        let PipelineConfig { estimator, checks, seed } = &self.config;
        refute_each(estimator, &self.graph, table, baseline, checks, *seed)
    }

    /// Full run. Identification and estimation errors propagate; a
    /// refutation error is recorded in the report status next to the
    /// verdicts of the checks that did finish.
    pub fn run(&self, table: &CohortTable) -> Result<AnalysisReport> {
        tracing::info!(
            treatment = self.graph.treatment_name(),
            outcome = self.graph.outcome_name(),
            n_units = table.len(),
            n_treated = table.n_treated(),
            "identifying causal effect"
        );
        let identification = self.identify()?;
        tracing::info!(adjustment_set = ?identification.adjustment_set, "estimating ATT");

        let run =
            self.config.estimator.estimate_identified(identification, table, self.config.seed)?;
        let effect = &run.effect;
        tracing::info!(
            att = effect.att,
            ci_lower = effect.ci_lower,
            ci_upper = effect.ci_upper,
            n_matched = effect.n_matched,
            n_dropped = effect.n_dropped,
            "ATT estimated"
        );

        let propensity = run.model.summary(&run.scores);
        let balance = covariate_balance(table, &run.identification.adjustment_set, &run.matched)?;

        let (refutations, status) = if self.config.checks.is_empty() {
            tracing::info!("no refutation checks configured");
            (Vec::new(), ReportStatus::RefutationSkipped)
        } else {
            tracing::info!(n_checks = self.config.checks.len(), "running refutation checks");
            let RefutationOutcome { results, errors } = self.refute_each(table, effect)?;
            let status = match errors.first() {
                None => ReportStatus::Complete,
                Some(err) => {
                    tracing::warn!(
                        n_errored = errors.len(),
                        n_finished = results.len(),
                        "refutation incomplete"
                    );
                    let check = match err {
                        Error::Refutation { check, .. } => Some(check.clone()),
                        _ => None,
                    };
                    ReportStatus::RefutationFailed { check, error: err.to_string() }
                }
            };
            (results, status)
        };

        Ok(AnalysisReport {
            graph_dot: self.graph.to_dot(),
            identification: run.identification,
            propensity,
            effect: run.effect,
            balance,
            refutations,
            status,
            seed: self.config.seed,
        })
    }
}
