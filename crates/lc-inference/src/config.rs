//! Serde configuration for an analysis run.
//!
//! ```yaml
//! seed: 42
//! model:
//!   treatment: treatment
//!   outcome: post_spend
//!   estimation_method: propensity_score_matching
//!   target_units: att
//! propensity: { max_iter: 100, tolerance: 1.0e-8 }
//! matching: { replacement: false, caliper: 0.05, tie_break: lowest_user_id }
//! effect: { confidence_level: 0.95, interval: { kind: paired_t } }
//! refutation:
//!   checks:
//!     - kind: placebo_treatment
//!     - kind: random_common_cause
//!     - kind: data_subset
//!       fraction: 0.9
//! ```
//!
//! Every section is optional and unknown keys are rejected.

use lc_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::effect::EffectConfig;
use crate::graph::{CausalGraph, LOYALTY_OUTCOME, LOYALTY_TREATMENT, loyalty_graph};
use crate::matching::MatchPolicy;
use crate::pipeline::{CausalEstimator, EstimationMethod, PipelineConfig, TargetUnits};
use crate::propensity::PropensityConfig;
use crate::refute::RefutationCheck;

/// Causal model section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Treatment node.
    pub treatment: String,
    /// Outcome node.
    pub outcome: String,
    /// Estimation strategy.
    pub estimation_method: EstimationMethod,
    /// Target population.
    pub target_units: TargetUnits,
    /// Causal graph in DOT; the built-in loyalty graph when absent.
    pub graph: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            treatment: LOYALTY_TREATMENT.to_string(),
            outcome: LOYALTY_OUTCOME.to_string(),
            estimation_method: EstimationMethod::default(),
            target_units: TargetUnits::default(),
            graph: None,
        }
    }
}

/// Refutation section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RefutationConfig {
    /// Checks to run, in order.
    pub checks: Vec<RefutationCheck>,
}

impl Default for RefutationConfig {
    fn default() -> Self {
        Self { checks: RefutationCheck::all() }
    }
}

/// Analysis configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Root seed.
    pub seed: u64,
    /// Causal model.
    pub model: ModelConfig,
    /// Propensity fit.
    pub propensity: PropensityConfig,
    /// Matching policy.
    pub matching: MatchPolicy,
    /// Effect and interval.
    pub effect: EffectConfig,
    /// Refutation checks.
    pub refutation: RefutationConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            model: ModelConfig::default(),
            propensity: PropensityConfig::default(),
            matching: MatchPolicy::default(),
            effect: EffectConfig::default(),
            refutation: RefutationConfig::default(),
        }
    }
}

impl AnalysisConfig {
    /// Semantic validation of every section.
    pub fn validate(&self) -> Result<()> {
        if self.model.treatment.trim().is_empty() || self.model.outcome.trim().is_empty() {
            return Err(Error::Validation(
                "model.treatment and model.outcome must be non-empty".into(),
            ));
        }
        if self.model.treatment == self.model.outcome {
            return Err(Error::Validation(format!(
                "model.treatment and model.outcome are both '{}'",
                self.model.treatment
            )));
        }
        self.propensity.validate()?;
        self.matching.validate()?;
        self.effect.validate()?;
        for check in &self.refutation.checks {
            check.validate()?;
        }
        Ok(())
    }

    /// The configured graph, or the built-in loyalty graph.
    ///
    /// Without a DOT graph the treatment and outcome must be the built-in
    /// graph's node names.
    pub fn graph(&self) -> Result<CausalGraph> {
        match &self.model.graph {
            Some(dot) => CausalGraph::from_dot(dot, &self.model.treatment, &self.model.outcome),
            None if self.model.treatment == LOYALTY_TREATMENT
                && self.model.outcome == LOYALTY_OUTCOME =>
            {
                loyalty_graph()
            }
            None => Err(Error::Validation(format!(
                "no model.graph given and '{}' -> '{}' is not the built-in loyalty graph",
                self.model.treatment, self.model.outcome
            ))),
        }
    }

    /// Orchestrator settings.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            estimator: CausalEstimator {
                method: self.model.estimation_method,
                target_units: self.model.target_units,
                propensity: self.propensity,
                matching: self.matching,
                effect: self.effect,
            },
            checks: self.refutation.checks.clone(),
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refute::Tolerance;

    #[test]
    fn empty_document_gives_defaults() {
        let config: AnalysisConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AnalysisConfig::default());
        config.validate().unwrap();
        assert_eq!(config.pipeline_config(), PipelineConfig::default());
        assert_eq!(config.graph().unwrap(), loyalty_graph().unwrap());
    }

    #[test]
    fn sections_override_defaults() {
        let config: AnalysisConfig = serde_json::from_str(
            r#"{
                "seed": 7,
                "matching": {"caliper": null, "replacement": true},
                "refutation": {"checks": [
                    {"kind": "placebo_treatment", "tolerance": {"absolute": 10.0}}
                ]}
            }"#,
        )
        .unwrap();
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.seed, 7);
        assert_eq!(pipeline.estimator.matching.caliper, None);
        assert!(pipeline.estimator.matching.replacement);
        assert_eq!(
            pipeline.checks,
            vec![RefutationCheck::PlaceboTreatment { tolerance: Tolerance::Absolute(10.0) }]
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_json::from_str::<AnalysisConfig>(r#"{"sead": 1}"#).is_err());
        let misspelled = r#"{"matching": {"calipre": 0.1}}"#;
        assert!(serde_json::from_str::<AnalysisConfig>(misspelled).is_err());
    }

    #[test]
    fn custom_names_need_a_graph() {
        let mut config = AnalysisConfig::default();
        config.model.outcome = "post_spends".into();
        assert!(matches!(config.graph(), Err(Error::Validation(_))));

        let dot = "digraph { pre -> treatment; pre -> post_spends; treatment -> post_spends }";
        config.model.graph = Some(dot.into());
        let graph = config.graph().unwrap();
        assert_eq!(graph.outcome_name(), "post_spends");
    }

    #[test]
    fn validation_covers_every_section() {
        let mut config = AnalysisConfig::default();
        config.effect.confidence_level = 0.0;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.model.outcome = config.model.treatment.clone();
        assert!(config.validate().is_err());
    }
}
