//! Analysis file (YAML) parsing.
//!
//! One document drives simulate → cohort → analyze:
//!
//! ```yaml
//! seed: 42
//! simulation:
//!   num_users: 10000
//!   num_months: 12
//!   base_spend_lambda: 500
//!   month_decay_rate: 10
//!   treatment_effect: 100
//!   signup_month: 3
//! model: { treatment: treatment, outcome: post_spend }
//! ```
//!
//! `propensity`, `matching`, `effect` and `refutation` sections are the
//! [`AnalysisConfig`] sections. JSON is accepted too.

use std::path::Path;

use anyhow::{Context, Result};
use lc_inference::AnalysisConfig;
use lc_inference::config::{ModelConfig, RefutationConfig};
use lc_inference::{EffectConfig, MatchPolicy, PropensityConfig};
use lc_sim::{CohortWindow, SimulationConfig};
use serde::Deserialize;

/// `simulation` section: generator parameters plus the cohort window.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationSection {
    pub num_users: usize,
    pub num_months: u32,
    pub base_spend_lambda: f64,
    pub month_decay_rate: f64,
    pub treatment_effect: f64,
    pub signup_month: u32,
    pub post_includes_signup_month: bool,
}

impl Default for SimulationSection {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        let window = CohortWindow::default();
        Self {
            num_users: sim.num_users,
            num_months: sim.num_months,
            base_spend_lambda: sim.base_spend_lambda,
            month_decay_rate: sim.month_decay_rate,
            treatment_effect: sim.treatment_effect,
            signup_month: window.signup_month,
            post_includes_signup_month: window.post_includes_signup_month,
        }
    }
}

impl SimulationSection {
    pub fn simulation(&self) -> SimulationConfig {
        SimulationConfig {
            num_users: self.num_users,
            num_months: self.num_months,
            base_spend_lambda: self.base_spend_lambda,
            month_decay_rate: self.month_decay_rate,
            treatment_effect: self.treatment_effect,
        }
    }

    pub fn window(&self) -> CohortWindow {
        CohortWindow {
            signup_month: self.signup_month,
            post_includes_signup_month: self.post_includes_signup_month,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisSpec {
    pub seed: Option<u64>,
    pub simulation: SimulationSection,
    pub model: ModelConfig,
    pub propensity: PropensityConfig,
    pub matching: MatchPolicy,
    pub effect: EffectConfig,
    pub refutation: RefutationConfig,
}

impl AnalysisSpec {
    /// Analysis sections with the seed resolved (`--seed` wins over the
    /// file, which wins over the default).
    pub fn analysis(&self, seed_override: Option<u64>) -> AnalysisConfig {
        let defaults = AnalysisConfig::default();
        AnalysisConfig {
            seed: seed_override.or(self.seed).unwrap_or(defaults.seed),
            model: self.model.clone(),
            propensity: self.propensity,
            matching: self.matching,
            effect: self.effect,
            refutation: self.refutation.clone(),
        }
    }

    /// Semantic checks beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        self.simulation.simulation().validate().context("invalid simulation section")?;
        let window = self.simulation.window();
        anyhow::ensure!(
            window.signup_month >= 1 && window.signup_month < self.simulation.num_months,
            "simulation.signup_month must be in 1..{}, got {}",
            self.simulation.num_months,
            window.signup_month
        );
        self.analysis(None).validate()?;
        Ok(())
    }
}

/// Read and validate an analysis file; a missing path gives the defaults.
pub fn read_spec(path: Option<&Path>) -> Result<AnalysisSpec> {
    let spec = match path {
        Some(path) => {
            let bytes =
                std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            serde_yaml_ng::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => AnalysisSpec::default(),
    };
    spec.validate()?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_style_document_parses() {
        let yaml = "
simulation:
  num_users: 500
  num_months: 12
  base_spend_lambda: 500
  month_decay_rate: 10
  treatment_effect: 100
  signup_month: 3
model:
  treatment: treatment
  outcome: post_spend
  estimation_method: backdoor.propensity_score_matching
  target_units: att
";
        let spec: AnalysisSpec = serde_yaml_ng::from_str(yaml).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.simulation.simulation().num_users, 500);
        assert_eq!(spec.simulation.window().signup_month, 3);
        assert_eq!(spec.analysis(None).seed, 42);
        assert_eq!(spec.analysis(Some(5)).seed, 5);
    }

    #[test]
    fn nested_sections_and_unknown_keys() {
        let yaml = "
seed: 9
matching: { caliper: 0.1, replacement: true, tie_break: highest_user_id }
effect: { confidence_level: 0.9, interval: { kind: bootstrap, n_resamples: 200, method: bca } }
refutation:
  checks:
    - kind: data_subset
      fraction: 0.8
      tolerance: { absolute: 4.0 }
";
        let spec: AnalysisSpec = serde_yaml_ng::from_str(yaml).unwrap();
        let analysis = spec.analysis(None);
        assert_eq!(analysis.seed, 9);
        assert_eq!(analysis.matching.caliper, Some(0.1));
        assert_eq!(analysis.refutation.checks.len(), 1);

        assert!(serde_yaml_ng::from_str::<AnalysisSpec>("simulaton: {}").is_err());
    }

    #[test]
    fn shipped_default_config_matches_defaults() {
        let spec: AnalysisSpec =
            serde_yaml_ng::from_str(include_str!("../../../config/default.yaml")).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.analysis(None), AnalysisConfig::default());
        assert_eq!(spec.simulation.simulation(), SimulationConfig::default());
        assert_eq!(spec.simulation.window(), CohortWindow::default());
    }

    #[test]
    fn signup_month_must_fit_the_panel() {
        let mut spec = AnalysisSpec::default();
        spec.simulation.signup_month = 12;
        assert!(spec.validate().is_err());
    }
}
