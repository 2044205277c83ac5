//! End-to-end recovery of a known enrollment effect on simulated data.

use std::sync::OnceLock;

use lc_core::CohortTable;
use lc_inference::refute::RANDOM_COMMON_CAUSE;
use lc_inference::{
    AnalysisConfig, AnalysisReport, CausalEstimator, CausalPipeline, PipelineConfig,
    RefutationCheck, ReportStatus, loyalty_graph, refute,
};
use lc_sim::{CohortWindow, SimulationConfig, cohort_table, prepare_cohort, simulate_panel};

const SEED: u64 = 2024;

fn cohort() -> &'static CohortTable {
    static TABLE: OnceLock<CohortTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let rows = simulate_panel(&SimulationConfig::default(), SEED).unwrap();
        let records = prepare_cohort(&rows, &CohortWindow::default()).unwrap();
        cohort_table(&records).unwrap()
    })
}

fn pipeline() -> CausalPipeline {
    let config = PipelineConfig { seed: SEED, ..PipelineConfig::default() };
    CausalPipeline::new(loyalty_graph().unwrap(), config).unwrap()
}

fn report() -> &'static AnalysisReport {
    static REPORT: OnceLock<AnalysisReport> = OnceLock::new();
    REPORT.get_or_init(|| pipeline().run(cohort()).unwrap())
}

#[test]
fn ten_thousand_users_recover_the_effect() {
    let table = cohort();
    assert!(table.n_treated() > 300, "treated={}", table.n_treated());

    let report = report();
    assert!(report.identification.adjustment_set.contains("pre_spend"));
    assert!(!report.identification.adjustment_set.contains("Z"));

    let effect = &report.effect;
    assert!((effect.att - 100.0).abs() <= 15.0, "att={}", effect.att);
    assert!(effect.ci_lower < effect.att && effect.att < effect.ci_upper);
    assert!(effect.n_matched as f64 >= 0.9 * effect.n_treated as f64, "{effect:?}");

    assert_eq!(report.status, ReportStatus::Complete);
    assert!(report.all_refutations_passed(), "{:?}", report.refutations);
}

#[test]
fn refutation_deviations_stay_small() {
    let report = report();
    let by_name = |name: &str| report.refutations.iter().find(|r| r.check == name).unwrap();

    let placebo = by_name("placebo_treatment");
    assert!(placebo.new_effect.abs() < 10.0, "{placebo:?}");

    let rcc = by_name("random_common_cause");
    assert!(rcc.deviation < 0.05 * report.effect.att.abs(), "{rcc:?}");

    let subset = by_name("data_subset");
    assert!(subset.threshold > 0.05 * report.effect.att.abs());
    assert!(subset.passed, "{subset:?}");
}

#[test]
fn matching_invariants_hold_on_the_cohort() {
    let run = pipeline().estimate(cohort()).unwrap();
    assert!(run.scores.scores.iter().all(|p| (0.0..=1.0).contains(p)));
    assert_eq!(run.scores.n_extreme, 0);
    assert!(!run.matched.replacement);
    assert_eq!(run.matched.n_distinct_controls, run.matched.n_matched());
    assert_eq!(run.matched.n_matched() + run.matched.n_dropped(), run.matched.n_treated);
}

#[test]
fn identical_inputs_give_bit_identical_reports() {
    let again = pipeline().run(cohort()).unwrap();
    assert_eq!(&again, report());
    assert_eq!(again.effect.att.to_bits(), report().effect.att.to_bits());
}

#[test]
fn subset_draws_are_reproducible() {
    let table = cohort();
    let estimator = CausalEstimator::default();
    let graph = loyalty_graph().unwrap();
    let checks = [RefutationCheck::data_subset()];
    let a = refute(&estimator, &graph, table, &report().effect, &checks, 77).unwrap();
    let b = refute(&estimator, &graph, table, &report().effect, &checks, 77).unwrap();
    assert_eq!(a, b);
    let c = refute(&estimator, &graph, table, &report().effect, &checks, 78).unwrap();
    assert_ne!(a[0].new_effect, c[0].new_effect);
}

#[test]
fn random_common_cause_enters_the_adjustment_set() {
    let graph = loyalty_graph().unwrap().with_common_cause(RANDOM_COMMON_CAUSE).unwrap();
    let id = lc_inference::identify_adjustment_set(&graph).unwrap();
    assert!(id.adjustment_set.contains(RANDOM_COMMON_CAUSE));
    assert!(id.adjustment_set.contains("pre_spend"));
}

#[test]
fn yaml_configuration_drives_the_pipeline() {
    let yaml = "
seed: 2024
model:
  estimation_method: backdoor.propensity_score_matching
  target_units: att
matching:
  replacement: true
  caliper: 0.05
effect:
  confidence_level: 0.9
refutation:
  checks: []
";
    let config: AnalysisConfig = serde_yaml_ng::from_str(yaml).unwrap();
    config.validate().unwrap();
    let pipeline = CausalPipeline::new(config.graph().unwrap(), config.pipeline_config()).unwrap();
    let report = pipeline.run(cohort()).unwrap();
    assert_eq!(report.status, ReportStatus::RefutationSkipped);
    assert_eq!(report.effect.confidence_level, 0.9);
    assert!((report.effect.att - 100.0).abs() <= 15.0, "att={}", report.effect.att);
    assert!(report.effect.n_distinct_controls <= report.effect.n_matched);
}
