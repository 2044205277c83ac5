//! loyalty-causal CLI

mod spec;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lc_inference::{AnalysisReport, CausalPipeline, ReportStatus};
use lc_sim::{CohortRecord, CohortWindow, PanelRow, cohort_table, prepare_cohort, simulate_panel};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "loyalty-causal")]
#[command(about = "Causal effect of loyalty-program enrollment on spend")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a synthetic user-month panel (JSON array of rows)
    Simulate {
        /// Analysis file (YAML or JSON); only `seed` and `simulation` are used.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the number of users.
        #[arg(long)]
        num_users: Option<usize>,

        /// Random seed (overrides the config file).
        #[arg(long)]
        seed: Option<u64>,

        /// Output file (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Aggregate a panel into a pre/post cohort around one signup month
    Cohort {
        /// Panel JSON from `simulate`.
        #[arg(short, long)]
        input: PathBuf,

        /// Target signup month.
        #[arg(long, default_value = "3")]
        signup_month: u32,

        /// Count the signup month as post-period.
        #[arg(long)]
        post_includes_signup_month: bool,

        /// Output file (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Identify, estimate and refute the enrollment effect
    Analyze {
        /// Analysis file (YAML or JSON). Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Cohort JSON from `cohort`. Simulated from the config when omitted.
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Random seed (overrides the config file).
        #[arg(long)]
        seed: Option<u64>,

        /// Skip refutation checks.
        #[arg(long)]
        no_refute: bool,

        /// Exit with an error unless every refutation check passes.
        #[arg(long, conflicts_with = "no_refute")]
        require_pass: bool,

        /// Output file for the report (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the causal graph in DOT form
    Graph {
        /// Analysis file whose `model.graph` to print.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output file. Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate { config, num_users, seed, output } => {
            cmd_simulate(config.as_deref(), num_users, seed, output.as_ref())
        }
        Commands::Cohort { input, signup_month, post_includes_signup_month, output } => {
            let window = CohortWindow { signup_month, post_includes_signup_month };
            cmd_cohort(&input, &window, output.as_ref())
        }
        Commands::Analyze { config, input, seed, no_refute, require_pass, output } => cmd_analyze(
            config.as_deref(),
            input.as_deref(),
            seed,
            no_refute,
            require_pass,
            output.as_ref(),
        ),
        Commands::Graph { config, output } => cmd_graph(config.as_deref(), output.as_ref()),
        Commands::Version => {
            println!("loyalty-causal {}", lc_core::VERSION);
            Ok(())
        }
    }
}

fn cmd_simulate(
    config: Option<&Path>,
    num_users: Option<usize>,
    seed: Option<u64>,
    output: Option<&PathBuf>,
) -> Result<()> {
    let spec = spec::read_spec(config)?;
    let mut sim = spec.simulation.simulation();
    if let Some(n) = num_users {
        sim.num_users = n;
    }
    let seed = spec.analysis(seed).seed;
    let rows = simulate_panel(&sim, seed)?;
    tracing::info!(rows = rows.len(), seed, "panel simulated");
    write_json(output, &rows)
}

fn cmd_cohort(input: &Path, window: &CohortWindow, output: Option<&PathBuf>) -> Result<()> {
    let rows: Vec<PanelRow> = read_json(input)?;
    let records = prepare_cohort(&rows, window)?;
    tracing::info!(users = records.len(), signup_month = window.signup_month, "cohort prepared");
    write_json(output, &records)
}

fn cmd_analyze(
    config: Option<&Path>,
    input: Option<&Path>,
    seed: Option<u64>,
    no_refute: bool,
    require_pass: bool,
    output: Option<&PathBuf>,
) -> Result<()> {
    let spec = spec::read_spec(config)?;
    let analysis = spec.analysis(seed);

    let records: Vec<CohortRecord> = match input {
        Some(path) => read_json(path)?,
        None => {
            let rows = simulate_panel(&spec.simulation.simulation(), analysis.seed)?;
            prepare_cohort(&rows, &spec.simulation.window())?
        }
    };
    let table = cohort_table(&records)?;

    let mut pipeline_config = analysis.pipeline_config();
    if no_refute {
        pipeline_config.checks.clear();
    }
    let pipeline = CausalPipeline::new(analysis.graph()?, pipeline_config)?;
    let report = pipeline.run(&table)?;
    log_summary(&report);
    write_json(output, &report)?;

    if require_pass && !report.all_refutations_passed() {
        let failed: Vec<&str> =
            report.refutations.iter().filter(|r| !r.passed).map(|r| r.check.as_str()).collect();
        anyhow::bail!(
            "refutation did not pass (status {:?}, failed checks {:?})",
            report.status,
            failed
        );
    }
    Ok(())
}

fn cmd_graph(config: Option<&Path>, output: Option<&PathBuf>) -> Result<()> {
    let spec = spec::read_spec(config)?;
    let dot = spec.analysis(None).graph()?.to_dot();
    match output {
        Some(path) => {
            std::fs::write(path, dot).with_context(|| format!("writing {}", path.display()))?
        }
        None => print!("{dot}"),
    }
    Ok(())
}

fn log_summary(report: &AnalysisReport) {
    let effect = &report.effect;
    tracing::info!(
        att = effect.att,
        ci_lower = effect.ci_lower,
        ci_upper = effect.ci_upper,
        confidence_level = effect.confidence_level,
        n_matched = effect.n_matched,
        n_treated = effect.n_treated,
        "effect"
    );
    for r in &report.refutations {
        tracing::info!(
            check = %r.check,
            baseline = r.baseline,
            new_effect = r.new_effect,
            passed = r.passed,
            "refutation"
        );
    }
    if let ReportStatus::RefutationFailed { error, .. } = &report.status {
        tracing::warn!(%error, "refutation incomplete");
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(output: Option<&PathBuf>, value: &T) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}
