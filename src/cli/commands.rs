//! CLI command definitions for swe-bench-harness.
//!
//! `run` evaluates an agent over a SWE-bench dataset; `status` reports on
//! the stored results of an existing run without touching Docker.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::config::BenchConfig;
use crate::execution::{ContainerRuntime, DockerClient};
use crate::swe::{load_dataset, load_results, select_instances, Benchmark, BenchmarkSummary};

const PREDICTIONS_FILE: &str = "predictions.jsonl";
const RESULTS_FILE: &str = "swe_bench_results.json";

/// Runs a coding agent against SWE-bench task instances in Docker.
#[derive(Parser)]
#[command(name = "swe-bench-harness")]
#[command(about = "Evaluate a coding agent on SWE-bench instances inside Docker")]
#[command(version)]
#[command(
    long_about = "swe-bench-harness drives each SWE-bench instance through a fresh container: it applies the test patch, commits a baseline, runs the agent, captures its diff and scores the post-agent test run.\n\nResults are stored per instance, so an interrupted run resumes where it stopped.\n\nExample usage:\n  swe-bench-harness run --dataset swe-bench-verified.jsonl --config bench.yaml --per-repo 2"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run (or resume) a benchmark.
    Run(RunArgs),

    /// Summarize the stored results of a benchmark.
    Status(StatusArgs),
}

/// Arguments for `swe-bench-harness run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// SWE-bench dataset as JSON lines.
    #[arg(short = 'd', long)]
    pub dataset: PathBuf,

    /// Run only this instance (e.g. psf__requests-2317).
    #[arg(long)]
    pub instance: Option<String>,

    /// Keep the first N instances of each repository.
    #[arg(long)]
    pub per_repo: Option<usize>,

    /// Benchmark name; results go to `<output>/<name>`.
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Output root directory.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// YAML configuration file.
    #[arg(short = 'c', long, env = "SWE_BENCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Stop after this many trials.
    #[arg(long)]
    pub max_trials: Option<usize>,

    /// Print the final summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `swe-bench-harness status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Benchmark name.
    #[arg(short = 'n', long)]
    pub name: String,

    /// Output root directory.
    #[arg(short = 'o', long, default_value = "results")]
    pub output: PathBuf,

    /// Dataset used for the run, to report pending instances.
    #[arg(short = 'd', long)]
    pub dataset: Option<PathBuf>,

    /// Print the summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_benchmark_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
    }
}

/// Applies CLI overrides on top of the configuration file (or defaults).
fn resolve_config(args: &RunArgs) -> anyhow::Result<BenchConfig> {
    let mut config = match &args.config {
        Some(path) => BenchConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BenchConfig::default(),
    };
    if let Some(name) = &args.name {
        config.benchmark_name = name.clone();
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if args.per_repo.is_some() {
        config.per_repo_limit = args.per_repo;
    }
    config.validate()?;
    Ok(config)
}

async fn run_benchmark_command(args: RunArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args)?;

    let dataset = load_dataset(&args.dataset)
        .with_context(|| format!("loading dataset {}", args.dataset.display()))?;
    info!(total = dataset.len(), "Loaded dataset");
    let instances = select_instances(dataset, args.instance.as_deref(), config.per_repo_limit)?;
    if instances.is_empty() {
        anyhow::bail!("No instances selected from {}", args.dataset.display());
    }
    info!(selected = instances.len(), "Selected instances");

    let docker = DockerClient::new()?;
    docker.ping().await?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    let scorer = config.scoring_backend().into_scorer()?;

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir.display()))?;
    let mut benchmark = Benchmark::new(
        config.benchmark_name.clone(),
        instances,
        &config.output_dir,
        runtime,
        scorer,
        config.trial_options(),
    )
    .await?;
    info!(
        benchmark = %benchmark.name(),
        output = %benchmark.output_path().display(),
        "Running benchmark"
    );

    let executed = benchmark.run_all(args.max_trials).await?;

    let predictions_path = config.output_dir.join(PREDICTIONS_FILE);
    let written = benchmark.write_predictions(&predictions_path).await?;
    benchmark
        .write_summary(&config.output_dir.join(RESULTS_FILE))
        .await?;
    info!(
        executed,
        predictions = written,
        path = %predictions_path.display(),
        "Wrote predictions"
    );

    print_summary(benchmark.name(), &benchmark.summary(), args.json)
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let run_dir = args.output.join(&args.name);
    if !run_dir.is_dir() {
        anyhow::bail!("No results for benchmark '{}' in {}", args.name, args.output.display());
    }
    let results = load_results(&run_dir).await?;

    let summary = match &args.dataset {
        Some(path) => {
            let instances = load_dataset(path)
                .with_context(|| format!("loading dataset {}", path.display()))?;
            let selected = instances
                .iter()
                .filter_map(|i| results.get(&format!("{}-{}", args.name, i.instance_id)));
            BenchmarkSummary::from_results(instances.len(), selected)
        }
        None => BenchmarkSummary::from_results(results.len(), results.values()),
    };
    print_summary(&args.name, &summary, args.json)
}

fn print_summary(name: &str, summary: &BenchmarkSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!("\n=== {name} ===");
    println!("Instances:           {}", summary.total);
    println!("Completed:           {}", summary.completed);
    println!("Resolved:            {}", summary.resolved);
    println!("Run failures:        {}", summary.run_failed);
    println!("Validation failures: {}", summary.validation_failed);
    println!();
    Ok(())
}
