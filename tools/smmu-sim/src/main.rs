//! Runs an SMMU scenario file against the emulator and prints a JSON report.

mod scenario;

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use smmu::{SmmuConfiguration, SmmuController};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::scenario::Scenario;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Preset {
    Default,
    HighPerformance,
    Minimal,
    Development,
}

impl Preset {
    fn configuration(self) -> SmmuConfiguration {
        match self {
            Preset::Default => SmmuConfiguration::default(),
            Preset::HighPerformance => SmmuConfiguration::high_performance(),
            Preset::Minimal => SmmuConfiguration::minimal(),
            Preset::Development => SmmuConfiguration::development(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "Replay device translations and queue traffic through an emulated SMMUv3")]
struct Args {
    /// Scenario JSON: streams, their mappings, and the steps to run.
    scenario: PathBuf,

    /// Controller configuration JSON. Overrides `--preset`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Built-in configuration used when `--config` is not given.
    #[arg(long, value_enum, default_value_t = Preset::Default)]
    preset: Preset,

    /// Tracing filter (e.g. `info`, `smmu=debug`). Falls back to `RUST_LOG`.
    #[arg(long, env = "SMMU_SIM_LOG_LEVEL")]
    log_level: Option<String>,

    /// Replay every translation step concurrently from this many threads after the run.
    #[arg(long, default_value_t = 0)]
    threads: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref())?;
    run(args)
}

fn init_tracing(log_level: Option<&str>) -> anyhow::Result<()> {
    let filter = match log_level {
        Some(level) => {
            EnvFilter::try_new(level).with_context(|| format!("invalid log filter {level:?}"))?
        }
        None => EnvFilter::from_default_env(),
    };
    // Logs go to stderr; stdout carries only the report.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_configuration(args: &Args) -> anyhow::Result<SmmuConfiguration> {
    match &args.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            SmmuConfiguration::from_json_str(&json)
                .with_context(|| format!("invalid configuration in {}", path.display()))
        }
        None => Ok(args.preset.configuration()),
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_configuration(&args)?;
    let smmu = SmmuController::new(config).context("failed to create SMMU controller")?;

    let json = fs::read_to_string(&args.scenario)
        .with_context(|| format!("failed to read {}", args.scenario.display()))?;
    let scenario = Scenario::from_json_str(&json)
        .with_context(|| format!("in {}", args.scenario.display()))?;

    let report = scenario::run(&smmu, &scenario, args.threads)?;
    println!("{report}");
    info!(
        translations = report.translations.len(),
        failed = report.failed_expectations,
        "scenario finished"
    );

    if report.failed_expectations > 0 {
        bail!("{} expectation(s) failed", report.failed_expectations);
    }
    Ok(())
}
