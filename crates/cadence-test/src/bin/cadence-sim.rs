//! Plays a scenario against the simulated chain and prints a report
//!
//! Idle periods are fast-forwarded unless `--realtime` is given, so a
//! dozen epochs take well under a second.

use std::time::Duration;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, ValueEnum};
use serde::Serialize;
use tracing::level_filters::LevelFilter;

use cadence_runtime::{init_tracing, LogFormat, TelemetryConfig};
use cadence_test::{run_scenario, ChaosConfig, ScenarioConfig, ScenarioResult};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Chaos {
    None,
    Good,
    Flaky,
    Hostile,
}

impl Chaos {
    fn config(self, seed: u64) -> ChaosConfig {
        let preset = match self {
            Chaos::None => ChaosConfig::none(),
            Chaos::Good => ChaosConfig::good(),
            Chaos::Flaky => ChaosConfig::flaky(),
            Chaos::Hostile => ChaosConfig::hostile(),
        };
        preset.with_seed(seed)
    }
}

#[derive(Parser, Debug)]
#[command(name = "cadence-sim")]
#[command(about = "Play commit/reveal epochs against a simulated chain", long_about = None)]
struct Cli {
    #[arg(long, default_value_t = 3)]
    players: usize,

    /// Epochs played after the entry epoch
    #[arg(long, default_value_t = 4)]
    epochs: u64,

    /// Moves per player and epoch
    #[arg(long, default_value_t = 3)]
    moves: usize,

    #[arg(long, value_enum, default_value_t = Chaos::None)]
    chaos: Chaos,

    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Wall clock offset between consecutive players, e.g. "1s 750ms"
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    skew: Duration,

    /// Run in real time instead of fast-forwarding
    #[arg(long)]
    realtime: bool,

    /// JSON logs and report
    #[arg(long)]
    json: bool,

    /// More logging, repeatable
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    players: usize,
    players_on_chain: usize,
    epochs: u64,
    commits: u64,
    reveals: u64,
    reverted: u64,
    rejected_reveals: u64,
    failed_reads: u64,
    simulated: String,
    violations: Vec<String>,
}

impl From<&ScenarioResult> for Report {
    fn from(result: &ScenarioResult) -> Self {
        Report {
            players: result.players,
            players_on_chain: result.players_on_chain,
            epochs: result.epochs_run,
            commits: result.stats.commits,
            reveals: result.stats.reveals,
            reverted: result.stats.reverted,
            rejected_reveals: result.stats.rejected_reveals,
            failed_reads: result.stats.failed_reads,
            simulated: humantime::format_duration(result.simulated).to_string(),
            violations: result.violations.clone(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TelemetryConfig {
        default_level: match cli.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            _ => LevelFilter::DEBUG,
        },
        format: if cli.json {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
        ansi: !cli.json,
    })?;

    let mut config = ScenarioConfig {
        players: cli.players,
        epochs: cli.epochs,
        moves_per_epoch: cli.moves,
        clock_skew: cli.skew,
        seed: cli.seed,
        ..ScenarioConfig::minimal()
    };
    config.chain.chaos = cli.chaos.config(cli.seed);

    let mut builder = tokio::runtime::Builder::new_current_thread();
    builder.enable_all();
    if !cli.realtime {
        builder.start_paused(true);
    }
    let runtime = builder.build().context("building the tokio runtime")?;
    let result = runtime
        .block_on(run_scenario(config))
        .context("setting up the scenario")?;

    let report = Report::from(&result);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} of {} players on chain after {} epochs ({} simulated)",
            report.players_on_chain, report.players, report.epochs, report.simulated
        );
        println!(
            "commits {}, reveals {}, reverted {}, failed reads {}",
            report.commits, report.reveals, report.reverted, report.failed_reads
        );
        for violation in &report.violations {
            println!("violation: {violation}");
        }
    }

    if !result.invariants_maintained {
        bail!("{} invariant violations", result.violations.len());
    }
    Ok(())
}
