//! Prereg - preregistered verification runs
//!
//! The `prereg` command executes one run into an output directory:
//!
//! - derives the AEQ/CID identity and writes `prereg.json`
//! - evaluates the preregistered gates against collected metrics
//! - appends every step to `ledger.ndjson`
//! - seals the artifacts in `manifest.json`
//!
//! The disclosed report is printed to stdout; logs go to stderr.
//! `--verify` rechecks an output directory, and `--repair-ledger` moves an
//! interrupted trailing ledger record into a side file.
//!
//! Exit codes: 0 pass (or blinded), 1 gate failure, 2 configuration or I/O
//! error, 3 integrity failure.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};

use prereg_core::{
    init_tracing, quarantine_torn_tail, Disclosure, JsonMetricSource, Pipeline, PipelineError,
    PreregFile, RunConfig, EXIT_CONFIG, EXIT_PASS,
};

#[derive(Parser, Debug)]
#[command(name = "prereg")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Preregistered verification runs with blind/reveal", long_about = None)]
struct Cli {
    /// Output directory for artifacts, manifest and ledger
    #[arg(long, env = "PREREG_OUT")]
    out: PathBuf,

    /// Seed for the run (optional when only revealing)
    #[arg(
        long,
        env = "PREREG_SEED",
        required_unless_present_any = ["reveal", "verify", "repair_ledger"]
    )]
    seed: Option<u64>,

    /// Withhold metric values and verdicts until reveal
    #[arg(long)]
    blind: bool,

    /// Disclose a blinded run (after running it, when combined with --blind)
    #[arg(long)]
    reveal: bool,

    /// Only verify the manifest and ledger chain in --out
    #[arg(long, conflicts_with_all = ["blind", "reveal"])]
    verify: bool,

    /// Move an interrupted trailing ledger record aside so runs can resume
    #[arg(long, conflicts_with_all = ["blind", "reveal", "verify"])]
    repair_ledger: bool,

    /// Metrics file (default: <out>/metrics.json)
    #[arg(long)]
    metrics: Option<PathBuf>,

    /// Preregistration JSON overriding the default gates and thresholds
    #[arg(long)]
    prereg: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

fn build_config(cli: &Cli, seed: u64) -> Result<RunConfig, PipelineError> {
    let mut builder = RunConfig::builder()
        .seed(seed)
        .output_path(&cli.out)
        .blind(cli.blind)
        .reveal(cli.reveal);
    if let Some(path) = &cli.prereg {
        builder = builder.prereg(PreregFile::load(path)?);
    }
    builder.build()
}

fn execute(cli: &Cli) -> Result<i32, PipelineError> {
    if cli.verify {
        let manifest = Pipeline::verify(&cli.out)?;
        info!(files = manifest.files.len(), aeq = %manifest.aeq, "Manifest and ledger verified");
        return Ok(EXIT_PASS);
    }

    if cli.repair_ledger {
        match quarantine_torn_tail(&cli.out)? {
            Some(side) => info!(side_file = %side.display(), "Torn ledger record moved aside"),
            None => info!("Ledger has no torn record"),
        }
        return Ok(EXIT_PASS);
    }

    let disclosure = match (cli.reveal && !cli.blind, cli.seed) {
        (true, seed) => {
            let revealed = Pipeline::reveal(&cli.out, seed)?;
            Disclosure {
                exit_code: revealed.outcome.exit_code(),
                report: revealed.report,
            }
        }
        (false, Some(seed)) => {
            let config = build_config(cli, seed)?;
            let source = match &cli.metrics {
                Some(path) => JsonMetricSource::new(path),
                None => JsonMetricSource::in_output_dir(&cli.out),
            };
            Pipeline::execute(&config, &source)?
        }
        (false, None) => {
            return Err(PipelineError::Config(
                "missing required field: seed".to_string(),
            ))
        }
    };

    print_report(&disclosure).map_err(|e| PipelineError::Config(format!("{e:#}")))?;
    Ok(disclosure.exit_code)
}

fn print_report(disclosure: &Disclosure) -> anyhow::Result<()> {
    let json =
        serde_json::to_string_pretty(&disclosure.report).context("Failed to render report")?;
    println!("{json}");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let code = match execute(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            err.exit_code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(EXIT_CONFIG as u8))
}
