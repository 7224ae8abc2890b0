//! Prereg Core Library
//!
//! Preregistered verification runs: the analysis is fixed and hashed before
//! any metric is computed, gates are evaluated against preregistered
//! thresholds, every step lands in an append-only hash-chained ledger, and
//! artifacts are sealed by a SHA-256 manifest. Blinded runs withhold their
//! verdicts until an explicit, one-time reveal.

pub mod artifact;
pub mod blind;
pub mod config;
pub mod digest;
pub mod error;
pub mod gate;
pub mod identity;
pub mod ledger;
pub mod manifest;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod report;
pub mod telemetry;

pub use blind::{blind_state, plan_reveal, BlindMap, BlindState, RevealAction, BLIND_MAP_FILE};
pub use config::{Direction, GateKind, PreregFile, RunConfig, RunConfigBuilder, CONDITIONS};
pub use digest::{canonical_digest, canonical_json, sha256_hex};
pub use error::{
    PipelineError, Result, EXIT_CONFIG, EXIT_GATE_FAILURE, EXIT_INTEGRITY, EXIT_PASS,
};
pub use gate::{evaluate, evaluate_config, GateResult, GateVerdict};
pub use identity::{content_id, derive_identity, Identity};
pub use ledger::{
    quarantine_torn_tail, read_ledger, verify_chain, EventType, Ledger, LedgerEntry, LedgerError,
    NewEntry, LEDGER_FILE,
};
pub use manifest::{Manifest, MANIFEST_FILE};
pub use metrics::{JsonMetricSource, MetricSet, MetricSource, StaticMetricSource, METRICS_FILE};
pub use orchestrator::{Disclosure, Pipeline, RevealOutput, RunOutcome, RunOutput};
pub use report::{
    Report, ReportStatus, SealedResults, PREREG_FILE, REPORT_FILE, SEALED_RESULTS_FILE,
    SUMMARY_FILE,
};
pub use telemetry::init_tracing;

/// Version recorded in every `run_start` ledger entry.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
