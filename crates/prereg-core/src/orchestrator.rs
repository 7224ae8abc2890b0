//! Run orchestration.
//!
//! [`Pipeline::run`] sequences one preregistered run:
//!
//! 1. open the ledger and record `run_start`
//! 2. write `prereg.json` (thresholds fixed before any metric is seen)
//! 3. in blind mode, write `blind_map.json`
//! 4. collect metrics from the [`MetricSource`] and derive the identity
//! 5. evaluate every gate, one ledger entry each
//! 6. write the report (and sealed results when blinded)
//! 7. build `manifest.json`, record `run_end`
//!
//! Configuration and I/O errors abort the run with a `run_aborted` entry
//! when the ledger is already open. Gate failures complete the run.
//! [`Pipeline::reveal`] discloses a blinded run exactly once.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use serde_json::json;
use uuid::Uuid;

use crate::artifact::{read_json, write_json_atomic};
use crate::blind::{plan_reveal, BlindMap, RevealAction, BLIND_MAP_FILE};
use crate::config::RunConfig;
use crate::digest::canonical_digest;
use crate::error::{PipelineError, Result, EXIT_GATE_FAILURE, EXIT_PASS};
use crate::gate::{evaluate_config, GateVerdict};
use crate::identity::{content_id, derive_identity, Identity};
use crate::ledger::{read_ledger, verify_chain, EventType, Ledger, LedgerEntry, LEDGER_FILE};
use crate::manifest::{self, file_digest, Manifest, MANIFEST_FILE};
use crate::metrics::MetricSource;
use crate::obs::{
    emit_gate_evaluated, emit_identity_derived, emit_revealed, emit_run_aborted,
    emit_run_finished, emit_run_started, RunSpan,
};
use crate::report::{
    write_report, Report, SealedResults, PREREG_FILE, REPORT_FILE, REPORT_SCHEMA_VERSION,
    SEALED_RESULTS_FILE, SUMMARY_FILE,
};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every gate passed.
    Passed,
    /// One or more gates failed. The run itself executed successfully.
    GateFailure { failed_gates: Vec<String> },
    /// Blinded run completed; verdicts withheld until reveal.
    Blinded,
}

impl RunOutcome {
    fn from_verdict(verdict: &GateVerdict) -> Self {
        if verdict.passed() {
            RunOutcome::Passed
        } else {
            RunOutcome::GateFailure {
                failed_gates: verdict.failed_gates(),
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Passed => "passed",
            RunOutcome::GateFailure { .. } => "gate_failure",
            RunOutcome::Blinded => "blinded",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Passed | RunOutcome::Blinded => EXIT_PASS,
            RunOutcome::GateFailure { .. } => EXIT_GATE_FAILURE,
        }
    }
}

/// Result of [`Pipeline::run`].
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub run_id: String,
    pub identity: Identity,
    pub outcome: RunOutcome,
    pub report: Report,
    pub manifest: Manifest,
}

/// Result of [`Pipeline::reveal`].
#[derive(Debug, Clone)]
pub struct RevealOutput {
    pub identity: Identity,
    pub outcome: RunOutcome,
    /// True when the run had already been revealed and nothing was appended.
    pub already_revealed: bool,
    pub report: Report,
}

/// What the caller should print and exit with.
#[derive(Debug, Clone)]
pub struct Disclosure {
    pub report: Report,
    pub exit_code: i32,
}

fn expected_artifacts(blind: bool) -> Vec<&'static str> {
    let mut files = vec![PREREG_FILE, REPORT_FILE, SUMMARY_FILE];
    if blind {
        files.push(BLIND_MAP_FILE);
        files.push(SEALED_RESULTS_FILE);
    }
    files
}

fn digests_of(dir: &Path, files: &[&str]) -> Result<BTreeMap<String, String>> {
    files
        .iter()
        .map(|f| file_digest(&dir.join(f)).map(|digest| (f.to_string(), digest)))
        .collect()
}

/// Pipeline entry points.
pub struct Pipeline;

impl Pipeline {
    /// Execute one run against `config.output_path()`.
    pub fn run(config: &RunConfig, source: &dyn MetricSource) -> Result<RunOutput> {
        let start = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let provisional = derive_identity(config, None)?;
        let ledger = Ledger::open(config.output_path(), run_id.clone())?;

        let _span = RunSpan::enter(&run_id, provisional.short_aeq());
        emit_run_started(&run_id, config.seed(), config.blind());

        match Self::run_steps(config, source, &ledger, &provisional) {
            Ok(output) => {
                emit_run_finished(
                    &run_id,
                    start.elapsed().as_millis() as u64,
                    output.outcome.as_str(),
                );
                ledger.close()?;
                Ok(output)
            }
            Err(err) => {
                emit_run_aborted(&run_id, &err);
                if let Err(log_err) = ledger.record(
                    EventType::RunAborted,
                    &provisional,
                    json!({ "error": err.to_string(), "exit_code": err.exit_code() }),
                ) {
                    tracing::warn!(event = "ledger.abort_unrecorded", error = %log_err);
                }
                Err(err)
            }
        }
    }

    fn run_steps(
        config: &RunConfig,
        source: &dyn MetricSource,
        ledger: &Ledger,
        provisional: &Identity,
    ) -> Result<RunOutput> {
        let dir = config.output_path();
        let blind = config.blind();

        ledger.record(
            EventType::RunStart,
            provisional,
            json!({
                "seed": config.seed(),
                "blind": blind,
                "metric": config.metric(),
                "gates": config.gates(),
                "thresholds": config.thresholds(),
                "version": crate::VERSION,
            }),
        )?;

        let prereg_path = dir.join(PREREG_FILE);
        write_json_atomic(
            &prereg_path,
            &json!({
                "config": config.analysis_view(),
                "AEQ": provisional.aeq,
                "CID": provisional.cid,
            }),
        )?;
        ledger.record(
            EventType::PreregWritten,
            provisional,
            json!({ "file": PREREG_FILE, "sha256": file_digest(&prereg_path)? }),
        )?;

        let labels = if blind {
            let map = BlindMap::derive(config.seed());
            let path = dir.join(BLIND_MAP_FILE);
            write_json_atomic(&path, &map)?;
            ledger.record(
                EventType::BlindMapWritten,
                provisional,
                json!({ "file": BLIND_MAP_FILE, "sha256": file_digest(&path)? }),
            )?;
            map
        } else {
            BlindMap::identity(config.seed())
        };

        let metrics = source.collect(config)?;
        metrics.validate(config)?;
        let identity = derive_identity(config, Some(&metrics))?;
        emit_identity_derived(&identity.aeq, &identity.cid);
        ledger.record(
            EventType::IdentityDerived,
            &identity,
            json!({ "provisional_cid": provisional.cid }),
        )?;

        let verdict = evaluate_config(&metrics, config)?;
        for result in &verdict.results {
            let payload = if blind {
                json!({
                    "gate_name": result.gate_name,
                    "sealed": true,
                    "commitment": canonical_digest(result)?,
                })
            } else {
                serde_json::to_value(result)?
            };
            emit_gate_evaluated(&result.gate_name, (!blind).then_some(result.passed));
            ledger.record(EventType::GateEvaluated, &identity, payload)?;
        }

        let sealed = SealedResults {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            identity: identity.clone(),
            seed: config.seed(),
            labels,
            metrics,
            verdict,
        };

        let mut written = vec![REPORT_FILE, SUMMARY_FILE];
        let report = if blind {
            write_json_atomic(&dir.join(SEALED_RESULTS_FILE), &sealed)?;
            written.push(SEALED_RESULTS_FILE);
            Report::withheld(&sealed)
        } else {
            Report::disclosed(&sealed, false)
        };
        write_report(dir, &report)?;
        ledger.record(
            EventType::ResultsWritten,
            &identity,
            json!({ "files": digests_of(dir, &written)? }),
        )?;

        let outcome = if blind {
            ledger.record(
                EventType::RunCompleteBlinded,
                &identity,
                json!({ "gates": report.gates_evaluated, "withheld": true }),
            )?;
            RunOutcome::Blinded
        } else {
            let outcome = RunOutcome::from_verdict(&sealed.verdict);
            ledger.record(
                EventType::RunComplete,
                &identity,
                json!({
                    "overall_pass": sealed.overall_pass(),
                    "failed_gates": sealed.verdict.failed_gates(),
                }),
            )?;
            outcome
        };

        let manifest = Self::record_manifest(dir, &identity, blind, ledger)?;

        ledger.record(
            EventType::RunEnd,
            &identity,
            json!({ "status": outcome.as_str(), "exit_code": outcome.exit_code() }),
        )?;

        Ok(RunOutput {
            run_id: ledger.run_id().to_string(),
            identity,
            outcome,
            report,
            manifest,
        })
    }

    fn record_manifest(
        dir: &Path,
        identity: &Identity,
        blind: bool,
        ledger: &Ledger,
    ) -> Result<Manifest> {
        let manifest = manifest::build(dir, identity, &expected_artifacts(blind))?;
        ledger.record(
            EventType::ManifestBuilt,
            identity,
            json!({
                "file": MANIFEST_FILE,
                "sha256": file_digest(&dir.join(MANIFEST_FILE))?,
                "artifacts": manifest.files.len(),
            }),
        )?;
        Ok(manifest)
    }

    /// Disclose the blinded run recorded in `dir`.
    ///
    /// Appends exactly one `revealed` entry the first time. Later calls
    /// append nothing and re-disclose the results that entry recorded.
    /// Fails with a configuration error when no blinded run completed in
    /// `dir`, and with an integrity error when the sealed results no longer
    /// match what the blinded run committed to the ledger.
    pub fn reveal(dir: &Path, expected_seed: Option<u64>) -> Result<RevealOutput> {
        let entries = read_ledger(&dir.join(LEDGER_FILE))?;
        verify_chain(&entries)?;
        let action = plan_reveal(&entries)?;
        let completed = action.completed();

        let sealed = match &action {
            RevealAction::AlreadyRevealed { revealed, .. } => sealed_from_revealed(revealed)?,
            RevealAction::Disclose(_) => load_sealed(dir, &entries)?,
        };
        verify_sealed(&entries, completed, &sealed)?;

        if let Some(seed) = expected_seed {
            if seed != sealed.seed {
                return Err(PipelineError::config(format!(
                    "seed {seed} does not match blinded run seed {}",
                    sealed.seed
                )));
            }
        }

        let outcome = RunOutcome::from_verdict(&sealed.verdict);
        let report = Report::disclosed(&sealed, true);

        if let RevealAction::AlreadyRevealed { .. } = action {
            emit_revealed(&sealed.identity.aeq, true);
            return Ok(RevealOutput {
                identity: sealed.identity,
                outcome,
                already_revealed: true,
                report,
            });
        }

        let ledger = Ledger::open(dir, Uuid::new_v4().to_string())?;
        ledger.record(
            EventType::Revealed,
            &sealed.identity,
            json!({
                "blinded_run_id": completed.run_id,
                "blinded_sequence": completed.sequence,
                "overall_pass": sealed.overall_pass(),
                "metrics": sealed.metrics,
                "gates": sealed.verdict.results,
                "blind_map": sealed.labels.map_real_to_blind,
                "sealed": sealed,
            }),
        )?;
        emit_revealed(&sealed.identity.aeq, false);

        write_report(dir, &report)?;
        Self::record_manifest(dir, &sealed.identity, true, &ledger)?;
        ledger.close()?;

        Ok(RevealOutput {
            identity: sealed.identity,
            outcome,
            already_revealed: false,
            report,
        })
    }

    /// Run per `config`, revealing afterwards when `config.reveal()` is set.
    ///
    /// A reveal without `blind` targets an earlier blinded run in the same
    /// output directory and does not start a new run.
    pub fn execute(config: &RunConfig, source: &dyn MetricSource) -> Result<Disclosure> {
        if config.reveal() && !config.blind() {
            let revealed = Self::reveal(config.output_path(), Some(config.seed()))?;
            return Ok(Disclosure {
                exit_code: revealed.outcome.exit_code(),
                report: revealed.report,
            });
        }

        let run = Self::run(config, source)?;
        if config.reveal() {
            let revealed = Self::reveal(config.output_path(), Some(config.seed()))?;
            return Ok(Disclosure {
                exit_code: revealed.outcome.exit_code(),
                report: revealed.report,
            });
        }
        Ok(Disclosure {
            exit_code: run.outcome.exit_code(),
            report: run.report,
        })
    }

    /// Verify `manifest.json` and the ledger chain in `dir`.
    pub fn verify(dir: &Path) -> Result<Manifest> {
        let manifest = Manifest::load(dir)?;
        manifest::verify(&manifest, dir)?;
        verify_chain(&read_ledger(&dir.join(LEDGER_FILE))?)?;
        Ok(manifest)
    }
}

fn integrity(
    path: impl Into<String>,
    expected: impl Into<String>,
    actual: impl Into<String>,
) -> PipelineError {
    PipelineError::Integrity {
        path: path.into(),
        expected: expected.into(),
        actual: actual.into(),
    }
}

/// Read `sealed_results.json` for a first reveal.
///
/// `manifest.json` must match the digest chained into the latest
/// `manifest_built` entry, and the sealed file must match the manifest.
fn load_sealed(dir: &Path, entries: &[LedgerEntry]) -> Result<SealedResults> {
    let recorded = entries
        .iter()
        .rev()
        .find(|e| e.event_type == EventType::ManifestBuilt)
        .and_then(|e| e.payload.get("sha256")?.as_str())
        .unwrap_or("<unrecorded>");
    let actual = file_digest(&dir.join(MANIFEST_FILE))?;
    if recorded != actual {
        return Err(integrity(MANIFEST_FILE, recorded, actual));
    }

    let manifest = Manifest::load(dir)?;
    let sealed_path = dir.join(SEALED_RESULTS_FILE);
    let listed = manifest
        .files
        .get(SEALED_RESULTS_FILE)
        .map(String::as_str)
        .unwrap_or("<unlisted>");
    let actual = file_digest(&sealed_path)?;
    if listed != actual {
        return Err(integrity(SEALED_RESULTS_FILE, listed, actual));
    }
    read_json(&sealed_path)
}

/// Sealed results as recorded by an earlier `revealed` entry.
fn sealed_from_revealed(revealed: &LedgerEntry) -> Result<SealedResults> {
    let sealed = revealed.payload.get("sealed").cloned().ok_or_else(|| {
        integrity(
            format!("{LEDGER_FILE}#{}", revealed.sequence),
            "sealed results",
            "<absent>",
        )
    })?;
    Ok(serde_json::from_value(sealed)?)
}

/// Bind `sealed` to the blinded run: same identity, metrics that reproduce
/// the recorded CID, and verdicts matching every gate commitment.
fn verify_sealed(
    entries: &[LedgerEntry],
    completed: &LedgerEntry,
    sealed: &SealedResults,
) -> Result<()> {
    if sealed.identity != completed.identity() {
        return Err(integrity(
            SEALED_RESULTS_FILE,
            completed.identity().to_string(),
            sealed.identity.to_string(),
        ));
    }
    let cid = content_id(&completed.aeq, Some(&sealed.metrics))?;
    if cid != completed.cid {
        return Err(integrity(
            format!("{SEALED_RESULTS_FILE}#metrics"),
            completed.cid.clone(),
            cid,
        ));
    }
    check_commitments(entries, completed, sealed)
}

/// The sealed gate results must be exactly the gates the blinded run
/// committed, each matching its recorded commitment.
fn check_commitments(
    entries: &[LedgerEntry],
    completed: &LedgerEntry,
    sealed: &SealedResults,
) -> Result<()> {
    let committed: BTreeMap<&str, &str> = entries
        .iter()
        .filter(|e| e.event_type == EventType::GateEvaluated && e.run_id == completed.run_id)
        .filter_map(|e| {
            Some((
                e.payload.get("gate_name")?.as_str()?,
                e.payload.get("commitment")?.as_str()?,
            ))
        })
        .collect();

    for (gate, expected) in &committed {
        let actual = match sealed.verdict.results.iter().find(|r| r.gate_name == *gate) {
            Some(result) => canonical_digest(result)?,
            None => "<missing>".to_string(),
        };
        if *expected != actual {
            return Err(integrity(format!("{LEDGER_FILE}#{gate}"), *expected, actual));
        }
    }
    if let Some(extra) = sealed
        .verdict
        .results
        .iter()
        .find(|r| !committed.contains_key(r.gate_name.as_str()))
    {
        return Err(integrity(
            format!("{LEDGER_FILE}#{}", extra.gate_name),
            "<uncommitted>",
            canonical_digest(extra)?,
        ));
    }
    if sealed.verdict.results.len() != committed.len() {
        return Err(integrity(
            SEALED_RESULTS_FILE,
            format!("{} gate results", committed.len()),
            format!("{} gate results", sealed.verdict.results.len()),
        ));
    }
    Ok(())
}
