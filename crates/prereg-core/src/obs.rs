//! Structured tracing hooks for the run lifecycle.
//!
//! Every hook emits one `info!` event with an `event` field naming the
//! lifecycle step, so log pipelines can filter on it.

use tracing::info;

/// RAII guard that keeps a run-scoped span entered for the duration of a run.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str, aeq: &str) -> Self {
        let span = tracing::info_span!("prereg.run", run_id = %run_id, aeq = %aeq);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_run_started(run_id: &str, seed: u64, blind: bool) {
    info!(event = "run.started", run_id = %run_id, seed = seed, blind = blind);
}

pub fn emit_identity_derived(aeq: &str, cid: &str) {
    info!(event = "identity.derived", aeq = %aeq, cid = %cid);
}

pub fn emit_entry_appended(run_id: &str, event_type: &str, sequence: u64) {
    info!(event = "ledger.appended", run_id = %run_id, event_type = %event_type, sequence = sequence);
}

/// Verdicts of blinded runs are not logged; pass `None` for `passed`.
pub fn emit_gate_evaluated(gate: &str, passed: Option<bool>) {
    match passed {
        Some(passed) => info!(event = "gate.evaluated", gate = %gate, passed = passed),
        None => info!(event = "gate.evaluated", gate = %gate, sealed = true),
    }
}

pub fn emit_manifest_built(aeq: &str, files: usize) {
    info!(event = "manifest.built", aeq = %aeq, files = files);
}

pub fn emit_revealed(aeq: &str, already_revealed: bool) {
    info!(event = "run.revealed", aeq = %aeq, already_revealed = already_revealed);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, status: &str) {
    info!(event = "run.finished", run_id = %run_id, duration_ms = duration_ms, status = %status);
}

/// Run aborted before completion (warning level).
pub fn emit_run_aborted(run_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "run.aborted", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_span_enters_without_subscriber() {
        let _span = RunSpan::enter("run-1", "abc");
    }
}
