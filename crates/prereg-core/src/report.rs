//! Run reports.
//!
//! `report.json` is what a run discloses: full results for open runs,
//! identifiers and blinded labels only while a run is blinded.
//! `summary.md` is the same content rendered for humans. Complete results of
//! a blinded run wait in `sealed_results.json` until reveal.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{write_atomic, write_json_atomic};
use crate::blind::BlindMap;
use crate::error::Result;
use crate::gate::{GateResult, GateVerdict};
use crate::identity::Identity;
use crate::metrics::MetricSet;

pub const REPORT_FILE: &str = "report.json";
pub const SUMMARY_FILE: &str = "summary.md";
pub const SEALED_RESULTS_FILE: &str = "sealed_results.json";
pub const PREREG_FILE: &str = "prereg.json";
pub const REPORT_SCHEMA_VERSION: &str = "1.0";

/// Disclosure status of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Passed,
    GateFailure,
    Blinded,
}

/// Complete results of a run. Disclosed directly for unblinded runs; kept in
/// `sealed_results.json` until reveal for blinded ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedResults {
    pub schema_version: String,
    #[serde(flatten)]
    pub identity: Identity,
    pub seed: u64,
    pub labels: BlindMap,
    pub metrics: MetricSet,
    pub verdict: GateVerdict,
}

impl SealedResults {
    pub fn overall_pass(&self) -> bool {
        self.verdict.passed()
    }
}

/// `report.json`: what a run discloses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub identity: Identity,
    pub seed: u64,
    pub blind: bool,
    pub revealed: bool,
    pub status: ReportStatus,
    /// True while metric values and verdicts are held back.
    pub withheld: bool,
    /// Condition labels as disclosed (opaque while blinded).
    pub conditions: Vec<String>,
    /// Gate names that were evaluated.
    pub gates_evaluated: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gates: Option<Vec<GateResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_pass: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blind_map: Option<BTreeMap<String, String>>,
}

impl Report {
    /// Full disclosure of `results`.
    pub fn disclosed(results: &SealedResults, blind: bool) -> Self {
        let metrics = results
            .metrics
            .by_condition()
            .iter()
            .map(|(c, v)| (c.to_string(), *v))
            .collect();
        let passed = results.overall_pass();
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            identity: results.identity.clone(),
            seed: results.seed,
            blind,
            revealed: blind,
            status: if passed {
                ReportStatus::Passed
            } else {
                ReportStatus::GateFailure
            },
            withheld: false,
            conditions: results
                .metrics
                .by_condition()
                .iter()
                .map(|(c, _)| c.to_string())
                .collect(),
            gates_evaluated: gate_names(&results.verdict),
            metrics: Some(metrics),
            gates: Some(results.verdict.results.clone()),
            overall_pass: Some(passed),
            blind_map: blind.then(|| results.labels.map_real_to_blind.clone()),
        }
    }

    /// Blinded disclosure: identifiers and labels only.
    pub fn withheld(results: &SealedResults) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            identity: results.identity.clone(),
            seed: results.seed,
            blind: true,
            revealed: false,
            status: ReportStatus::Blinded,
            withheld: true,
            conditions: results.labels.labels(),
            gates_evaluated: gate_names(&results.verdict),
            metrics: None,
            gates: None,
            overall_pass: None,
            blind_map: None,
        }
    }
}

fn gate_names(verdict: &GateVerdict) -> Vec<String> {
    verdict.results.iter().map(|r| r.gate_name.clone()).collect()
}

/// Render the markdown summary written next to `report.json`.
pub fn render_summary_md(report: &Report) -> String {
    let mut out = String::new();
    out.push_str("# Run Summary\n\n");
    out.push_str(&format!(
        "- AEQ: `{}`\n- CID: `{}`\n- seed: {}\n- status: {}\n\n",
        report.identity.aeq,
        report.identity.cid,
        report.seed,
        match report.status {
            ReportStatus::Passed => "passed",
            ReportStatus::GateFailure => "gate failure",
            ReportStatus::Blinded => "blinded",
        }
    ));

    if report.withheld {
        out.push_str("Results are withheld until reveal.\n\n");
        out.push_str("## Gates\n");
        for g in &report.gates_evaluated {
            out.push_str(&format!("- `{}`: withheld\n", g));
        }
        return out;
    }

    if let Some(metrics) = &report.metrics {
        out.push_str("## Metrics\n");
        for c in &report.conditions {
            if let Some(v) = metrics.get(c) {
                out.push_str(&format!("- {}: {}\n", c, v));
            }
        }
        out.push('\n');
    }

    if let Some(gates) = &report.gates {
        out.push_str("## Gates\n");
        for g in gates {
            out.push_str(&format!(
                "- `{}`: {} (observed {}, threshold {}, {})\n",
                g.gate_name,
                if g.passed { "pass" } else { "FAIL" },
                g.observed_value,
                g.threshold,
                match g.direction {
                    crate::config::Direction::AtLeast => ">=",
                    crate::config::Direction::AtMost => "<=",
                }
            ));
        }
    }
    out
}

/// Write `report.json` and `summary.md`.
pub fn write_report(dir: &Path, report: &Report) -> Result<()> {
    write_json_atomic(&dir.join(REPORT_FILE), report)?;
    write_atomic(&dir.join(SUMMARY_FILE), render_summary_md(report).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Direction, GateKind};
    use crate::gate::evaluate;

    fn sealed(negative_control: f64) -> SealedResults {
        let metrics = MetricSet::new("sharpe", 0.10, 0.14, negative_control);
        let thresholds = [("delta".to_string(), 0.03), ("negative_control".to_string(), 0.02)]
            .into_iter()
            .collect();
        let verdict = evaluate(
            &metrics,
            &[GateKind::Delta, GateKind::NegativeControl],
            &thresholds,
        )
        .unwrap();
        SealedResults {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            identity: Identity {
                aeq: "a".repeat(64),
                cid: "c".repeat(64),
            },
            seed: 7,
            labels: BlindMap::derive(7),
            metrics,
            verdict,
        }
    }

    #[test]
    fn withheld_report_hides_values_and_verdicts() {
        let report = Report::withheld(&sealed(0.01));
        let raw = serde_json::to_value(&report).unwrap();
        assert_eq!(raw["status"], "blinded");
        assert_eq!(raw["withheld"], true);
        assert!(raw.get("metrics").is_none());
        assert!(raw.get("gates").is_none());
        assert!(raw.get("overall_pass").is_none());
        assert_eq!(raw["AEQ"], "a".repeat(64));
        assert_eq!(raw["conditions"], serde_json::json!(["C1", "C2", "C3"]));
    }

    #[test]
    fn disclosed_report_carries_verdicts() {
        let report = Report::disclosed(&sealed(0.05), false);
        assert_eq!(report.status, ReportStatus::GateFailure);
        assert_eq!(report.overall_pass, Some(false));
        let gates = report.gates.as_ref().unwrap();
        assert_eq!(gates[1].gate_name, "negative_control");
        assert_eq!(gates[1].direction, Direction::AtMost);
        assert!(report.blind_map.is_none());
    }

    #[test]
    fn revealed_report_includes_blind_map() {
        let report = Report::disclosed(&sealed(0.01), true);
        assert!(report.revealed);
        assert_eq!(report.status, ReportStatus::Passed);
        assert_eq!(report.blind_map.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn summary_markdown_marks_failures() {
        let md = render_summary_md(&Report::disclosed(&sealed(0.05), false));
        assert!(md.starts_with("# Run Summary\n"));
        assert!(md.contains("- `delta`: pass"));
        assert!(md.contains("- `negative_control`: FAIL"));
    }

    #[test]
    fn write_report_replaces_both_files() {
        let dir = tempfile::tempdir().unwrap();
        write_report(dir.path(), &Report::withheld(&sealed(0.05))).unwrap();
        write_report(dir.path(), &Report::disclosed(&sealed(0.05), true)).unwrap();

        let md = std::fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap();
        assert!(md.contains("FAIL"));
        assert!(!md.contains("withheld until reveal"));
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn summary_markdown_withholds_when_blinded() {
        let md = render_summary_md(&Report::withheld(&sealed(0.05)));
        assert!(md.contains("withheld until reveal"));
        assert!(!md.contains("FAIL"));
        assert!(!md.contains("0.14"));
    }
}
