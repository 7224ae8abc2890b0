//! Run configuration and preregistration.
//!
//! A [`RunConfig`] is immutable once built. Every required field is checked
//! in [`RunConfigBuilder::build`] so invalid input is rejected before any
//! file is touched or any metric is observed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{PipelineError, Result};

/// Metric name used when the preregistration does not name one.
pub const DEFAULT_METRIC: &str = "sharpe";

/// Condition names, in preregistered order.
pub const CONDITIONS: [&str; 3] = ["baseline", "ablation", "negative_control"];

/// Which side of the threshold a gate accepts. Fixed per gate, never inferred
/// from the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Passes when `observed >= threshold`.
    AtLeast,
    /// Passes when `observed <= threshold`.
    AtMost,
}

impl Direction {
    /// Closed-boundary comparison: equality passes in both directions.
    pub fn accepts(self, observed: f64, threshold: f64) -> bool {
        match self {
            Direction::AtLeast => observed >= threshold,
            Direction::AtMost => observed <= threshold,
        }
    }
}

/// A preregistered gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    /// `ablation - baseline >= threshold`.
    Delta,
    /// `negative_control <= threshold`.
    NegativeControl,
    /// `baseline >= threshold`.
    BaselineMin,
}

impl GateKind {
    pub const ALL: [GateKind; 3] = [
        GateKind::Delta,
        GateKind::NegativeControl,
        GateKind::BaselineMin,
    ];

    /// Stable name, also the key into the threshold map.
    pub fn name(self) -> &'static str {
        match self {
            GateKind::Delta => "delta",
            GateKind::NegativeControl => "negative_control",
            GateKind::BaselineMin => "baseline_min",
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            GateKind::Delta | GateKind::BaselineMin => Direction::AtLeast,
            GateKind::NegativeControl => Direction::AtMost,
        }
    }

    /// Preregistered default threshold.
    pub fn default_threshold(self) -> f64 {
        match self {
            GateKind::Delta => 0.30,
            GateKind::NegativeControl => 0.25,
            GateKind::BaselineMin => 0.50,
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GateKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        GateKind::ALL
            .into_iter()
            .find(|g| g.name() == s)
            .ok_or_else(|| PipelineError::config(format!("unknown gate: {s}")))
    }
}

/// Preregistration document loaded from disk (`--prereg <file>`).
///
/// Every field is optional; absent fields keep the built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PreregFile {
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub gates: Option<Vec<String>>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl PreregFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!(
                "cannot read preregistration {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            PipelineError::config(format!("invalid preregistration {}: {e}", path.display()))
        })
    }
}

/// Fully validated run configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    seed: u64,
    output_path: PathBuf,
    blind: bool,
    reveal: bool,
    metric: String,
    gates: Vec<GateKind>,
    thresholds: BTreeMap<String, f64>,
    notes: String,
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn blind(&self) -> bool {
        self.blind
    }

    pub fn reveal(&self) -> bool {
        self.reveal
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Configured gates, sorted and de-duplicated.
    pub fn gates(&self) -> &[GateKind] {
        &self.gates
    }

    pub fn thresholds(&self) -> &BTreeMap<String, f64> {
        &self.thresholds
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    /// The part of the configuration that defines what analysis is run.
    ///
    /// Excludes `output_path` (where results land) and `reveal` (a
    /// disclosure action, not an analysis choice).
    pub fn analysis_view(&self) -> serde_json::Value {
        json!({
            "seed": self.seed,
            "blind": self.blind,
            "metric": self.metric,
            "conditions": CONDITIONS,
            "gates": self.gates.iter().map(|g| g.name()).collect::<Vec<_>>(),
            "thresholds": self.thresholds,
            "notes": self.notes,
        })
    }
}

/// Builder for [`RunConfig`]. Validation happens once, in [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct RunConfigBuilder {
    seed: Option<u64>,
    output_path: Option<PathBuf>,
    blind: bool,
    reveal: bool,
    metric: Option<String>,
    gates: Option<Vec<String>>,
    thresholds: BTreeMap<String, f64>,
    notes: Option<String>,
}

impl RunConfigBuilder {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn blind(mut self, blind: bool) -> Self {
        self.blind = blind;
        self
    }

    pub fn reveal(mut self, reveal: bool) -> Self {
        self.reveal = reveal;
        self
    }

    pub fn metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = Some(metric.into());
        self
    }

    /// Replace the configured gate list.
    pub fn gates<I, S>(mut self, gates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gates = Some(gates.into_iter().map(Into::into).collect());
        self
    }

    /// Set one gate threshold, overriding the default.
    pub fn threshold(mut self, gate: impl Into<String>, value: f64) -> Self {
        self.thresholds.insert(gate.into(), value);
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Overlay a preregistration document.
    pub fn prereg(mut self, file: PreregFile) -> Self {
        if let Some(metric) = file.metric {
            self.metric = Some(metric);
        }
        if let Some(gates) = file.gates {
            self.gates = Some(gates);
        }
        self.thresholds.extend(file.thresholds);
        if let Some(notes) = file.notes {
            self.notes = Some(notes);
        }
        self
    }

    pub fn build(self) -> Result<RunConfig> {
        let seed = self
            .seed
            .ok_or_else(|| PipelineError::config("missing required field: seed"))?;
        let output_path = self
            .output_path
            .ok_or_else(|| PipelineError::config("missing required field: output_path"))?;
        if output_path.as_os_str().is_empty() {
            return Err(PipelineError::config("output_path must not be empty"));
        }

        let metric = self.metric.unwrap_or_else(|| DEFAULT_METRIC.to_string());
        if metric.trim().is_empty() {
            return Err(PipelineError::config("metric name must not be empty"));
        }

        let explicit_gates = self.gates.is_some();
        let mut gates = match self.gates {
            Some(names) => names
                .iter()
                .map(|n| n.parse::<GateKind>())
                .collect::<Result<Vec<_>>>()?,
            None => GateKind::ALL.to_vec(),
        };
        gates.sort();
        gates.dedup();

        let mut thresholds = BTreeMap::new();
        if !explicit_gates {
            for gate in &gates {
                thresholds.insert(gate.name().to_string(), gate.default_threshold());
            }
        }
        for (name, value) in self.thresholds {
            let gate: GateKind = name.parse()?;
            if !value.is_finite() {
                return Err(PipelineError::config(format!(
                    "threshold for gate '{gate}' must be finite"
                )));
            }
            thresholds.insert(name, value);
        }

        for gate in &gates {
            if !thresholds.contains_key(gate.name()) {
                return Err(PipelineError::config(format!(
                    "missing threshold for configured gate '{gate}'"
                )));
            }
        }
        thresholds.retain(|name, _| gates.iter().any(|g| g.name() == name));

        Ok(RunConfig {
            seed,
            output_path,
            blind: self.blind,
            reveal: self.reveal,
            metric,
            gates,
            thresholds,
            notes: self.notes.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RunConfigBuilder {
        RunConfig::builder().seed(123).output_path("out")
    }

    #[test]
    fn defaults_configure_all_gates() {
        let config = base().build().unwrap();
        assert_eq!(config.gates(), &GateKind::ALL);
        assert_eq!(config.thresholds()["delta"], 0.30);
        assert_eq!(config.thresholds()["negative_control"], 0.25);
        assert_eq!(config.thresholds()["baseline_min"], 0.50);
        assert_eq!(config.metric(), DEFAULT_METRIC);
    }

    #[test]
    fn missing_seed_is_rejected() {
        let err = RunConfig::builder().output_path("out").build().unwrap_err();
        assert!(matches!(err, PipelineError::Config(ref m) if m.contains("seed")));
    }

    #[test]
    fn missing_output_path_is_rejected() {
        let err = RunConfig::builder().seed(1).build().unwrap_err();
        assert!(matches!(err, PipelineError::Config(ref m) if m.contains("output_path")));
    }

    #[test]
    fn empty_output_path_is_rejected() {
        let err = RunConfig::builder().seed(1).output_path("").build().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn explicit_gate_without_threshold_is_rejected() {
        let err = base().gates(["delta"]).build().unwrap_err();
        assert!(matches!(err, PipelineError::Config(ref m) if m.contains("delta")));
    }

    #[test]
    fn explicit_gates_take_only_their_thresholds() {
        let config = base()
            .gates(["negative_control", "delta"])
            .threshold("delta", 0.03)
            .threshold("negative_control", 0.02)
            .build()
            .unwrap();
        assert_eq!(
            config.gates(),
            &[GateKind::Delta, GateKind::NegativeControl]
        );
        assert_eq!(config.thresholds().len(), 2);
    }

    #[test]
    fn unknown_gate_is_rejected() {
        let err = base().threshold("sortino", 1.0).build().unwrap_err();
        assert!(matches!(err, PipelineError::Config(ref m) if m.contains("sortino")));
    }

    #[test]
    fn non_finite_threshold_is_rejected() {
        let err = base().threshold("delta", f64::NAN).build().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn prereg_file_overrides_defaults() {
        let file: PreregFile = serde_json::from_str(
            r#"{ "metric": "hit_rate", "gates": ["delta"], "thresholds": { "delta": 0.05 } }"#,
        )
        .unwrap();
        let config = base().prereg(file).build().unwrap();
        assert_eq!(config.metric(), "hit_rate");
        assert_eq!(config.gates(), &[GateKind::Delta]);
        assert_eq!(config.thresholds()["delta"], 0.05);
    }

    #[test]
    fn prereg_file_rejects_unknown_fields() {
        let parsed: std::result::Result<PreregFile, _> =
            serde_json::from_str(r#"{ "threshold": { "delta": 0.05 } }"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn analysis_view_excludes_output_path_and_reveal() {
        let a = base().output_path("a").build().unwrap();
        let b = base().output_path("b").reveal(true).build().unwrap();
        assert_eq!(a.analysis_view(), b.analysis_view());
    }

    #[test]
    fn direction_boundaries_are_closed() {
        assert!(Direction::AtLeast.accepts(0.03, 0.03));
        assert!(Direction::AtMost.accepts(0.02, 0.02));
        assert!(!Direction::AtLeast.accepts(0.029, 0.03));
        assert!(!Direction::AtMost.accepts(0.021, 0.02));
    }
}
