//! Preregistered gate evaluation.
//!
//! Applies each configured [`GateKind`] to a [`MetricSet`] and produces one
//! [`GateResult`] per gate. The run outcome is the logical AND of all gate
//! results. Evaluation is pure and never skips a configured gate: a missing
//! threshold is a configuration error, not a pass.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{Direction, GateKind, RunConfig};
use crate::error::{PipelineError, Result};
use crate::metrics::MetricSet;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_name: String,
    pub passed: bool,
    /// Value compared against the threshold (for `delta`, the difference).
    pub observed_value: f64,
    pub threshold: f64,
    pub direction: Direction,
}

/// All gate results for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub results: Vec<GateResult>,
}

impl GateVerdict {
    /// Whether every gate passed. An empty gate set passes.
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Names of the gates that failed, in evaluation order.
    pub fn failed_gates(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.gate_name.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

fn observed(gate: GateKind, metrics: &MetricSet) -> f64 {
    match gate {
        GateKind::Delta => metrics.ablation - metrics.baseline,
        GateKind::NegativeControl => metrics.negative_control,
        GateKind::BaselineMin => metrics.baseline,
    }
}

/// Evaluate `gates` against `metrics` using the preregistered `thresholds`.
pub fn evaluate(
    metrics: &MetricSet,
    gates: &[GateKind],
    thresholds: &BTreeMap<String, f64>,
) -> Result<GateVerdict> {
    let mut results = Vec::with_capacity(gates.len());
    for &gate in gates {
        let threshold = *thresholds.get(gate.name()).ok_or_else(|| {
            PipelineError::config(format!("missing threshold for configured gate '{gate}'"))
        })?;
        let observed_value = observed(gate, metrics);
        let direction = gate.direction();
        results.push(GateResult {
            gate_name: gate.name().to_string(),
            passed: direction.accepts(observed_value, threshold),
            observed_value,
            threshold,
            direction,
        });
    }
    Ok(GateVerdict { results })
}

/// Evaluate the gates a [`RunConfig`] preregistered.
pub fn evaluate_config(metrics: &MetricSet, config: &RunConfig) -> Result<GateVerdict> {
    evaluate(metrics, config.gates(), config.thresholds())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    const DELTA_AND_NOISE: [GateKind; 2] = [GateKind::Delta, GateKind::NegativeControl];

    #[test]
    fn delta_above_threshold_passes() {
        let m = MetricSet::new("sharpe", 0.10, 0.14, 0.01);
        let v = evaluate(&m, &[GateKind::Delta], &thresholds(&[("delta", 0.03)])).unwrap();
        assert!(v.passed());
        assert!((v.results[0].observed_value - 0.04).abs() < 1e-12);
        assert_eq!(v.results[0].direction, Direction::AtLeast);
    }

    #[test]
    fn delta_below_threshold_fails() {
        let m = MetricSet::new("sharpe", 0.10, 0.11, 0.01);
        let v = evaluate(&m, &[GateKind::Delta], &thresholds(&[("delta", 0.03)])).unwrap();
        assert!(!v.passed());
        assert_eq!(v.failed_gates(), vec!["delta".to_string()]);
    }

    #[test]
    fn delta_at_threshold_passes() {
        let m = MetricSet::new("sharpe", 0.0, 0.5, 0.0);
        let v = evaluate(&m, &[GateKind::Delta], &thresholds(&[("delta", 0.5)])).unwrap();
        assert!(v.passed());
    }

    #[test]
    fn delta_is_ablation_minus_baseline() {
        let m = MetricSet::new("sharpe", 0.14, 0.10, 0.0);
        let v = evaluate(&m, &[GateKind::Delta], &thresholds(&[("delta", 0.03)])).unwrap();
        assert!(!v.passed());
        assert!(v.results[0].observed_value < 0.0);
    }

    #[test]
    fn negative_control_within_noise_passes() {
        let m = MetricSet::new("sharpe", 0.10, 0.14, 0.01);
        let v = evaluate(
            &m,
            &[GateKind::NegativeControl],
            &thresholds(&[("negative_control", 0.02)]),
        )
        .unwrap();
        assert!(v.passed());
        assert_eq!(v.results[0].direction, Direction::AtMost);
    }

    #[test]
    fn negative_control_failure_fails_run_even_when_delta_passes() {
        let m = MetricSet::new("sharpe", 0.10, 0.14, 0.05);
        let v = evaluate(
            &m,
            &DELTA_AND_NOISE,
            &thresholds(&[("delta", 0.03), ("negative_control", 0.02)]),
        )
        .unwrap();
        assert!(v.results[0].passed);
        assert!(!v.results[1].passed);
        assert!(!v.passed());
        assert_eq!(v.failed_gates(), vec!["negative_control".to_string()]);
    }

    #[test]
    fn missing_threshold_is_an_error_not_a_skip() {
        let m = MetricSet::new("sharpe", 0.10, 0.14, 0.01);
        let err = evaluate(&m, &DELTA_AND_NOISE, &thresholds(&[("delta", 0.03)])).unwrap_err();
        assert!(matches!(err, PipelineError::Config(ref msg) if msg.contains("negative_control")));
    }

    #[test]
    fn baseline_min_gate_checks_baseline_metric() {
        let m = MetricSet::new("sharpe", 0.40, 0.90, 0.0);
        let v = evaluate(
            &m,
            &[GateKind::BaselineMin],
            &thresholds(&[("baseline_min", 0.50)]),
        )
        .unwrap();
        assert!(!v.passed());
        assert_eq!(v.results[0].observed_value, 0.40);
    }

    #[test]
    fn empty_gate_set_passes() {
        let m = MetricSet::new("sharpe", 0.0, 0.0, 0.0);
        let v = evaluate(&m, &[], &BTreeMap::new()).unwrap();
        assert!(v.passed());
        assert!(v.results.is_empty());
    }

    #[test]
    fn evaluate_config_uses_preregistered_gates() {
        let config = RunConfig::builder()
            .seed(1)
            .output_path("out")
            .gates(["delta"])
            .threshold("delta", 0.03)
            .build()
            .unwrap();
        let v = evaluate_config(&MetricSet::new("sharpe", 0.10, 0.14, 0.9), &config).unwrap();
        assert_eq!(v.results.len(), 1);
        assert!(v.passed());
    }
}
