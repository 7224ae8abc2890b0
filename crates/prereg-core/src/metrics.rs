//! Metric inputs from the external computation collaborator.
//!
//! The pipeline never computes metrics itself. It asks a [`MetricSource`]
//! for one value per condition and treats each value as an opaque float.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::{PipelineError, Result};

/// File name the collaborator writes into the output directory.
pub const METRICS_FILE: &str = "metrics.json";

/// One metric observed under each preregistered condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricSet {
    /// Metric name, e.g. `sharpe`.
    pub metric: String,
    pub baseline: f64,
    pub ablation: f64,
    pub negative_control: f64,
}

impl MetricSet {
    pub fn new(metric: impl Into<String>, baseline: f64, ablation: f64, negative_control: f64) -> Self {
        Self {
            metric: metric.into(),
            baseline,
            ablation,
            negative_control,
        }
    }

    /// Reject non-finite values and a metric name that does not match the
    /// preregistered one.
    pub fn validate(&self, config: &RunConfig) -> Result<()> {
        if self.metric != config.metric() {
            return Err(PipelineError::config(format!(
                "metric '{}' does not match preregistered metric '{}'",
                self.metric,
                config.metric()
            )));
        }
        for (condition, value) in self.by_condition() {
            if !value.is_finite() {
                return Err(PipelineError::config(format!(
                    "{condition} metric must be finite, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// `(condition, value)` pairs in preregistered order.
    pub fn by_condition(&self) -> [(&'static str, f64); 3] {
        [
            ("baseline", self.baseline),
            ("ablation", self.ablation),
            ("negative_control", self.negative_control),
        ]
    }
}

/// Supplier of condition metrics for a run.
pub trait MetricSource {
    fn collect(&self, config: &RunConfig) -> Result<MetricSet>;
}

/// Reads a collaborator-written JSON metrics file.
#[derive(Debug, Clone)]
pub struct JsonMetricSource {
    path: PathBuf,
}

impl JsonMetricSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<out>/metrics.json`.
    pub fn in_output_dir(out: &Path) -> Self {
        Self::new(out.join(METRICS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricSource for JsonMetricSource {
    fn collect(&self, _config: &RunConfig) -> Result<MetricSet> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            PipelineError::config(format!(
                "metrics not available at {}: {e}",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            PipelineError::config(format!("invalid metrics file {}: {e}", self.path.display()))
        })
    }
}

/// Fixed metric values, for embedding and tests.
#[derive(Debug, Clone)]
pub struct StaticMetricSource(pub MetricSet);

impl MetricSource for StaticMetricSource {
    fn collect(&self, _config: &RunConfig) -> Result<MetricSet> {
        Ok(self.0.clone())
    }
}
