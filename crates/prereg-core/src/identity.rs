//! Deterministic run identifiers.
//!
//! - **AEQ**: SHA-256 of the canonical analysis view of a [`RunConfig`].
//!   Two configurations that describe the same analysis share an AEQ no
//!   matter where their output lands or in which order fields were given.
//! - **CID**: SHA-256 of the AEQ plus the observed metrics (or `null` before
//!   metrics exist). Same configuration with different outputs gives a
//!   different CID.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::RunConfig;
use crate::digest::canonical_digest;
use crate::error::{PipelineError, Result};
use crate::metrics::MetricSet;

/// Identifier pair for a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "AEQ")]
    pub aeq: String,
    #[serde(rename = "CID")]
    pub cid: String,
}

impl Identity {
    /// First 12 hex chars of the AEQ, for log lines.
    pub fn short_aeq(&self) -> &str {
        &self.aeq[..12.min(self.aeq.len())]
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AEQ={} CID={}", self.aeq, self.cid)
    }
}

/// Derive the identifier pair. Pure: no I/O, no clock, no randomness.
pub fn derive_identity(config: &RunConfig, metrics: Option<&MetricSet>) -> Result<Identity> {
    if let Some(set) = metrics {
        if let Some((condition, _)) = set.by_condition().iter().find(|(_, v)| !v.is_finite()) {
            return Err(PipelineError::config(format!(
                "cannot derive identity from non-finite {condition} metric"
            )));
        }
    }
    let aeq = canonical_digest(&config.analysis_view())?;
    let cid = content_id(&aeq, metrics)?;
    Ok(Identity { aeq, cid })
}

/// CID for an already-derived AEQ. Lets a recorded CID be rechecked against
/// metric values read back from disk.
pub fn content_id(aeq: &str, metrics: Option<&MetricSet>) -> Result<String> {
    canonical_digest(&json!({
        "AEQ": aeq,
        "metrics": metrics,
    }))
}
