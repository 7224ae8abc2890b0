//! Error taxonomy for the run pipeline.
//!
//! Gate failures are not errors: a run whose gates fail still executed
//! successfully and reports [`crate::RunOutcome::GateFailure`].

use std::path::PathBuf;

use crate::ledger::LedgerError;

/// Exit code for a run whose gates all passed (or a completed blinded run).
pub const EXIT_PASS: i32 = 0;
/// Exit code for a run where one or more gates failed.
pub const EXIT_GATE_FAILURE: i32 = 1;
/// Exit code for configuration and I/O errors.
pub const EXIT_CONFIG: i32 = 2;
/// Exit code for manifest integrity failures.
pub const EXIT_INTEGRITY: i32 = 3;

/// Pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("integrity error for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl PipelineError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        PipelineError::Config(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Integrity { .. } => EXIT_INTEGRITY,
            PipelineError::Ledger(LedgerError::Chain { .. }) => EXIT_INTEGRITY,
            _ => EXIT_CONFIG,
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_maps_to_exit_two() {
        let err = PipelineError::config("missing seed");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("missing seed"));
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }

    #[test]
    fn io_error_maps_to_exit_two() {
        let err = PipelineError::io(
            "/tmp/out/ledger.ndjson",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("ledger.ndjson"));
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }

    #[test]
    fn integrity_error_names_both_digests() {
        let err = PipelineError::Integrity {
            path: "report.json".to_string(),
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("def456"));
        assert_eq!(err.exit_code(), EXIT_INTEGRITY);
    }
}
