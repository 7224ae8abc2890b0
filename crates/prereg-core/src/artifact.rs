//! Artifact file I/O.
//!
//! Every artifact in the output directory is replaced atomically through a
//! `tempfile` in the same directory.

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{PipelineError, Result};

/// Write `body` atomically: temp file in the same directory, then rename.
/// Readers see either the old file or the new one, never a partial write.
pub fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| PipelineError::io(dir, e))?;
    tmp.write_all(body).map_err(|e| PipelineError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| PipelineError::io(path, e.error))?;
    Ok(())
}

/// Pretty JSON plus a trailing newline, written with [`write_atomic`].
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    write_atomic(path, body.as_bytes())
}

/// Read and parse a JSON artifact.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    Ok(serde_json::from_slice(&raw)?)
}
