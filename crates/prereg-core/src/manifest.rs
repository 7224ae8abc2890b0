//! Artifact manifest (`manifest.json`).
//!
//! Maps each artifact's path, relative to the output directory and joined
//! with `/`, to the SHA-256 of its bytes. Digests are always recomputed from
//! disk; nothing from an earlier manifest is reused.
//!
//! `manifest.json` itself and `ledger.ndjson` are not listed: the ledger
//! keeps growing after the manifest is written and carries its own hash
//! chain.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::artifact::{read_json, write_json_atomic};
use crate::digest::sha256_reader;
use crate::error::{PipelineError, Result};
use crate::identity::Identity;
use crate::ledger::LEDGER_FILE;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_SCHEMA_VERSION: &str = "1.0";

const UNLISTED: [&str; 2] = [MANIFEST_FILE, LEDGER_FILE];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    #[serde(rename = "AEQ")]
    pub aeq: String,
    #[serde(rename = "CID")]
    pub cid: String,
    /// Relative artifact path → lowercase hex SHA-256.
    pub files: BTreeMap<String, String>,
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// SHA-256 of one file, streamed.
pub fn file_digest(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    sha256_reader(file).map_err(|e| PipelineError::io(path, e))
}

impl Manifest {
    /// Hash every artifact under `dir`, sorted by relative path.
    ///
    /// Each name in `expected` must exist as a regular file, otherwise the
    /// build fails with an I/O error.
    pub fn compute(dir: &Path, identity: &Identity, expected: &[&str]) -> Result<Self> {
        for name in expected {
            let path = dir.join(name);
            if !path.is_file() {
                return Err(PipelineError::io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "expected artifact missing"),
                ));
            }
        }

        let mut files = BTreeMap::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
                PipelineError::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = relative_key(dir, entry.path()) else {
                continue;
            };
            if UNLISTED.contains(&key.as_str()) {
                continue;
            }
            files.insert(key, file_digest(entry.path())?);
        }

        Ok(Self {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            aeq: identity.aeq.clone(),
            cid: identity.cid.clone(),
            files,
        })
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        write_json_atomic(&Self::path_in(dir), self)
    }

    pub fn load(dir: &Path) -> Result<Self> {
        read_json(&Self::path_in(dir))
    }
}

/// Compute the manifest for `dir` and write it to `dir/manifest.json`.
pub fn build(dir: &Path, identity: &Identity, expected: &[&str]) -> Result<Manifest> {
    let manifest = Manifest::compute(dir, identity, expected)?;
    manifest.write(dir)?;
    crate::obs::emit_manifest_built(&identity.aeq, manifest.files.len());
    Ok(manifest)
}

/// Recompute every listed digest and compare against `manifest`.
///
/// A missing or changed file is an integrity error; it is reported, never
/// repaired.
pub fn verify(manifest: &Manifest, dir: &Path) -> Result<()> {
    for (key, expected) in &manifest.files {
        let path = dir.join(key);
        if !path.is_file() {
            return Err(PipelineError::Integrity {
                path: key.clone(),
                expected: expected.clone(),
                actual: "<missing>".to_string(),
            });
        }
        let actual = file_digest(&path)?;
        if &actual != expected {
            return Err(PipelineError::Integrity {
                path: key.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_hex;

    fn identity() -> Identity {
        Identity {
            aeq: "a".repeat(64),
            cid: "c".repeat(64),
        }
    }

    fn populate(dir: &Path) {
        std::fs::write(dir.join("report.json"), b"{}\n").unwrap();
        std::fs::write(dir.join("prereg.json"), b"{\"seed\":1}\n").unwrap();
        std::fs::create_dir_all(dir.join("plots")).unwrap();
        std::fs::write(dir.join("plots").join("equity.csv"), b"t,v\n0,1\n").unwrap();
        std::fs::write(dir.join(LEDGER_FILE), b"{}\n").unwrap();
    }

    #[test]
    fn digests_match_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let m = build(dir.path(), &identity(), &["report.json"]).unwrap();

        assert_eq!(m.files["report.json"], sha256_hex(b"{}\n"));
        assert_eq!(m.files["plots/equity.csv"], sha256_hex(b"t,v\n0,1\n"));
        assert!(!m.files.contains_key(LEDGER_FILE));
        assert!(!m.files.contains_key(MANIFEST_FILE));
        assert_eq!(Manifest::load(dir.path()).unwrap(), m);
    }

    #[test]
    fn keys_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let m = Manifest::compute(dir.path(), &identity(), &[]).unwrap();
        let keys: Vec<&String> = m.files.keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn missing_expected_artifact_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let err = build(dir.path(), &identity(), &["results.json"]).unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
        assert!(!dir.path().join(MANIFEST_FILE).exists());
    }

    #[test]
    fn verify_detects_modified_artifact() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let m = build(dir.path(), &identity(), &[]).unwrap();
        verify(&m, dir.path()).unwrap();

        std::fs::write(dir.path().join("report.json"), b"{\"tampered\":true}\n").unwrap();
        match verify(&m, dir.path()) {
            Err(PipelineError::Integrity { path, .. }) => assert_eq!(path, "report.json"),
            other => panic!("expected Integrity, got {other:?}"),
        }
    }

    #[test]
    fn verify_detects_deleted_artifact() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let m = build(dir.path(), &identity(), &[]).unwrap();
        std::fs::remove_file(dir.path().join("prereg.json")).unwrap();
        assert!(matches!(
            verify(&m, dir.path()),
            Err(PipelineError::Integrity { ref actual, .. }) if actual == "<missing>"
        ));
    }

    #[test]
    fn ledger_growth_does_not_invalidate_manifest() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let m = build(dir.path(), &identity(), &[]).unwrap();
        std::fs::write(dir.path().join(LEDGER_FILE), b"{}\n{}\n").unwrap();
        verify(&m, dir.path()).unwrap();
    }
}
