//! Append-only audit ledger (`ledger.ndjson`).
//!
//! One JSON record per line. The file is opened once in append mode and
//! never seeked or truncated. All writes go through a single mutex-guarded
//! handle, and each record is written with one `write_all` of the complete
//! line (newline included), so no reader can observe two records
//! interleaved. An interrupted write can leave at most one unterminated
//! fragment at the end of the file; [`read_ledger`] ignores it and
//! [`Ledger::open`] refuses to append after it.
//!
//! Entries are hash-chained: `hash` is the SHA-256 of the canonical entry
//! without its `hash` field, and `prev_hash` repeats the previous entry's
//! `hash`. Sequence numbers continue across runs against the same directory.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::digest::{canonical_digest, ZERO_DIGEST};
use crate::identity::Identity;

/// File name of the ledger inside the output directory.
pub const LEDGER_FILE: &str = "ledger.ndjson";

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed ledger record on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "ledger {} ends with an unterminated record at byte {offset}; \
         move it aside with `prereg --out <dir> --repair-ledger` before appending",
        path.display()
    )]
    TornRecord { path: PathBuf, offset: u64 },

    #[error("ledger chain broken at sequence {sequence}: {reason}")]
    Chain { sequence: u64, reason: String },

    #[error("ledger lock poisoned")]
    Poisoned,

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        LedgerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Pipeline event kinds. Each pipeline step appends exactly one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStart,
    PreregWritten,
    IdentityDerived,
    BlindMapWritten,
    GateEvaluated,
    ResultsWritten,
    RunComplete,
    RunCompleteBlinded,
    Revealed,
    ManifestBuilt,
    RunAborted,
    RunEnd,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RunStart => "run_start",
            EventType::PreregWritten => "prereg_written",
            EventType::IdentityDerived => "identity_derived",
            EventType::BlindMapWritten => "blind_map_written",
            EventType::GateEvaluated => "gate_evaluated",
            EventType::ResultsWritten => "results_written",
            EventType::RunComplete => "run_complete",
            EventType::RunCompleteBlinded => "run_complete_blinded",
            EventType::Revealed => "revealed",
            EventType::ManifestBuilt => "manifest_built",
            EventType::RunAborted => "run_aborted",
            EventType::RunEnd => "run_end",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger record before the ledger assigns its sequence and chain hashes.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub event_type: EventType,
    pub identity: Identity,
    pub payload: Value,
}

impl NewEntry {
    pub fn new(event_type: EventType, identity: &Identity, payload: Value) -> Self {
        Self {
            event_type,
            identity: identity.clone(),
            payload,
        }
    }
}

/// One immutable line of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    /// Invocation that wrote this entry.
    pub run_id: String,
    #[serde(rename = "AEQ")]
    pub aeq: String,
    #[serde(rename = "CID")]
    pub cid: String,
    pub payload: Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Borrowed view of an entry minus its `hash`, the input to the chain digest.
#[derive(Serialize)]
struct ChainBody<'a> {
    sequence: u64,
    timestamp: &'a DateTime<Utc>,
    event_type: EventType,
    run_id: &'a str,
    #[serde(rename = "AEQ")]
    aeq: &'a str,
    #[serde(rename = "CID")]
    cid: &'a str,
    payload: &'a Value,
    prev_hash: &'a str,
}

impl LedgerEntry {
    fn chain_body(&self) -> ChainBody<'_> {
        ChainBody {
            sequence: self.sequence,
            timestamp: &self.timestamp,
            event_type: self.event_type,
            run_id: &self.run_id,
            aeq: &self.aeq,
            cid: &self.cid,
            payload: &self.payload,
            prev_hash: &self.prev_hash,
        }
    }

    /// Recompute this entry's chain hash from its content.
    pub fn compute_hash(&self) -> LedgerResult<String> {
        canonical_digest(&self.chain_body()).map_err(|e| LedgerError::Chain {
            sequence: self.sequence,
            reason: e.to_string(),
        })
    }

    pub fn identity(&self) -> Identity {
        Identity {
            aeq: self.aeq.clone(),
            cid: self.cid.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

struct Scan {
    entries: Vec<LedgerEntry>,
    torn_at: Option<u64>,
}

fn scan(path: &Path) -> LedgerResult<Scan> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Scan {
                entries: Vec::new(),
                torn_at: None,
            })
        }
        Err(e) => return Err(LedgerError::io(path, e)),
    };

    let mut entries = Vec::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;
    while offset < raw.len() {
        let Some(rel_end) = raw[offset..].iter().position(|&b| b == b'\n') else {
            return Ok(Scan {
                entries,
                torn_at: Some(offset as u64),
            });
        };
        line_no += 1;
        let line = &raw[offset..offset + rel_end];
        offset += rel_end + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let entry = serde_json::from_slice(line).map_err(|source| LedgerError::Malformed {
            line: line_no,
            source,
        })?;
        entries.push(entry);
    }
    Ok(Scan {
        entries,
        torn_at: None,
    })
}

/// Read every complete record from a ledger file, oldest first.
///
/// A missing file reads as empty. An unterminated trailing fragment (an
/// interrupted append) is skipped.
pub fn read_ledger(path: &Path) -> LedgerResult<Vec<LedgerEntry>> {
    let scan = scan(path)?;
    if let Some(offset) = scan.torn_at {
        tracing::warn!(
            event = "ledger.torn_tail",
            path = %path.display(),
            offset = offset,
            "ignoring unterminated trailing record"
        );
    }
    Ok(scan.entries)
}

/// Check sequence continuity and hash links over a full ledger.
pub fn verify_chain(entries: &[LedgerEntry]) -> LedgerResult<()> {
    let mut prev_hash = ZERO_DIGEST.to_string();
    for (i, entry) in entries.iter().enumerate() {
        let expected_seq = i as u64 + 1;
        if entry.sequence != expected_seq {
            return Err(LedgerError::Chain {
                sequence: entry.sequence,
                reason: format!("expected sequence {expected_seq}"),
            });
        }
        if entry.prev_hash != prev_hash {
            return Err(LedgerError::Chain {
                sequence: entry.sequence,
                reason: format!("prev_hash {} does not match {}", entry.prev_hash, prev_hash),
            });
        }
        let actual = entry.compute_hash()?;
        if actual != entry.hash {
            return Err(LedgerError::Chain {
                sequence: entry.sequence,
                reason: format!("hash {} does not match content hash {}", entry.hash, actual),
            });
        }
        prev_hash = entry.hash.clone();
    }
    Ok(())
}

/// Move an unterminated trailing fragment into `ledger.ndjson.torn-<offset>`
/// and cut it from the ledger so appends can resume.
///
/// Only bytes after the last complete record are touched. Returns the side
/// file, or `None` when the ledger has no torn tail.
pub fn quarantine_torn_tail(dir: &Path) -> LedgerResult<Option<PathBuf>> {
    let path = dir.join(LEDGER_FILE);
    let Some(offset) = scan(&path)?.torn_at else {
        return Ok(None);
    };

    let raw = std::fs::read(&path).map_err(|e| LedgerError::io(&path, e))?;
    let fragment = raw.get(offset as usize..).unwrap_or_default();
    let side = dir.join(format!("{LEDGER_FILE}.torn-{offset}"));
    std::fs::write(&side, fragment).map_err(|e| LedgerError::io(&side, e))?;

    let file = OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(|e| LedgerError::io(&path, e))?;
    file.set_len(offset).map_err(|e| LedgerError::io(&path, e))?;
    file.sync_all().map_err(|e| LedgerError::io(&path, e))?;

    tracing::warn!(
        event = "ledger.torn_tail_quarantined",
        path = %path.display(),
        side_file = %side.display(),
        bytes = fragment.len(),
    );
    Ok(Some(side))
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

struct Tail {
    file: File,
    next_sequence: u64,
    last_hash: String,
}

/// Exclusive append handle on a ledger file, owned for one run.
///
/// Writes go straight to the `File` (no userspace buffer), so dropping the
/// handle on any exit path leaves every appended record on disk.
pub struct Ledger {
    path: PathBuf,
    run_id: String,
    tail: Mutex<Tail>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("path", &self.path)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open (or create) `<dir>/ledger.ndjson` for appending on behalf of
    /// `run_id`. Existing entries are kept; numbering continues after them.
    pub fn open(dir: &Path, run_id: impl Into<String>) -> LedgerResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| LedgerError::io(dir, e))?;
        let path = dir.join(LEDGER_FILE);

        let scan = scan(&path)?;
        if let Some(offset) = scan.torn_at {
            return Err(LedgerError::TornRecord { path, offset });
        }
        let (next_sequence, last_hash) = match scan.entries.last() {
            Some(last) => (last.sequence + 1, last.hash.clone()),
            None => (1, ZERO_DIGEST.to_string()),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LedgerError::io(&path, e))?;

        Ok(Self {
            path,
            run_id: run_id.into(),
            tail: Mutex::new(Tail {
                file,
                next_sequence,
                last_hash,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append one record, assigning its sequence number and chain hashes.
    pub fn append(&self, new: NewEntry) -> LedgerResult<LedgerEntry> {
        let mut tail = self.tail.lock().map_err(|_| LedgerError::Poisoned)?;

        let mut entry = LedgerEntry {
            sequence: tail.next_sequence,
            timestamp: Utc::now(),
            event_type: new.event_type,
            run_id: self.run_id.clone(),
            aeq: new.identity.aeq,
            cid: new.identity.cid,
            payload: new.payload,
            prev_hash: tail.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = entry.compute_hash()?;

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let file = &mut tail.file;
        file.write_all(line.as_bytes())
            .map_err(|e| LedgerError::io(&self.path, e))?;
        file.flush().map_err(|e| LedgerError::io(&self.path, e))?;

        tail.next_sequence += 1;
        tail.last_hash = entry.hash.clone();
        drop(tail);

        crate::obs::emit_entry_appended(&self.run_id, entry.event_type.as_str(), entry.sequence);
        Ok(entry)
    }

    /// Convenience wrapper over [`append`](Self::append).
    pub fn record(
        &self,
        event_type: EventType,
        identity: &Identity,
        payload: Value,
    ) -> LedgerResult<LedgerEntry> {
        self.append(NewEntry::new(event_type, identity, payload))
    }

    /// All entries in the file, including those from earlier runs.
    pub fn read_all(&self) -> LedgerResult<Vec<LedgerEntry>> {
        let _guard = self.tail.lock().map_err(|_| LedgerError::Poisoned)?;
        read_ledger(&self.path)
    }

    /// Sync to stable storage and release the handle.
    pub fn close(self) -> LedgerResult<()> {
        let tail = self.tail.into_inner().map_err(|_| LedgerError::Poisoned)?;
        tail.file
            .sync_all()
            .map_err(|e| LedgerError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> Identity {
        Identity {
            aeq: "a".repeat(64),
            cid: "c".repeat(64),
        }
    }

    #[test]
    fn sequence_starts_at_one_and_is_gapless() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), "run-1").unwrap();
        for _ in 0..3 {
            ledger
                .record(EventType::GateEvaluated, &identity(), json!({}))
                .unwrap();
        }
        let entries = ledger.read_all().unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        verify_chain(&entries).unwrap();
    }

    #[test]
    fn first_entry_links_to_zero_digest() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), "run-1").unwrap();
        let entry = ledger
            .record(EventType::RunStart, &identity(), json!({ "seed": 1 }))
            .unwrap();
        assert_eq!(entry.prev_hash, ZERO_DIGEST);
        assert_eq!(entry.hash, entry.compute_hash().unwrap());
    }

    #[test]
    fn reopening_continues_sequence_and_chain() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let ledger = Ledger::open(dir.path(), "run-1").unwrap();
            let e = ledger.record(EventType::RunStart, &identity(), json!({})).unwrap();
            ledger.close().unwrap();
            e
        };
        let ledger = Ledger::open(dir.path(), "run-2").unwrap();
        let second = ledger.record(EventType::RunStart, &identity(), json!({})).unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(second.run_id, "run-2");
        verify_chain(&ledger.read_all().unwrap()).unwrap();
    }

    #[test]
    fn record_shape_has_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), "run-1").unwrap();
        ledger
            .record(EventType::RunCompleteBlinded, &identity(), json!({ "blind": true }))
            .unwrap();
        let raw = std::fs::read_to_string(dir.path().join(LEDGER_FILE)).unwrap();
        let line: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        for key in ["sequence", "timestamp", "event_type", "AEQ", "CID", "payload"] {
            assert!(line.get(key).is_some(), "missing {key}");
        }
        assert_eq!(line["event_type"], "run_complete_blinded");
    }

    #[test]
    fn torn_tail_is_skipped_on_read_and_refused_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = Ledger::open(dir.path(), "run-1").unwrap();
            ledger.record(EventType::RunStart, &identity(), json!({})).unwrap();
        }
        let path = dir.path().join(LEDGER_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"sequence":2,"timest"#).unwrap();
        drop(file);

        let entries = read_ledger(&path).unwrap();
        assert_eq!(entries.len(), 1);

        match Ledger::open(dir.path(), "run-2") {
            Err(LedgerError::TornRecord { offset, .. }) => assert!(offset > 0),
            other => panic!("expected TornRecord, got {other:?}"),
        }
    }

    #[test]
    fn quarantine_moves_fragment_aside_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = Ledger::open(dir.path(), "run-1").unwrap();
            ledger.record(EventType::RunStart, &identity(), json!({})).unwrap();
        }
        let path = dir.path().join(LEDGER_FILE);
        let intact = std::fs::read(&path).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"sequence":2,"timest"#).unwrap();
        drop(file);

        let err = Ledger::open(dir.path(), "run-2").unwrap_err();
        assert!(err.to_string().contains("--repair-ledger"));

        let side = quarantine_torn_tail(dir.path()).unwrap().unwrap();
        assert_eq!(std::fs::read(&side).unwrap(), br#"{"sequence":2,"timest"#);
        assert_eq!(std::fs::read(&path).unwrap(), intact);
        assert!(quarantine_torn_tail(dir.path()).unwrap().is_none());

        let ledger = Ledger::open(dir.path(), "run-2").unwrap();
        let next = ledger.record(EventType::RunStart, &identity(), json!({})).unwrap();
        assert_eq!(next.sequence, 2);
        verify_chain(&ledger.read_all().unwrap()).unwrap();
    }

    #[test]
    fn tampered_payload_breaks_chain() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), "run-1").unwrap();
        ledger
            .record(EventType::GateEvaluated, &identity(), json!({ "passed": false }))
            .unwrap();
        ledger.record(EventType::RunEnd, &identity(), json!({})).unwrap();

        let mut entries = ledger.read_all().unwrap();
        entries[0].payload = json!({ "passed": true });
        match verify_chain(&entries) {
            Err(LedgerError::Chain { sequence, .. }) => assert_eq!(sequence, 1),
            other => panic!("expected Chain error, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_ledger(&dir.path().join(LEDGER_FILE)).unwrap().is_empty());
    }

    #[test]
    fn malformed_complete_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE);
        std::fs::write(&path, "not json\n").unwrap();
        assert!(matches!(
            read_ledger(&path),
            Err(LedgerError::Malformed { line: 1, .. })
        ));
    }
}
