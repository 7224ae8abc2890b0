//! Canonical JSON encoding and SHA-256 helpers.
//!
//! Canonical form: object keys sorted by byte order at every depth, no
//! insignificant whitespace, integer-valued floats written as integers,
//! non-finite numbers rejected. Array order is preserved.

use std::io::Read;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

/// Hex digest used as the `prev_hash` of the first ledger entry.
pub const ZERO_DIGEST: &str = "0000000000000000000000000000000000000000000000000000000000000000";

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => {
            let f = n
                .as_f64()
                .ok_or_else(|| PipelineError::config(format!("unrepresentable number: {n}")))?;
            if !f.is_finite() {
                return Err(PipelineError::config(
                    "NaN/Infinity not permitted in canonical JSON",
                ));
            }
            // i64::MAX as f64 rounds up to 2^63, which does not fit
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                out.push_str(&(f as i64).to_string());
            } else {
                out.push_str(&n.to_string());
            }
        }
        other => out.push_str(&serde_json::to_string(other)?),
    }
    Ok(())
}

/// Canonical JSON text of an already-built value.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// Canonical JSON text of any serializable value.
pub fn canonical_json_of<T: Serialize>(value: &T) -> Result<String> {
    canonical_json(&serde_json::to_value(value)?)
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of the canonical JSON encoding of `value`.
pub fn canonical_digest<T: Serialize>(value: &T) -> Result<String> {
    Ok(sha256_hex(canonical_json_of(value)?.as_bytes()))
}

/// Stream a reader through SHA-256 without buffering it whole.
pub fn sha256_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
