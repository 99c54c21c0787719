//! Hashing System - SHA-256 for Artifacts and Fingerprints
//!
//! Every cache decision in the engine reduces to a comparison of these hashes,
//! so all of them are computed over canonical input.

use serde::Serialize;
use serde_json::{to_string, Value};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Stream a file through SHA-256. Layout artifacts can be large, so the
/// content is never loaded whole.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    to_string(&sort_value(&v))
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Hash any serializable value through its canonical JSON form
pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(value)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Inputs of a step fingerprint, before canonicalization.
#[derive(Debug, Serialize)]
pub struct FingerprintInput<'a> {
    pub step_id: &'a str,
    pub definition: &'a Value,
    pub config: &'a Value,
    /// `(view, content hash)` pairs, sorted by view.
    pub inputs: &'a [(String, String)],
}

/// Compute a step fingerprint
/// fingerprint = sha256(canonical {step_id, definition, config subset, input hashes})
pub fn compute_fingerprint(input: &FingerprintInput<'_>) -> Result<String, serde_json::Error> {
    hash_canonical(input)
}
