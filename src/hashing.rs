//! Hash computation for logic, inputs, and memo keys using BLAKE3

use crate::scope::ScopePath;
use crate::types::{Hash, InputFingerprint, LogicFingerprint, MemoKey};
use blake3::Hasher;
use serde::Serialize;
use serde_json::Value;

/// Compute the fingerprint of a function's logic
///
/// LogicFingerprint = hash("logic" || code_len || code || version_tag || version)
///
/// Only the code text and the explicit version participate, so re-registering
/// an identical body (e.g. after a no-op reload) yields the same fingerprint.
pub fn compute_logic_fingerprint(code: &str, version: Option<u32>) -> LogicFingerprint {
    let mut hasher = Hasher::new();

    hasher.update(b"logic");
    hasher.update(&(code.len() as u64).to_be_bytes());
    hasher.update(code.as_bytes());

    match version {
        Some(v) => {
            hasher.update(b"\x01");
            hasher.update(&v.to_be_bytes());
        }
        None => {
            hasher.update(b"\x00");
        }
    }

    LogicFingerprint(*hasher.finalize().as_bytes())
}

/// Structural hash of a serializable value
///
/// The value is converted to its JSON data model and hashed with type tags and
/// length prefixes. Object keys are visited in sorted order, so hash maps hash
/// the same regardless of iteration order.
pub fn structural_hash<T: Serialize + ?Sized>(value: &T) -> Result<InputFingerprint, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    Ok(InputFingerprint(hash_json(&value)))
}

/// Hash an already-materialized JSON value.
pub fn hash_json(value: &Value) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(b"input");
    write_value(&mut hasher, value);
    *hasher.finalize().as_bytes()
}

fn write_str(hasher: &mut Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn write_value(hasher: &mut Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(b"n");
        }
        Value::Bool(b) => {
            hasher.update(if *b { b"T" } else { b"F" });
        }
        Value::Number(n) => {
            hasher.update(b"#");
            write_str(hasher, &n.to_string());
        }
        Value::String(s) => {
            hasher.update(b"s");
            write_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update(b"[");
            hasher.update(&(items.len() as u64).to_be_bytes());
            for item in items {
                write_value(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update(b"{");
            hasher.update(&(map.len() as u64).to_be_bytes());
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (key, item) in entries {
                write_str(hasher, key);
                write_value(hasher, item);
            }
        }
    }
}

/// Hash a caller-supplied custom key so it cannot collide with structural hashes.
pub fn custom_key_hash(key: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(b"custom");
    hasher.update(&(key.len() as u64).to_be_bytes());
    hasher.update(key);
    *hasher.finalize().as_bytes()
}

/// Combine per-component keys (e.g. tuple members) into one key.
pub fn combine_keys(parts: &[Hash]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(b"parts");
    hasher.update(&(parts.len() as u64).to_be_bytes());
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Compute the memo key of one invocation
///
/// MemoKey = hash("memo" || scope_path || function || input_key)
///
/// The function name participates instead of its fingerprint: a logic change
/// lands on the same key and replaces the stale entry.
pub fn compute_memo_key(path: &ScopePath, function: &str, input_key: &Hash) -> MemoKey {
    let mut hasher = Hasher::new();

    hasher.update(b"memo");
    let encoded = path.encode();
    hasher.update(&(encoded.len() as u64).to_be_bytes());
    hasher.update(&encoded);
    write_str(&mut hasher, function);
    hasher.update(input_key);

    MemoKey(*hasher.finalize().as_bytes())
}
