//! Context envelopes and canonical hashing.
//!
//! An envelope is a small structured snapshot of job state that travels with
//! every Ask. Producer and consumer both hash the canonical form, so either
//! side can prove it operated on identical context.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Canonical shape of the envelope. Unknown extra fields are preserved in
/// hashing (the hash covers the raw value, not this struct).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ContextEnvelope {
    #[serde(default)]
    pub job_snapshot: JobSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_caps: Option<Value>,
    pub role: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct JobSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,
}

/// Extract `job_snapshot.policy_version` from a raw envelope value.
pub fn policy_version(envelope: &Value) -> Option<&str> {
    envelope
        .get("job_snapshot")
        .and_then(|s| s.get("policy_version"))
        .and_then(Value::as_str)
}

/// Rebuild a JSON value with every object's keys sorted. Arrays keep order.
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Serialize an envelope to its canonical form: recursively sorted object
/// keys, arrays in order, minimal JSON with no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&sort_keys(value)).expect("canonical value serializes")
}

/// Lowercase-hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    use std::fmt::Write;

    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.as_slice() {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Canonical SHA-256 of a context envelope, lowercase hex.
pub fn stable_hash_context(envelope: &Value) -> String {
    sha256_hex(canonical_json(envelope).as_bytes())
}

/// Primary key of the decision cache.
///
/// The four components are joined with a 0x1f separator before hashing so no
/// pair of distinct tuples can collide by concatenation.
pub fn decision_key(
    ask_type: &str,
    prompt: &str,
    context_hash: &str,
    policy_version: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ask_type.as_bytes());
    hasher.update([0x1f]);
    hasher.update(prompt.as_bytes());
    hasher.update([0x1f]);
    hasher.update(context_hash.as_bytes());
    hasher.update([0x1f]);
    hasher.update(policy_version.as_bytes());
    hex_digest(hasher)
}
