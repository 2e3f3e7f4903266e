//! Audit events, artifact metadata, and decision-cache rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::JobId;

/// Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub job_id: JobId,
    pub ts: i64,
    /// Dotted event name, e.g. `job.submitted`, `ask.created`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
}

/// The artifact kinds a job may produce. `(job_id, kind)` is unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactKind {
    #[serde(rename = "patch.diff")]
    PatchDiff,
    #[serde(rename = "out.md")]
    OutMd,
    #[serde(rename = "logs.txt")]
    LogsTxt,
    #[serde(rename = "pr.json")]
    PrJson,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatchDiff => "patch.diff",
            Self::OutMd => "out.md",
            Self::LogsTxt => "logs.txt",
            Self::PrJson => "pr.json",
        }
    }

    /// MIME type used when serving artifact contents.
    pub fn mime(&self) -> &'static str {
        match self {
            Self::PatchDiff => "text/x-diff",
            Self::OutMd => "text/markdown",
            Self::LogsTxt => "text/plain",
            Self::PrJson => "application/json",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patch.diff" => Ok(Self::PatchDiff),
            "out.md" => Ok(Self::OutMd),
            "logs.txt" => Ok(Self::LogsTxt),
            "pr.json" => Ok(Self::PrJson),
            other => Err(format!("unknown artifact kind: {other}")),
        }
    }
}

/// Metadata for a written artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub job_id: JobId,
    pub kind: ArtifactKind,
    pub uri: String,
    /// Lowercase-hex SHA-256 of the artifact bytes.
    pub digest: String,
    pub size: u64,
    pub created_at: i64,
}

/// A cached runner decision, keyed by
/// `SHA-256(ask_type ‖ prompt ‖ context_hash ‖ policy_version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionCacheEntry {
    pub decision_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_json: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_trace: Option<Value>,
    pub created_at: i64,
    pub ttl_seconds: i64,
}

impl DecisionCacheEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.created_at + self.ttl_seconds * 1000 < now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_kind_roundtrip() {
        for kind in [
            ArtifactKind::PatchDiff,
            ArtifactKind::OutMd,
            ArtifactKind::LogsTxt,
            ArtifactKind::PrJson,
        ] {
            let parsed: ArtifactKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn artifact_kind_serde_uses_file_names() {
        let json = serde_json::to_string(&ArtifactKind::PatchDiff).unwrap();
        assert_eq!(json, "\"patch.diff\"");
    }

    #[test]
    fn artifact_mime_by_kind() {
        assert_eq!(ArtifactKind::PatchDiff.mime(), "text/x-diff");
        assert_eq!(ArtifactKind::OutMd.mime(), "text/markdown");
        assert_eq!(ArtifactKind::LogsTxt.mime(), "text/plain");
        assert_eq!(ArtifactKind::PrJson.mime(), "application/json");
    }

    #[test]
    fn decision_cache_expiry() {
        let entry = DecisionCacheEntry {
            decision_key: "k".into(),
            answer_json: None,
            answer_text: Some("cached".into()),
            policy_trace: None,
            created_at: 1_000,
            ttl_seconds: 10,
        };
        assert!(!entry.is_expired(1_000));
        assert!(!entry.is_expired(11_000));
        assert!(entry.is_expired(11_001));
    }
}
