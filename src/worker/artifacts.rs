//! Filesystem artifact store.
//!
//! Artifacts live under `<root>/<job_id>/<kind>`; every write returns the
//! uri, SHA-256 digest, and byte size for the metadata row.

use std::path::{Path, PathBuf};

use crate::domain::{now_ms, sha256_hex, ArtifactKind, ArtifactMeta, JobId};
use crate::error::ExecutorError;

/// Writes and reads artifact files under a fixed root.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, job_id: &JobId, kind: ArtifactKind) -> PathBuf {
        self.root.join(job_id.as_str()).join(kind.as_str())
    }

    /// Write an artifact, returning its metadata.
    pub async fn write(
        &self,
        job_id: &JobId,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<ArtifactMeta, ExecutorError> {
        let path = self.path_for(job_id, kind);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;

        Ok(ArtifactMeta {
            job_id: job_id.clone(),
            kind,
            uri: path.display().to_string(),
            digest: sha256_hex(bytes),
            size: bytes.len() as u64,
            created_at: now_ms(),
        })
    }

    /// Read an artifact's bytes back.
    pub async fn read(
        &self,
        job_id: &JobId,
        kind: ArtifactKind,
    ) -> Result<Vec<u8>, std::io::Error> {
        tokio::fs::read(self.path_for(job_id, kind)).await
    }
}
