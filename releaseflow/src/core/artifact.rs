//! Artifact descriptors: upstream CI bundles and built release artifacts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// A named blob attached to an upstream workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Run the artifact belongs to.
    pub run_id: u64,
    /// Bundle name as uploaded by the run.
    pub name: String,
    /// Where the blob can be downloaded from.
    pub download_url: String,
    /// Size in bytes, when the store reports it.
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl ArtifactRef {
    /// Creates a new artifact reference.
    #[must_use]
    pub fn new(run_id: u64, name: impl Into<String>, download_url: impl Into<String>) -> Self {
        Self {
            run_id,
            name: name.into(),
            download_url: download_url.into(),
            size_bytes: None,
        }
    }
}

/// A downloaded bundle after it was unpacked into the scratch area.
///
/// Only lives for the duration of one correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactBundle {
    /// Bundle name.
    pub name: String,
    /// Where it was downloaded from.
    pub download_url: String,
    /// Directory the bundle was unpacked into.
    pub extracted_path: PathBuf,
}

/// The release artifact produced by a build, as persisted on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseArtifact {
    /// Package name.
    pub package: String,
    /// Artifact file name, e.g. `widget-1.2.3.tar.gz`.
    pub file_name: String,
    /// Where the built file lives on disk, if it was written to disk.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Hex SHA-256 of the content.
    pub sha256: String,
    /// Content length.
    pub size_bytes: u64,
}

/// A release artifact together with its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedArtifact {
    /// Descriptor recorded on the job.
    pub meta: ReleaseArtifact,
    /// Artifact bytes.
    pub content: Vec<u8>,
}

impl LoadedArtifact {
    /// Builds a loaded artifact from raw content, computing its digest.
    #[must_use]
    pub fn from_content(
        package: impl Into<String>,
        file_name: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        let meta = ReleaseArtifact {
            package: package.into(),
            file_name: file_name.into(),
            path: None,
            sha256: sha256_hex(&content),
            size_bytes: content.len() as u64,
        };
        Self { meta, content }
    }

    /// Records where the content lives on disk.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.meta.path = Some(path.into());
        self
    }

    /// Returns true if the content still matches the recorded digest.
    #[must_use]
    pub fn digest_matches(&self) -> bool {
        sha256_hex(&self.content) == self.meta.sha256
    }
}

/// Hex-encoded SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
