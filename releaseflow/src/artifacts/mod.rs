//! Artifact store client.
//!
//! The artifact store holds opaque named blobs uploaded by upstream workflow
//! runs. The client is a leaf: it never retries, it only reports classified
//! errors.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpArtifactStore;

use async_trait::async_trait;

use crate::core::ArtifactRef;
use crate::errors::ArtifactStoreError;

/// Access to the blobs attached to workflow runs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Lists the artifacts attached to `run_id`.
    async fn list(&self, run_id: u64) -> Result<Vec<ArtifactRef>, ArtifactStoreError>;

    /// Downloads the content of `artifact`.
    async fn download(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ArtifactStoreError>;

    /// Attaches a blob named `name` to `run_id`.
    async fn upload(
        &self,
        run_id: u64,
        name: &str,
        content: Vec<u8>,
    ) -> Result<ArtifactRef, ArtifactStoreError>;
}
