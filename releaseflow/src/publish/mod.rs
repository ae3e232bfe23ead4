//! Uploading release artifacts to package indices.
//!
//! A [`Publisher`] performs exactly one authenticated upload per call and
//! never retries; the release pipeline owns the retry policy.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpPublisher;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::LoadedArtifact;
use crate::errors::PublishError;

/// Which package index an upload goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishTarget {
    /// The pre-release verification index.
    Staging,
    /// The consumer-visible index.
    Production,
}

impl fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Uploads one artifact to one index.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Uploads `artifact` for `version` to `target`.
    async fn publish(
        &self,
        target: PublishTarget,
        version: &str,
        artifact: &LoadedArtifact,
    ) -> Result<(), PublishError>;
}
