//! HTTP upload to package indices.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use md5::{Digest, Md5};
use std::time::Duration;
use tracing::{debug, info};

use super::{PublishTarget, Publisher};
use crate::config::{IndexEndpoint, PublishConfig};
use crate::core::LoadedArtifact;
use crate::errors::PublishError;

/// Base64-encoded MD5 of `data`, as package indices expect it.
#[must_use]
pub fn md5_base64(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    STANDARD.encode(hasher.finalize())
}

/// Publisher that uploads artifact bytes over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: reqwest::Client,
    staging: IndexEndpoint,
    production: IndexEndpoint,
}

impl HttpPublisher {
    /// Creates a publisher from configuration.
    pub fn new(config: &PublishConfig, timeout: Duration) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("releaseflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PublishError::Rejected {
                target: "client".to_string(),
                status: 0,
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            staging: config.staging.clone(),
            production: config.production.clone(),
        })
    }

    fn endpoint(&self, target: PublishTarget) -> &IndexEndpoint {
        match target {
            PublishTarget::Staging => &self.staging,
            PublishTarget::Production => &self.production,
        }
    }
}

fn classify_transport(target: PublishTarget, err: &reqwest::Error) -> PublishError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        PublishError::TransientNetwork {
            target: target.to_string(),
            message: err.to_string(),
        }
    } else {
        PublishError::Rejected {
            target: target.to_string(),
            status: 0,
            message: err.to_string(),
        }
    }
}

/// Maps an index response status to the publish outcome.
///
/// 409 means the index already holds this exact file, which counts as a
/// successful upload.
fn classify_status(target: PublishTarget, status: u16, body: &str) -> Result<(), PublishError> {
    let target = target.to_string();
    match status {
        200..=299 | 409 => Ok(()),
        401 | 403 => Err(PublishError::Auth {
            target,
            message: format!("HTTP {status} {body}"),
        }),
        408 | 429 | 500..=599 => Err(PublishError::TransientNetwork {
            target,
            message: format!("HTTP {status} {body}"),
        }),
        _ => Err(PublishError::Rejected {
            target,
            status,
            message: body.to_string(),
        }),
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(
        &self,
        target: PublishTarget,
        version: &str,
        artifact: &LoadedArtifact,
    ) -> Result<(), PublishError> {
        let endpoint = self.endpoint(target);
        let token = endpoint.token.as_deref().ok_or_else(|| PublishError::Auth {
            target: target.to_string(),
            message: "no token configured".to_string(),
        })?;

        debug!(
            target = %target,
            version = %version,
            file = %artifact.meta.file_name,
            bytes = artifact.meta.size_bytes,
            "Uploading artifact"
        );

        let response = self
            .client
            .post(&endpoint.url)
            .basic_auth("__token__", Some(token))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header("X-Package-Name", &artifact.meta.package)
            .header("X-Package-Version", version)
            .header("X-File-Name", &artifact.meta.file_name)
            .header("X-Content-MD5", md5_base64(&artifact.content))
            .header("X-Content-SHA256", &artifact.meta.sha256)
            .body(artifact.content.clone())
            .send()
            .await
            .map_err(|e| classify_transport(target, &e))?;

        let status = response.status().as_u16();
        let body = if response.status().is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };
        classify_status(target, status, &body)?;

        info!(target = %target, version = %version, status, "Artifact uploaded");
        Ok(())
    }
}
