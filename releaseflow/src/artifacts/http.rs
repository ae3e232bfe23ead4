//! HTTP implementation of the artifact store client.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::ArtifactStore;
use crate::config::ArtifactStoreConfig;
use crate::core::ArtifactRef;
use crate::errors::ArtifactStoreError;

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    artifacts: Vec<ListedArtifact>,
}

#[derive(Debug, Deserialize)]
struct ListedArtifact {
    name: String,
    #[serde(alias = "archive_download_url")]
    download_url: String,
    #[serde(default, alias = "size_in_bytes")]
    size_bytes: Option<u64>,
}

/// Artifact store reached over HTTP with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpArtifactStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpArtifactStore {
    /// Creates a client from configuration.
    pub fn new(config: &ArtifactStoreConfig, timeout: Duration) -> Result<Self, ArtifactStoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ArtifactStoreError::Malformed(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, ArtifactStoreError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| classify_transport(&e, what))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), what, &body))
    }
}

fn classify_transport(err: &reqwest::Error, what: &str) -> ArtifactStoreError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ArtifactStoreError::Unreachable(format!("{what}: {err}"))
    } else {
        ArtifactStoreError::Malformed(format!("{what}: {err}"))
    }
}

fn classify_status(status: u16, what: &str, body: &str) -> ArtifactStoreError {
    let message = format!("{what}: HTTP {status} {body}");
    match status {
        401 | 403 => ArtifactStoreError::Unauthorized(message),
        404 | 410 => ArtifactStoreError::NotFound(message),
        408 | 429 | 500..=599 => ArtifactStoreError::Unreachable(message),
        _ => ArtifactStoreError::Malformed(message),
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn list(&self, run_id: u64) -> Result<Vec<ArtifactRef>, ArtifactStoreError> {
        let url = format!("{}/runs/{run_id}/artifacts", self.base_url);
        debug!(run_id, url = %url, "Listing artifacts");

        let response = self.send(self.client.get(&url), "list artifacts").await?;
        let listed: ListResponse = response
            .json()
            .await
            .map_err(|e| ArtifactStoreError::Malformed(format!("list artifacts: {e}")))?;

        Ok(listed
            .artifacts
            .into_iter()
            .map(|a| ArtifactRef {
                run_id,
                name: a.name,
                download_url: a.download_url,
                size_bytes: a.size_bytes,
            })
            .collect())
    }

    async fn download(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ArtifactStoreError> {
        debug!(run_id = artifact.run_id, name = %artifact.name, "Downloading artifact");
        let response = self
            .send(self.client.get(&artifact.download_url), "download artifact")
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_transport(&e, "download artifact"))?;
        Ok(bytes.to_vec())
    }

    async fn upload(
        &self,
        run_id: u64,
        name: &str,
        content: Vec<u8>,
    ) -> Result<ArtifactRef, ArtifactStoreError> {
        let url = format!("{}/runs/{run_id}/artifacts/{name}", self.base_url);
        let size = content.len() as u64;
        self.send(self.client.put(&url).body(content), "upload artifact")
            .await?;

        Ok(ArtifactRef {
            run_id,
            name: name.to_string(),
            download_url: url,
            size_bytes: Some(size),
        })
    }
}
