//! Build steps that produce a release artifact.

use async_trait::async_trait;
use std::process::Stdio;
use tracing::{debug, info};

use crate::config::BuildConfig;
use crate::core::{LoadedArtifact, ReleaseJob};
use crate::errors::BuildError;

/// Environment variable carrying the version into the build.
pub const ENV_RELEASE_VERSION: &str = "RELEASE_VERSION";
/// Environment variable carrying the commit into the build.
pub const ENV_RELEASE_COMMIT: &str = "RELEASE_COMMIT";

const STDERR_TAIL_BYTES: usize = 2048;

/// Produces the release artifact for a job.
#[async_trait]
pub trait BuildStep: Send + Sync {
    /// Builds `job` and returns the artifact.
    async fn build(&self, job: &ReleaseJob) -> Result<LoadedArtifact, BuildError>;
}

/// Runs a configured command and reads the artifact it writes.
#[derive(Debug, Clone)]
pub struct CommandBuildStep {
    config: BuildConfig,
}

impl CommandBuildStep {
    /// Creates a build step from configuration.
    #[must_use]
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[async_trait]
impl BuildStep for CommandBuildStep {
    async fn build(&self, job: &ReleaseJob) -> Result<LoadedArtifact, BuildError> {
        info!(
            version = %job.version,
            commit = %job.commit,
            command = %self.config.command,
            "Running build"
        );

        let output = tokio::process::Command::new(&self.config.command)
            .args(&self.config.args)
            .current_dir(&self.config.working_dir)
            .env(ENV_RELEASE_VERSION, &job.version)
            .env(ENV_RELEASE_COMMIT, &job.commit)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                BuildError::new(&job.version, format!("failed to spawn '{}': {e}", self.config.command))
            })?;

        if !output.status.success() {
            let mut err = BuildError::new(
                &job.version,
                format!("'{}' exited with {}: {}", self.config.command, output.status, tail(&output.stderr)),
            );
            if let Some(code) = output.status.code() {
                err = err.with_exit_code(code);
            }
            return Err(err);
        }

        let path = self.config.artifact_path_for(&job.version);
        let content = tokio::fs::read(&path).await.map_err(|e| {
            BuildError::new(&job.version, format!("artifact {} not readable: {e}", path.display()))
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BuildError::new(&job.version, "artifact path has no file name"))?;

        debug!(version = %job.version, path = %path.display(), bytes = content.len(), "Build produced artifact");
        Ok(LoadedArtifact::from_content(&self.config.package, file_name, content).with_path(path))
    }
}
