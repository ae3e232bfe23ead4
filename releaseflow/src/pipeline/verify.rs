//! Artifact integrity and version sanity checks.

use tracing::debug;

use crate::config::VerifyConfig;
use crate::core::{check_version_sanity, LoadedArtifact, ReleaseJob, ReleaseVersion};
use crate::errors::VerificationError;

/// Artifact file extensions accepted for upload.
pub const ARTIFACT_EXTENSIONS: &[&str] = &[".tar.gz", ".whl", ".crate", ".zip"];

/// Verifies a built artifact against its job before anything is published.
#[derive(Debug, Clone, Default)]
pub struct ArtifactVerifier {
    extra_placeholders: Vec<String>,
}

impl ArtifactVerifier {
    /// Creates a verifier from configuration.
    #[must_use]
    pub fn new(config: &VerifyConfig) -> Self {
        Self {
            extra_placeholders: config.extra_placeholders.clone(),
        }
    }

    /// Runs every check and reports all failures together.
    pub fn verify(
        &self,
        job: &ReleaseJob,
        artifact: &LoadedArtifact,
    ) -> Result<ReleaseVersion, VerificationError> {
        let mut failed: Vec<String> = Vec::new();
        let mut problems: Vec<String> = Vec::new();

        let version = match check_version_sanity(&job.version, &self.extra_placeholders) {
            Ok(v) => Some(v),
            Err(e) => {
                failed.extend(e.failed_checks);
                problems.push(e.message);
                None
            }
        };

        if artifact.content.is_empty() {
            failed.push("non_empty".to_string());
            problems.push("artifact is empty".to_string());
        }

        if artifact.meta.size_bytes != artifact.content.len() as u64 || !artifact.digest_matches() {
            failed.push("checksum".to_string());
            problems.push(format!(
                "content does not match recorded sha256 {}",
                artifact.meta.sha256
            ));
        }

        match embedded_version(&artifact.meta.package, &artifact.meta.file_name) {
            None => {
                failed.push("file_name".to_string());
                problems.push(format!(
                    "'{}' does not follow <name>-<version>[-...]<{}>",
                    artifact.meta.file_name,
                    ARTIFACT_EXTENSIONS.join("|")
                ));
            }
            Some(embedded) if !versions_equal(&embedded, &job.version) => {
                failed.push("version_match".to_string());
                problems.push(format!(
                    "file name carries version '{embedded}' but the job is '{}'",
                    job.version
                ));
            }
            Some(_) => {}
        }

        match version {
            Some(v) if failed.is_empty() => {
                debug!(version = %job.version, file = %artifact.meta.file_name, "Artifact verified");
                Ok(v)
            }
            _ => Err(VerificationError::new(problems.join("; ")).with_checks(failed)),
        }
    }
}

fn versions_equal(embedded: &str, job_version: &str) -> bool {
    let job = crate::core::strip_tag_prefix(job_version.trim());
    embedded == job || embedded.replace('_', "-") == job
}

/// Extracts the version from `<name>-<version>[-...].<ext>`.
///
/// Wheels may carry build, interpreter, ABI and platform tags after the
/// version; other formats may not.
fn embedded_version(package: &str, file_name: &str) -> Option<String> {
    let (stem, ext) = ARTIFACT_EXTENSIONS
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext).map(|stem| (stem, *ext)))?;

    let rest = [package.to_string(), package.replace('-', "_")]
        .iter()
        .find_map(|name| stem.strip_prefix(name.as_str()).and_then(|r| r.strip_prefix('-')))?;
    if rest.is_empty() {
        return None;
    }

    if ext == ".whl" {
        let parts: Vec<&str> = rest.split('-').collect();
        // version, [build], python, abi, platform
        return match parts.len() {
            1 | 4 | 5 => Some(parts[0].to_string()),
            _ => None,
        };
    }
    Some(rest.to_string())
}
