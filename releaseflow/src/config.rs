//! Configuration for the orchestrator and its collaborators.
//!
//! Configuration is read from a TOML file. Every field has a default, so an
//! empty file is valid. Secrets are normally supplied through
//! `RELEASEFLOW_*` environment variables rather than the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;
use crate::pipeline::RetryConfig;

/// Environment variable holding the staging index token.
pub const ENV_STAGING_TOKEN: &str = "RELEASEFLOW_STAGING_TOKEN";
/// Environment variable holding the production index token.
pub const ENV_PRODUCTION_TOKEN: &str = "RELEASEFLOW_PRODUCTION_TOKEN";
/// Environment variable holding the artifact store token.
pub const ENV_ARTIFACT_TOKEN: &str = "RELEASEFLOW_ARTIFACT_TOKEN";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retry policy for staging publishes and artifact listing.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Test-result correlation settings.
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    /// Build step settings.
    #[serde(default)]
    pub build: BuildConfig,
    /// Verification settings.
    #[serde(default)]
    pub verify: VerifyConfig,
    /// Package index endpoints.
    #[serde(default)]
    pub publish: PublishConfig,
    /// Artifact store endpoint.
    #[serde(default)]
    pub artifacts: ArtifactStoreConfig,
    /// Job store settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Timeout applied to every outbound network call.
    #[serde(default = "default_network_timeout")]
    pub network_timeout_seconds: f64,
}

fn default_network_timeout() -> f64 {
    60.0
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            correlator: CorrelatorConfig::default(),
            build: BuildConfig::default(),
            verify: VerifyConfig::default(),
            publish: PublishConfig::default(),
            artifacts: ArtifactStoreConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            network_timeout_seconds: default_network_timeout(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Fills secrets from `RELEASEFLOW_*` environment variables.
    ///
    /// Environment values override values from the file.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Fills secrets from an arbitrary lookup.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(token) = lookup(ENV_STAGING_TOKEN) {
            self.publish.staging.token = Some(token);
        }
        if let Some(token) = lookup(ENV_PRODUCTION_TOKEN) {
            self.publish.production.token = Some(token);
        }
        if let Some(token) = lookup(ENV_ARTIFACT_TOKEN) {
            self.artifacts.token = Some(token);
        }
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the scratch directory.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.correlator.scratch_dir = dir.into();
        self
    }

    /// Sets the network timeout.
    #[must_use]
    pub fn with_network_timeout(mut self, seconds: f64) -> Self {
        self.network_timeout_seconds = seconds;
        self
    }

    /// Gets the network timeout as a Duration.
    #[must_use]
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.network_timeout_seconds)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry.base_delay_ms".to_string(),
                message: "must not exceed retry.max_delay_ms".to_string(),
            });
        }
        if !(self.network_timeout_seconds.is_finite() && self.network_timeout_seconds > 0.0) {
            return Err(ConfigError::Invalid {
                field: "network_timeout_seconds".to_string(),
                message: "must be a positive number".to_string(),
            });
        }
        if self.correlator.result_pattern.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "correlator.result_pattern".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Test-result correlation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    /// Glob matched against bundle names.
    #[serde(default = "default_result_pattern")]
    pub result_pattern: String,
    /// Root of the per-run scratch areas.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Keep unpacked bundles after the report is built.
    #[serde(default)]
    pub keep_scratch: bool,
    /// Also upload the normalized report back to the run.
    #[serde(default)]
    pub attach_report: bool,
}

fn default_result_pattern() -> String {
    "*test-results*".to_string()
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("releaseflow-scratch")
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            result_pattern: default_result_pattern(),
            scratch_dir: default_scratch_dir(),
            keep_scratch: false,
            attach_report: false,
        }
    }
}

/// Build step settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Package name used in artifact file names.
    #[serde(default = "default_package")]
    pub package: String,
    /// Program to run.
    #[serde(default = "default_build_command")]
    pub command: String,
    /// Arguments passed to the program.
    #[serde(default = "default_build_args")]
    pub args: Vec<String>,
    /// Directory the build runs in.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Artifact path relative to `working_dir`.
    ///
    /// `{package}` and `{version}` are substituted.
    #[serde(default = "default_artifact_path")]
    pub artifact_path: String,
}

fn default_package() -> String {
    "package".to_string()
}

fn default_build_command() -> String {
    "python".to_string()
}

fn default_build_args() -> Vec<String> {
    vec!["-m".to_string(), "build".to_string(), "--sdist".to_string()]
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_artifact_path() -> String {
    "dist/{package}-{version}.tar.gz".to_string()
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            package: default_package(),
            command: default_build_command(),
            args: default_build_args(),
            working_dir: default_working_dir(),
            artifact_path: default_artifact_path(),
        }
    }
}

impl BuildConfig {
    /// Artifact path for `version` with placeholders substituted.
    #[must_use]
    pub fn artifact_path_for(&self, version: &str) -> PathBuf {
        let relative = self
            .artifact_path
            .replace("{package}", &self.package)
            .replace("{version}", version);
        self.working_dir.join(relative)
    }
}

/// Verification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Versions rejected in addition to the built-in placeholders.
    #[serde(default)]
    pub extra_placeholders: Vec<String>,
}

/// One package index endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexEndpoint {
    /// Upload URL.
    #[serde(default)]
    pub url: String,
    /// API token; usually provided via environment.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

/// Package index endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Pre-release verification index.
    #[serde(default = "default_staging_endpoint")]
    pub staging: IndexEndpoint,
    /// Consumer-visible index.
    #[serde(default = "default_production_endpoint")]
    pub production: IndexEndpoint,
}

fn default_staging_endpoint() -> IndexEndpoint {
    IndexEndpoint {
        url: "https://test.pypi.org/legacy/".to_string(),
        token: None,
    }
}

fn default_production_endpoint() -> IndexEndpoint {
    IndexEndpoint {
        url: "https://upload.pypi.org/legacy/".to_string(),
        token: None,
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            staging: default_staging_endpoint(),
            production: default_production_endpoint(),
        }
    }
}

/// Artifact store endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactStoreConfig {
    /// Base URL; run artifacts live under `{base_url}/runs/{id}/artifacts`.
    #[serde(default = "default_artifact_base_url")]
    pub base_url: String,
    /// Bearer token; usually provided via environment.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    /// User agent string.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_artifact_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_user_agent() -> String {
    concat!("releaseflow/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for ArtifactStoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_artifact_base_url(),
            token: None,
            user_agent: default_user_agent(),
        }
    }
}

/// Job store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot file holding every job.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("releaseflow-jobs.json")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.correlator.result_pattern, "*test-results*");
        assert_eq!(config.network_timeout(), Duration::from_secs(60));
        assert_eq!(config.store.path, PathBuf::from("releaseflow-jobs.json"));
    }

    #[test]
    fn test_parse_sections() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            network_timeout_seconds = 5.0

            [retry]
            max_attempts = 4
            base_delay_ms = 10
            backoff_strategy = "linear"
            jitter_strategy = "none"

            [build]
            package = "widget"
            command = "make"
            args = ["dist"]

            [publish.staging]
            url = "https://staging.example/upload"

            [store]
            path = "/var/lib/releaseflow/jobs.json"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.max_delay_ms, 30000);
        assert_eq!(config.build.package, "widget");
        assert_eq!(config.publish.staging.url, "https://staging.example/upload");
        assert_eq!(config.publish.production.url, "https://upload.pypi.org/legacy/");
        assert_eq!(config.store.path, PathBuf::from("/var/lib/releaseflow/jobs.json"));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.network_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let err = OrchestratorConfig::from_toml_str("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(err.to_string().contains("retry.max_attempts"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_STAGING_TOKEN, "stage-secret"),
            (ENV_PRODUCTION_TOKEN, "prod-secret"),
        ]
        .into_iter()
        .collect();

        let config = OrchestratorConfig::new()
            .with_overrides_from(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.publish.staging.token.as_deref(), Some("stage-secret"));
        assert_eq!(config.publish.production.token.as_deref(), Some("prod-secret"));
        assert!(config.artifacts.token.is_none());
    }

    #[test]
    fn test_artifact_path_substitution() {
        let build = BuildConfig {
            package: "widget".to_string(),
            working_dir: PathBuf::from("/src"),
            ..BuildConfig::default()
        };
        assert_eq!(
            build.artifact_path_for("1.2.3"),
            PathBuf::from("/src/dist/widget-1.2.3.tar.gz")
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = OrchestratorConfig::load("/nonexistent/releaseflow.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
