use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use releaseflow::artifacts::HttpArtifactStore;
use releaseflow::config::{LogFormat, OrchestratorConfig};
use releaseflow::core::TriggerEvent;
use releaseflow::observability::init_tracing;
use releaseflow::orchestrator::Orchestrator;
use releaseflow::publish::HttpPublisher;
use releaseflow::store::FileJobStore;

/// Releaseflow: CI artifact correlation and staged release orchestration
#[derive(Parser, Debug)]
#[command(name = "releaseflow")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "RELEASEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format; overrides the configuration file
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Handle trigger events read from JSON files
    Handle {
        /// Event files; each holds one event or an array of events
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
    },
    /// Print the completion status of a release
    Status {
        /// Release version or tag
        version: String,
    },
    /// Restart a halted release from the stage it failed in
    Redrive {
        /// Release version or tag
        version: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn read_events(path: &Path) -> Result<Vec<TriggerEvent>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("Event file {} is not valid JSON", path.display()))?;
    let events = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|event| vec![event])
    };
    events.with_context(|| format!("Event file {} does not hold trigger events", path.display()))
}

async fn build_orchestrator(config: OrchestratorConfig) -> Result<Orchestrator> {
    let timeout = config.network_timeout();
    let artifacts = HttpArtifactStore::new(&config.artifacts, timeout)
        .context("Failed to create artifact store client")?;
    let publisher =
        HttpPublisher::new(&config.publish, timeout).context("Failed to create index publisher")?;
    let path = &config.store.path;
    let store = FileJobStore::open(path)
        .await
        .with_context(|| format!("Failed to open job store {}", path.display()))?;

    Orchestrator::builder(config)
        .with_store(Arc::new(store))
        .with_artifact_store(Arc::new(artifacts))
        .with_publisher(Arc::new(publisher))
        .build()
        .context("Invalid orchestrator configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    init_tracing(&config.logging);

    let orchestrator = build_orchestrator(config).await?;

    match cli.command {
        Commands::Handle { files } => {
            let mut events = Vec::new();
            for file in &files {
                events.extend(read_events(file)?);
            }

            let mut failures = 0;
            for (event, result) in events.iter().zip(orchestrator.handle_all(&events).await) {
                let line = match result {
                    Ok(outcome) => outcome.summary(),
                    Err(e) => {
                        failures += 1;
                        serde_json::json!({
                            "outcome": "error",
                            "class": e.class(),
                            "error": e.to_string(),
                        })
                    }
                };
                println!(
                    "{}",
                    serde_json::json!({"delivery_id": event.delivery_id, "result": line})
                );
            }
            if failures > 0 {
                bail!("{failures} of {} events failed", events.len());
            }
        }
        Commands::Status { version } => {
            let status = orchestrator
                .status(&version)
                .await
                .with_context(|| format!("Failed to read status of {version}"))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Redrive { version } => {
            let outcome = orchestrator
                .redrive(&version)
                .await
                .with_context(|| format!("Failed to re-drive {version}"))?;
            println!("{}", serde_json::to_string_pretty(&outcome.summary())?);
        }
    }

    Ok(())
}
