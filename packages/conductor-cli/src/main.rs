//! Command-line front end for the conductor engine.
//!
//! `conductor run` mounts the plugins listed in a manifest, submits one
//! sequence and prints its outcome. `conductor validate` checks a sequence
//! definition file without mounting it.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use conductor::{
    handler, ConductorBuilder, ConductorConfig, FsModuleLoader, HandlerTable, Priority, Sequence,
};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Run and validate conductor sequences")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount plugins from a manifest and run one sequence
    Run {
        /// Plugin manifest (JSON)
        #[arg(short, long)]
        manifest: PathBuf,

        /// Sequence id to submit
        #[arg(short, long)]
        sequence: String,

        /// Request data as a JSON object
        #[arg(short, long, default_value = "{}")]
        data: String,

        /// HIGH, NORMAL or CHAINED
        #[arg(short, long, default_value = "NORMAL")]
        priority: Priority,

        /// Directory plugin paths resolve against (defaults to the manifest's directory)
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Validate a sequence definition file
    Validate {
        /// Sequence JSON, bare or wrapped as `{ "sequence": { .. } }`
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,conductor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            manifest,
            sequence,
            data,
            priority,
            root,
        } => cmd_run(&manifest, &sequence, &data, priority, root).await,
        Commands::Validate { file } => cmd_validate(&file),
    }
}

// =============================================================================
// run
// =============================================================================

/// Every beat event gets a handler that logs the event and its payload.
fn tracing_handlers(sequence: &Sequence) -> HandlerTable {
    sequence
        .event_names()
        .into_iter()
        .map(|event| {
            let name = event.to_string();
            let logged = name.clone();
            (
                name,
                handler(move |msg| {
                    tracing::info!(event = %logged, payload = %msg.data, "beat event");
                    Ok(())
                }),
            )
        })
        .collect()
}

async fn cmd_run(
    manifest: &Path,
    sequence_id: &str,
    data: &str,
    priority: Priority,
    root: Option<PathBuf>,
) -> Result<ExitCode> {
    let data: Value = serde_json::from_str(data).context("--data is not valid JSON")?;

    let config = ConductorConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(?config, "configuration loaded");

    let root = root
        .or_else(|| manifest.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    let loader = FsModuleLoader::new(root).with_default_handlers(tracing_handlers);

    let conductor = ConductorBuilder::new(config).build();
    let report = conductor.mount_from_manifest(&loader, manifest).await;
    for warning in &report.warnings {
        tracing::warn!(%warning, "manifest warning");
    }
    for (plugin, error) in &report.failed {
        tracing::error!(%plugin, %error, "plugin failed to mount");
    }
    tracing::info!(
        mounted = ?report.mounted,
        skipped = report.skipped.len(),
        fallback = report.fallback_used,
        "plugins mounted"
    );

    let worker = conductor.start();
    let outcome = conductor
        .submit_and_wait(sequence_id, data, priority)
        .await
        .with_context(|| format!("Failed to submit {sequence_id}"));

    let summary = match outcome {
        Ok(summary) => summary,
        Err(e) => {
            worker.shutdown().await;
            return Err(e);
        }
    };
    worker.shutdown().await;

    let Some(summary) = summary else {
        println!("duplicate submission suppressed");
        return Ok(ExitCode::SUCCESS);
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("{}", serde_json::to_string_pretty(&conductor.statistics())?);

    if summary.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

// =============================================================================
// validate
// =============================================================================

fn cmd_validate(file: &Path) -> Result<ExitCode> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    let value = match value {
        Value::Object(mut map) if map.contains_key("sequence") => {
            map.remove("sequence").unwrap_or_default()
        }
        other => other,
    };
    if !value.is_object() {
        bail!("{} does not contain a sequence object", file.display());
    }

    let sequence: Sequence = serde_json::from_value(value)
        .with_context(|| format!("{} is not a sequence definition", file.display()))?;
    let report = sequence.validate();

    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    for error in &report.errors {
        println!("error: {error}");
    }

    if report.is_valid() {
        println!(
            "{} ({}): {} movements, {} beats",
            sequence.id,
            sequence.name,
            sequence.movements.len(),
            sequence.total_beats()
        );
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}
