//! DataFlow Ingest - chunked record ingestion tool

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dataflow_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use dataflow_common::RecordType;
use dataflow_ingest::framework::{CsvSource, JsonLinesSink, RunState};
use dataflow_ingest::{
    CheckpointStore, HandlerRegistry, Pipeline, PipelineConfig, ProgressObserver, RunOutcome,
    TracingObserver,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dataflow-ingest")]
#[command(author, version, about = "Normalize, validate and deduplicate business records")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline over a CSV file
    Run {
        /// Pipeline configuration (TOML, JSON or YAML)
        #[arg(short, long, env = "DATAFLOW_CONFIG")]
        config: PathBuf,

        /// Record type of the input rows
        #[arg(short = 't', long = "type")]
        record_type: String,

        /// Input CSV file
        #[arg(short, long)]
        input: PathBuf,

        /// Output JSON-lines file (appended to)
        #[arg(short, long)]
        output: PathBuf,

        /// Override pipeline.chunk_size
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Override pipeline.offset
        #[arg(long)]
        offset: Option<u64>,

        /// Checkpoint file written at every chunk commit
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Resume from the checkpoint file
        #[arg(long, requires = "checkpoint")]
        resume: bool,

        /// Write the report here instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,

        /// Disable the progress spinner
        #[arg(long)]
        no_progress: bool,
    },

    /// Validate a configuration file and compile its record types
    CheckConfig {
        #[arg(short, long, env = "DATAFLOW_CONFIG")]
        config: PathBuf,
    },
}

struct RunArgs {
    config: PathBuf,
    record_type: String,
    input: PathBuf,
    output: PathBuf,
    chunk_size: Option<usize>,
    offset: Option<u64>,
    checkpoint: Option<PathBuf>,
    resume: bool,
    report: Option<PathBuf>,
    no_progress: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("dataflow-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().with_env_overrides().unwrap_or(log_config);

    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    let result = match cli.command {
        Command::Run {
            config,
            record_type,
            input,
            output,
            chunk_size,
            offset,
            checkpoint,
            resume,
            report,
            no_progress,
        } => {
            run(RunArgs {
                config,
                record_type,
                input,
                output,
                chunk_size,
                offset,
                checkpoint,
                resume,
                report,
                no_progress,
            })
            .await
        },
        Command::CheckConfig { config } => check_config(&config).map(|_| true),
    };

    let status = exit_status(result);
    // Flush the file writer before the process ends
    drop(guard);
    ExitCode::from(status)
}

/// Report a failed command and map the result to the process exit status
fn exit_status(result: Result<bool>) -> u8 {
    match result {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            1
        },
    }
}

/// Returns false when the run aborted
async fn run(args: RunArgs) -> Result<bool> {
    let mut config = PipelineConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    if let Some(chunk_size) = args.chunk_size {
        config = config.with_chunk_size(chunk_size);
    }
    if let Some(offset) = args.offset {
        config = config.with_offset(offset);
    }

    let record_type = RecordType::new(&args.record_type);
    if config.record_type(&record_type).is_none() {
        bail!("record type '{}' is not configured in {}", record_type, args.config.display());
    }

    let store = args.checkpoint.as_ref().map(CheckpointStore::new);
    let mut pipeline = match (&store, args.resume) {
        (Some(store), true) => match store.load().context("Failed to read checkpoint")? {
            Some(checkpoint) => Pipeline::from_checkpoint(&config, checkpoint)?,
            None => {
                warn!(path = %store.path().display(), "No checkpoint found, starting from the configured offset");
                Pipeline::new(&config)?
            },
        },
        _ => Pipeline::new(&config)?,
    };

    pipeline = pipeline.with_observer(Arc::new(TracingObserver));
    if !args.no_progress {
        pipeline = pipeline.with_observer(Arc::new(ProgressObserver::new(&format!(
            "ingesting {}",
            args.input.display()
        ))));
    }
    if let Some(store) = store.clone() {
        pipeline = pipeline.with_checkpoint_store(store);
    }

    let source = CsvSource::open(&args.input, record_type)
        .with_context(|| format!("Failed to open input {}", args.input.display()))?;
    let sink = JsonLinesSink::open(&args.output)
        .with_context(|| format!("Failed to open output {}", args.output.display()))?;

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current chunk");
            cancel.cancel();
        }
    });

    let outcome = pipeline.run(&source, &sink).await;

    if outcome.state == RunState::Done {
        if let Some(store) = &store {
            store.clear().context("Failed to remove checkpoint")?;
        }
    }

    write_report(&outcome, args.report.as_deref())?;

    match &outcome.state {
        RunState::Aborted { reason } => {
            error!(%reason, "Run aborted");
            Ok(false)
        },
        RunState::Stopped => {
            if let Some(store) = &store {
                info!(path = %store.path().display(), offset = outcome.checkpoint.offset, "Resume with --resume");
            }
            Ok(true)
        },
        _ => Ok(true),
    }
}

fn write_report(outcome: &RunOutcome, path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(&outcome.summary).context("Failed to serialize report")?;
    match path {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write report {}", path.display()))?;
            info!(path = %path.display(), "Report written");
        },
        None => println!("{}", json),
    }
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = PipelineConfig::load(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    config.validate()?;
    let registry = HandlerRegistry::from_config(&config)?;

    println!("{}: {} record type(s)", path.display(), registry.len());
    for (name, type_config) in &config.record_types {
        println!(
            "  {}: {} fields, {} rules, key [{}], strategy {}",
            name,
            type_config.fields.len(),
            type_config.rules.len(),
            type_config.identity_key.join(", "),
            type_config.merge_strategy.name()
        );
    }
    println!(
        "  chunk_size {}, workers {}, emit {:?}",
        config.pipeline.chunk_size, config.pipeline.worker_concurrency, config.pipeline.emit
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(Ok(true)), 0);
        assert_eq!(exit_status(Ok(false)), 1);
        assert_eq!(exit_status(Err(anyhow::anyhow!("config missing"))), 1);
    }
}
