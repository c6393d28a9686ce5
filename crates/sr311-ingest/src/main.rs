//! SR311 Ingest - scheduled 311 service request ingestion

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use sr311_common::logging::{init_logging, LogConfig, LogLevel};
use sr311_ingest::{
    clock::SystemClock,
    config::IngestConfig,
    fetcher::PaginatedFetcher,
    handler,
    orchestrator::IngestionOrchestrator,
    persist::S3Persister,
    source::SocrataClient,
    storage::{self, Storage},
    watermark::{FileWatermarkStore, S3WatermarkStore, WatermarkStore},
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sr311-ingest")]
#[command(author, version, about = "Incremental 311 service request ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one ingestion invocation and print the response
    Run(RunArgs),

    /// Inspect the watermark
    Watermark {
        #[command(subcommand)]
        action: WatermarkAction,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Invocation event as inline JSON
    #[arg(long, conflicts_with = "event_file")]
    event: Option<String>,

    /// Invocation event read from a JSON file
    #[arg(long)]
    event_file: Option<PathBuf>,

    /// Backfill even if a watermark exists
    #[arg(long)]
    force_initial_load: bool,

    /// Record cap for this run
    #[arg(long)]
    max_records: Option<usize>,

    /// Backfill window in days
    #[arg(long)]
    initial_lookback_days: Option<u32>,

    /// Records per page
    #[arg(long)]
    batch_size: Option<usize>,

    /// Pin the window end to midnight UTC of this date (YYYY-MM-DD)
    #[arg(long)]
    test_end_date: Option<String>,

    /// Keep the watermark in a local file instead of S3
    #[arg(long)]
    state_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum WatermarkAction {
    /// Print the current watermark
    Show {
        /// Read from a local file instead of S3
        #[arg(long)]
        state_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("sr311-ingest")
        .filter_directives("aws_smithy_runtime=warn,aws_config=warn,hyper=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            None
        }
    };

    let code = match execute(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            1
        }
    };

    // process::exit skips destructors; flush file logs first
    drop(guard);
    process::exit(code);
}

async fn execute(command: Command) -> Result<i32> {
    let config = IngestConfig::from_env()?;

    match command {
        Command::Run(args) => run(args, &config).await,
        Command::Watermark {
            action: WatermarkAction::Show { state_file },
        } => {
            let store = watermark_store(&config, state_file).await;
            match store.read().await? {
                Some(watermark) => {
                    println!("{}", serde_json::to_string_pretty(&watermark)?);
                }
                None => {
                    println!("No watermark at {}; the next run will be an initial load", store.location());
                }
            }
            Ok(0)
        }
    }
}

async fn run(args: RunArgs, config: &IngestConfig) -> Result<i32> {
    let event = build_event(&args)?;
    info!(event = %event, "Invocation event");

    let client = storage::connect(&config.storage).await;
    let persister = S3Persister::new(
        Storage::new(client.clone(), &config.output.raw_bucket),
        Storage::new(client, &config.output.processed_bucket),
    );
    let source = SocrataClient::new(&config.source)?;
    info!("Source: {}", source.resource_url());

    let orchestrator = IngestionOrchestrator::new(
        watermark_store(config, args.state_file).await,
        PaginatedFetcher::new(Arc::new(source), config.retry.policy()),
        Arc::new(persister),
        Arc::new(SystemClock),
    );

    let response = handler::handle(event, &orchestrator, config.run_budget()).await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    Ok(if response.is_success() { 0 } else { 1 })
}

async fn watermark_store(config: &IngestConfig, state_file: Option<PathBuf>) -> Arc<dyn WatermarkStore> {
    match state_file {
        Some(path) => Arc::new(FileWatermarkStore::new(path)),
        None => {
            let client = storage::connect(&config.storage).await;
            Arc::new(S3WatermarkStore::new(
                Storage::new(client, &config.output.state_bucket),
                &config.output.state_key,
            ))
        }
    }
}

/// Event from `--event`/`--event-file`, with flags layered on top
fn build_event(args: &RunArgs) -> Result<Value> {
    let mut event = match (&args.event, &args.event_file) {
        (Some(inline), _) => serde_json::from_str(inline).context("--event is not valid JSON")?,
        (None, Some(path)) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read event file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("{} is not valid JSON", path.display()))?
        }
        (None, None) => json!({}),
    };

    if event.is_null() {
        event = json!({});
    }
    let fields = event
        .as_object_mut()
        .context("Invocation event must be a JSON object")?;

    if args.force_initial_load {
        fields.insert("force_initial_load".into(), json!(true));
    }
    if let Some(max_records) = args.max_records {
        fields.insert("max_records".into(), json!(max_records));
    }
    if let Some(days) = args.initial_lookback_days {
        fields.insert("initial_lookback_days".into(), json!(days));
    }
    if let Some(batch_size) = args.batch_size {
        fields.insert("batch_size".into(), json!(batch_size));
    }
    if let Some(date) = &args.test_end_date {
        fields.insert("test_end_date".into(), json!(date));
    }

    Ok(event)
}
