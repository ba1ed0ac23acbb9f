use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tgmart_storage::Warehouse;
use tgmart_sync::{reports, Pipeline, PipelineConfig, PipelineError, Stage};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit status when the run completed but the data-quality gate failed.
const QUALITY_GATE_EXIT: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "tgmart")]
#[command(about = "Load scraped channel messages and detections into an analytics warehouse")]
struct Cli {
    /// Overrides DATABASE_URL. `memory:` runs against a throwaway in-process store.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Overrides TGMART_LAKE_DIR.
    #[arg(long, global = true)]
    lake_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Every stage in order, then run reports and snapshots.
    Run,
    /// Load new message partitions and detection files into the raw tables.
    Load,
    /// Rebuild staging and mart tables from the raw tables.
    Transform,
    /// Evaluate the data-quality constraints against the marts.
    Check,
    Migrate,
    /// Write parquet snapshots of the marts.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    #[command(subcommand)]
    Report(ReportCommand),
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    /// Most frequently detected object classes.
    TopObjects {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Daily activity of one channel.
    ChannelActivity { channel: String },
    /// Messages containing a phrase, case-insensitive.
    Search {
        query: String,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TGMART_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(dir) = cli.lake_dir {
        config.lake_dir = dir;
    }
    let pipeline = Pipeline::connect(config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = pipeline.run().await?;
            println!(
                "run complete: run_id={} backend={} reports={}",
                summary.run_id, summary.backend, summary.reports_dir
            );
        }
        Commands::Load => {
            let messages = pipeline.load_messages().await?;
            pipeline.enforce_budget(Stage::LoadMessages, &messages)?;
            let detections = pipeline.load_detections().await?;
            pipeline.enforce_budget(Stage::LoadDetections, &detections)?;
            println!(
                "load complete: messages inserted={} duplicates={} rejected={}; detection batches inserted={} already_loaded={}",
                messages.inserted,
                messages.duplicates,
                messages.rejected,
                detections.inserted,
                detections.duplicates
            );
        }
        Commands::Transform => {
            let staging = pipeline.run_staging().await?;
            let marts = pipeline.run_dimensional().await?;
            println!(
                "transform complete: staged messages={} detections={} rejected={}",
                staging.messages_staged,
                staging.detections_staged,
                staging.messages_rejected + staging.detections_rejected
            );
            for (table, rows) in marts.row_counts() {
                println!("  {table}: {rows}");
            }
        }
        Commands::Check => {
            let report = pipeline.run_quality().await?;
            print_json(&report)?;
            if !report.passed() {
                eprintln!(
                    "quality check failed: {} constraint(s) violated",
                    report.failed_errors().count()
                );
                return Ok(ExitCode::from(QUALITY_GATE_EXIT));
            }
        }
        Commands::Migrate => {
            pipeline.migrate().await?;
            println!("migrations applied ({})", pipeline.warehouse().backend_name());
        }
        Commands::Export { out } => {
            let out = out.unwrap_or_else(|| pipeline.config().reports_dir.join("latest"));
            let manifest = pipeline.export_snapshots(&out).await?;
            println!("snapshots written: {}", manifest.display());
        }
        Commands::Report(report) => {
            let marts = pipeline
                .warehouse()
                .marts()
                .await
                .context("reading mart tables")?;
            match report {
                ReportCommand::TopObjects { limit } => {
                    print_json(&reports::top_objects(&marts, limit))?;
                }
                ReportCommand::ChannelActivity { channel } => {
                    match reports::channel_activity(&marts, &channel) {
                        Some(rows) => print_json(&rows)?,
                        None => {
                            eprintln!("unknown channel `{channel}`");
                            return Ok(ExitCode::FAILURE);
                        }
                    }
                }
                ReportCommand::Search { query, limit } => {
                    print_json(&reports::search_messages(&marts, &query, limit))?;
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::QualityGate { .. }) => ExitCode::from(QUALITY_GATE_EXIT),
        _ => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            if let Some(PipelineError::QualityGate { report, .. }) = err.downcast_ref::<PipelineError>() {
                let summary = report
                    .failed_errors()
                    .map(|r| format!("{} ({} violations)", r.constraint, r.violations))
                    .collect::<Vec<_>>()
                    .join(", ");
                error!(failed = %summary, "data-quality gate failed");
            }
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    }
}
