mod config;
mod logging;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use config::{AppConfig, DEFAULT_CONFIG_FILE};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use wmis_collector::{JsonlExportSource, RetryingExtractor, RetryingSource, SystemMessageFilter};
use wmis_pipeline::{CommandExtractor, Pipeline, RunReport};
use wmis_storage::{Checkpoint, CheckpointStore, MarketStatistics, MarketStore, PriceTrendPoint};

#[derive(Parser)]
#[command(name = "wmis")]
#[command(about = "Incremental chat-trade collector", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Force debug logging
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect new messages, extract trades and store them
    Run {
        /// Only process these groups instead of the configured list
        #[arg(long = "group")]
        groups: Vec<String>,
    },
    /// Inspect or reset per-group anchors
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointCommands,
    },
    /// Show stored record statistics and the recent price trend
    Stats {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    List,
    /// Forget the anchor so the next run re-collects the whole history
    Reset { conversation: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.debug);

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Run { groups } => {
            let groups = if groups.is_empty() {
                config.groups.clone()
            } else {
                groups
            };
            let report = run(&config, &groups)?;
            print!("{}", render_run_report(&report));
        }
        Commands::Checkpoints { action } => {
            let checkpoints = CheckpointStore::load(&config.checkpoint.path);
            match action {
                CheckpointCommands::List => {
                    print!("{}", render_checkpoints(&checkpoints.all()));
                }
                CheckpointCommands::Reset { conversation } => {
                    let removed = checkpoints
                        .remove(&conversation)
                        .context("Failed to rewrite checkpoint file")?;
                    match removed {
                        Some(_) => println!("Reset checkpoint for {conversation}"),
                        None => println!("No checkpoint stored for {conversation}"),
                    }
                }
            }
        }
        Commands::Stats { days } => {
            let store = open_market_store(&config.database.path)?;
            let stats = store.statistics().context("Failed to read statistics")?;
            let trend = store
                .price_trend(trend_start(Utc::now(), days)?)
                .context("Failed to read price trend")?;
            print!("{}", render_stats(&stats, &trend, days));
        }
    }

    Ok(())
}

fn run(config: &AppConfig, groups: &[String]) -> Result<RunReport> {
    if groups.is_empty() {
        warn!(event = "no_groups_configured", config = %config.base_dir.display());
        return Ok(RunReport::default());
    }

    let filter =
        SystemMessageFilter::chat_client_defaults().context("Failed to compile message filter")?;
    let source = RetryingSource::new(
        JsonlExportSource::new(&config.source.export_dir, config.source.page_size, filter),
        config.source_retry(),
    );
    let extractor = CommandExtractor::from_argv(&config.extractor.command)
        .context("extractor.command is empty")?
        .with_working_dir(&config.base_dir)
        .with_timeout(config.extractor_timeout());
    let extractor = RetryingExtractor::new(extractor, config.extractor_retry());
    let sink = open_market_store(&config.database.path)?;
    let checkpoints = CheckpointStore::load(&config.checkpoint.path);

    info!(
        event = "run_start",
        groups = groups.len(),
        export_dir = %config.source.export_dir.display(),
        database = %config.database.path.display()
    );
    let mut pipeline = Pipeline::new(
        &checkpoints,
        source,
        extractor,
        sink,
        config.pipeline_options(),
    );
    pipeline.run(groups).context("Run aborted")
}

fn open_market_store(path: &Path) -> Result<MarketStore> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    MarketStore::open(path).with_context(|| format!("Failed to open database {}", path.display()))
}

fn trend_start(now: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>> {
    now.checked_sub_signed(Duration::days(i64::from(days)))
        .with_context(|| format!("--days {days} reaches before the earliest representable date"))
}

fn render_run_report(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Processed {} groups ({} failed): {} new messages, {} batches, {} records stored, {} extraction failures",
        report.conversations_processed + report.conversations_failed,
        report.conversations_failed,
        report.messages_collected,
        report.batches,
        report.records_stored,
        report.extraction_failures
    );
    for conversation in &report.conversations {
        match &conversation.error {
            Some(error) => {
                let _ = writeln!(out, "- {}: failed: {error}", conversation.conversation_id);
            }
            None => {
                let _ = writeln!(
                    out,
                    "- {}: {} messages, {} records{}",
                    conversation.conversation_id,
                    conversation.messages_collected,
                    conversation.records_stored,
                    if conversation.page_limit_reached {
                        " (page limit reached)"
                    } else {
                        ""
                    }
                );
            }
        }
    }
    out
}

fn render_checkpoints(checkpoints: &[Checkpoint]) -> String {
    if checkpoints.is_empty() {
        return "No checkpoints stored\n".to_string();
    }
    let mut out = String::new();
    for checkpoint in checkpoints {
        let _ = writeln!(
            out,
            "- {} @ {} \"{}\" (updated {})",
            checkpoint.conversation_id,
            checkpoint.last_timestamp,
            checkpoint.last_content,
            checkpoint.updated_at.to_rfc3339()
        );
    }
    out
}

fn render_stats(stats: &MarketStatistics, trend: &[PriceTrendPoint], days: u32) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Total records: {}", stats.total_records);
    match stats.avg_price {
        Some(avg) => {
            let _ = writeln!(out, "Average price: {avg:.2}");
        }
        None => {
            let _ = writeln!(out, "Average price: n/a");
        }
    }
    let _ = writeln!(out, "By group:");
    for (group, count) in &stats.by_group {
        let _ = writeln!(out, "  {group}: {count}");
    }
    let _ = writeln!(out, "By action:");
    for (action, count) in &stats.by_action {
        let _ = writeln!(out, "  {action}: {count}");
    }
    let _ = writeln!(out, "Price trend (last {days} days):");
    for point in trend {
        let _ = writeln!(
            out,
            "  {} {} avg {:.2} over {}",
            point.date, point.action, point.avg_price, point.count
        );
    }
    out
}
