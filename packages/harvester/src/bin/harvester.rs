//! Harvester CLI
//!
//! Runs a harvest for a date range, reports task status, or forces
//! re-extraction. Prints a JSON summary on stdout; logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use harvester::{
    DateRange, EndpointCatalog, HarvestConfig, Harvester, HttpPageSource, RunContext,
    SqliteStore, TaskStatus,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "harvester")]
#[command(about = "Mirror a paginated, date-partitioned REST API")]
struct Cli {
    /// Endpoint catalogue (JSON). Overrides HARVEST_CATALOG.
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest a date range
    Run {
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Fill missing bounds from the catalogue's earliest date and today
        #[arg(long)]
        backfill: bool,
        /// Adopt open tasks planned under an older configuration
        #[arg(long)]
        replan: bool,
    },

    /// Report task counts by status
    Status {
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
    },

    /// Force re-extraction of a range
    Reset {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[derive(Serialize)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    counts: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blobs_created: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blobs_reused: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    persistence_failures: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancelled: Option<bool>,
}

impl Response {
    fn new(success: bool) -> Self {
        Self {
            success,
            range: None,
            counts: None,
            reset: None,
            requests: None,
            blobs_created: None,
            blobs_reused: None,
            persistence_failures: None,
            cancelled: None,
        }
    }
}

fn output(resp: &Response) -> Result<()> {
    println!("{}", serde_json::to_string(resp)?);
    Ok(())
}

fn named_counts(counts: &BTreeMap<TaskStatus, u64>) -> BTreeMap<String, u64> {
    counts.iter().map(|(s, n)| (s.to_string(), *n)).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,harvester=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = HarvestConfig::from_env().context("Failed to load configuration")?;
    let catalog_path = cli
        .catalog
        .or_else(|| config.catalog_path.clone())
        .context("No endpoint catalogue: pass --catalog or set HARVEST_CATALOG")?;
    let catalog = EndpointCatalog::load(&catalog_path)
        .with_context(|| format!("Failed to load catalogue {}", catalog_path.display()))?;

    if let Commands::Run {
        backfill, replan, ..
    } = &cli.command
    {
        config.backfill = *backfill;
        config.replan_stale = *replan;
    }

    let store = SqliteStore::connect(&config.database_url)
        .await
        .context("Failed to open database")?;
    let source = HttpPageSource::from_config(&config).context("Failed to build HTTP client")?;
    let worker_id = config.worker_id.clone();
    let harvester = Harvester::new(store, catalog, config, source);

    match cli.command {
        Commands::Run { start, end, .. } => {
            let range = harvester
                .resolve_range(start, end)
                .context("Invalid date range")?;

            let token = CancellationToken::new();
            let signal_token = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, stopping after in-flight work");
                    signal_token.cancel();
                }
            });

            let ctx = RunContext::with_token(worker_id, token);
            let summary = harvester.run(range, &ctx).await.context("Harvest failed")?;

            let exit_code = summary.exit_code();
            output(&Response {
                range: Some(summary.range.to_string()),
                counts: Some(named_counts(&summary.counts)),
                requests: Some(summary.requests.requests),
                blobs_created: Some(summary.writer.blobs_created),
                blobs_reused: Some(summary.writer.blobs_reused),
                persistence_failures: Some(summary.persistence_failures),
                cancelled: Some(summary.cancelled),
                ..Response::new(exit_code == 0)
            })?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }

        Commands::Status { start, end } => {
            let range = match (start, end) {
                (Some(start), Some(end)) => Some(DateRange::new(start, end)?),
                (None, None) => None,
                _ => anyhow::bail!("--start and --end must be given together"),
            };
            let report = harvester.status(range.as_ref()).await?;
            output(&Response {
                range: report.range.map(|r| r.to_string()),
                counts: Some(named_counts(&report.counts)),
                ..Response::new(true)
            })?;
        }

        Commands::Reset {
            start,
            end,
            endpoint,
        } => {
            let range = DateRange::new(start, end)?;
            let count = harvester.reset(endpoint.as_deref(), &range).await?;
            output(&Response {
                range: Some(range.to_string()),
                reset: Some(count),
                ..Response::new(true)
            })?;
        }
    }

    Ok(())
}
