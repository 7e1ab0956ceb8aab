mod config;
mod error;
mod models;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::pipeline::report::{read_failures_csv, write_failures_csv};
use crate::pipeline::{Pipeline, RunReport, ScanRange};
use crate::scraper::HttpClient;
use crate::storage::{DuckDbRecordStore, FsBlobStore, Persistence};

#[derive(Parser)]
#[command(name = "euctr-scraper", about = "EU Clinical Trials Register scraper", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Scrape a date range or a range of listing pages
    Scrape {
        #[arg(long)]
        start_date: Option<NaiveDate>,
        #[arg(long)]
        end_date: Option<NaiveDate>,
        #[arg(long)]
        start_page: Option<u32>,
        #[arg(long)]
        end_page: Option<u32>,

        /// Write failed and partial trials here for a later `retry`
        #[arg(long)]
        failures_csv: Option<PathBuf>,
    },

    /// Re-run only the trials listed in a failure report
    Retry {
        #[arg(long)]
        failures_csv: PathBuf,
    },

    /// Show record store statistics
    Stats,

    /// Apply schema migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "euctr_scraper=info,warn",
        1 => "euctr_scraper=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Scrape {
            start_date,
            end_date,
            start_page,
            end_page,
            failures_csv,
        } => {
            // Mode errors surface before anything touches the network or the stores.
            let range = ScanRange::from_bounds(start_date, end_date, start_page, end_page)?;
            let _t = utils::Timer::start("Scrape");

            let (pipeline, records) = build_pipeline(&config)?;
            let report = pipeline.run(range).await?;
            finish(&records, &report, failures_csv.as_deref())?;
        }

        Command::Retry { failures_csv } => {
            let failures = read_failures_csv(&failures_csv)
                .with_context(|| format!("reading {:?}", failures_csv))?;
            info!("{} failure row(s) to retry", failures.len());
            let _t = utils::Timer::start("Retry");

            let (pipeline, records) = build_pipeline(&config)?;
            let report = pipeline.retry_failures(failures).await?;
            finish(&records, &report, Some(&failures_csv))?;
        }

        Command::Stats => {
            let records = open_records(&config)?;
            let trials = records.count()?;
            let runs = records.recent_runs(5)?;
            println!("─────────────────────────────────");
            println!("  EU CTR Scraper — Record Store");
            println!("─────────────────────────────────");
            println!("  Trials   : {}", utils::fmt_number(trials));
            for run in &runs {
                println!(
                    "  {}  attempted {:>6}  full {:>6}  partial {:>5}  failed {:>5}",
                    run.finished_at.format("%Y-%m-%d %H:%M"),
                    utils::fmt_number(run.attempted),
                    utils::fmt_number(run.full),
                    utils::fmt_number(run.partial),
                    utils::fmt_number(run.failed),
                );
            }
            println!("─────────────────────────────────");
        }

        Command::Migrate => {
            open_records(&config)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}

fn open_records(config: &AppConfig) -> Result<Arc<DuckDbRecordStore>> {
    let records = DuckDbRecordStore::open(&config.storage.db_path, &config.storage.record_table)
        .context("Failed to open DuckDB")?;
    if config.storage.run_migrations {
        records.run_migrations()?;
    }
    Ok(Arc::new(records))
}

fn build_pipeline(config: &AppConfig) -> Result<(Pipeline, Arc<DuckDbRecordStore>)> {
    let records = open_records(config)?;
    let blobs = Arc::new(FsBlobStore::open(&config.storage.blob_root)?);
    let persistence = Persistence::new(blobs, records.clone(), config.storage.historize);

    let client = Arc::new(HttpClient::new(&config.register).context("Failed to build HTTP client")?);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Stop requested; finishing the trials in flight");
            let _ = stop_tx.send(true);
        }
    });

    let pipeline = Pipeline::new(config, client, persistence)?.with_stop(stop_rx);
    Ok((pipeline, records))
}

fn finish(records: &DuckDbRecordStore, report: &RunReport, failures_csv: Option<&Path>) -> Result<()> {
    if let Err(e) = records.log_run(report) {
        warn!("could not record run log: {}", e);
    }

    let rows = report.retry_rows();
    if let Some(path) = failures_csv {
        write_failures_csv(path, &rows)?;
    }

    println!(
        "attempted {} | full {} | partial {} | failed {} | pages skipped {}{}",
        report.trials_attempted,
        report.trials_fully_captured,
        report.trials_partially_captured,
        report.trials_failed,
        report.failed_pages.len(),
        if report.stopped_early { " | stopped early" } else { "" },
    );
    Ok(())
}
