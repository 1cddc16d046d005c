//! NFP revision pipeline command-line entry point.
//!
//! Each pipeline stage is a subcommand; `run` chains them in order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use nfp_revisions::extract::ReportExtractor;
use nfp_revisions::fetch::{download_series, FRED_PAYEMS_URL};
use nfp_revisions::merge::MergeEngine;
use nfp_revisions::quality::{self, QualityChecker};
use nfp_revisions::releases::ReleaseTable;
use nfp_revisions::server::{run_server, ServerConfig};
use nfp_revisions::snapshot::{SnapshotDiff, SnapshotStore};
use nfp_revisions::summary::SummaryReport;

/// NFP revision pipeline
///
/// Fetches the FRED PAYEMS series, extracts BLS release values,
/// derives revision statistics, and serves the dashboard.
#[derive(Parser, Debug)]
#[command(name = "nfp-pipeline")]
#[command(about = "Nonfarm payroll revision pipeline")]
struct Args {
    /// Directory for raw inputs (snapshots, reports, release table)
    #[arg(long, default_value = "data_raw")]
    raw_dir: PathBuf,

    /// Directory for processed outputs
    #[arg(long, default_value = "data_processed")]
    out_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the latest PAYEMS series and snapshot it
    Fetch {
        /// Override the FRED download URL
        #[arg(long, env = "FRED_PAYEMS_URL", default_value = FRED_PAYEMS_URL)]
        url: String,
    },
    /// Extract release values from BLS report text files
    Extract {
        /// Directory of empsit report .txt files
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
    /// Merge snapshots and releases into the revision dataset
    Merge,
    /// Run quality checks against the persisted dataset
    Check,
    /// Serve the dashboard over HTTP
    Serve {
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Open the dashboard in a browser on startup
        #[arg(long)]
        open: bool,

        /// Directory holding dashboard assets
        #[arg(long, default_value = ".")]
        root_dir: PathBuf,
    },
    /// Run fetch, extract, merge, and check in sequence
    Run {
        #[arg(long, env = "FRED_PAYEMS_URL", default_value = FRED_PAYEMS_URL)]
        url: String,

        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Fetch { url } => {
            fetch_stage(&args.raw_dir, &url).await?;
        }
        Command::Extract { reports_dir } => {
            let reports_dir = reports_dir.unwrap_or_else(|| args.raw_dir.join("bls_reports"));
            extract_stage(&args.raw_dir, &reports_dir)?;
        }
        Command::Merge => {
            merge_stage(&args.raw_dir, &args.out_dir)?;
        }
        Command::Check => {
            check_stage(&args.out_dir)?;
        }
        Command::Serve {
            port,
            open,
            root_dir,
        } => {
            run_server(ServerConfig {
                port,
                open_browser: open,
                root_dir,
            })
            .await?;
        }
        Command::Run { url, reports_dir } => {
            fetch_stage(&args.raw_dir, &url).await?;

            // Report extraction is best-effort; the merge falls back to
            // a release1 proxy when no release table exists.
            let reports_dir = reports_dir.unwrap_or_else(|| args.raw_dir.join("bls_reports"));
            if reports_dir.is_dir() {
                if let Err(err) = extract_stage(&args.raw_dir, &reports_dir) {
                    warn!(error = %err, "Release extraction failed, continuing without it");
                }
            } else {
                warn!(dir = %reports_dir.display(), "No BLS reports directory, skipping extraction");
            }

            merge_stage(&args.raw_dir, &args.out_dir)?;

            // A check-stage crash (unreadable output, bad format)
            // aborts the run; a low score does not, it is reported.
            check_stage(&args.out_dir)?;
        }
    }

    Ok(())
}

async fn fetch_stage(raw_dir: &Path, url: &str) -> Result<()> {
    let store = SnapshotStore::open(raw_dir.join("fred_snapshots"))
        .context("opening snapshot store")?;

    let series = download_series(url).await.context("downloading PAYEMS")?;
    info!(records = series.len(), "Downloaded PAYEMS series");

    match store.compare_with_previous(&series)? {
        SnapshotDiff::NoPrevious => info!("First snapshot, nothing to compare against"),
        SnapshotDiff::NoOverlap => warn!("No overlap with previous snapshot"),
        SnapshotDiff::Compared(stats) => info!(
            common = stats.common_records,
            revised = stats.revised.len(),
            max_abs_change = stats.max_abs_change,
            "Compared against previous snapshot"
        ),
    }

    let suffix = chrono::Utc::now().format("%Y%m%d").to_string();
    let path = store.save(&series, &suffix).context("saving snapshot")?;
    info!(path = %path.display(), "Saved snapshot");
    Ok(())
}

fn extract_stage(raw_dir: &Path, reports_dir: &Path) -> Result<()> {
    let extractor = ReportExtractor::new();
    let records = extractor
        .scan_dir(reports_dir)
        .context("scanning BLS reports")?;
    if records.is_empty() {
        warn!(dir = %reports_dir.display(), "No release values extracted");
        return Ok(());
    }
    info!(records = records.len(), "Extracted release values");

    let table = ReleaseTable::from_records(&records);
    let path = table.write(raw_dir).context("writing release table")?;
    info!(path = %path.display(), periods = table.rows.len(), "Saved release table");
    Ok(())
}

fn merge_stage(raw_dir: &Path, out_dir: &Path) -> Result<()> {
    let store = SnapshotStore::open(raw_dir.join("fred_snapshots"))
        .context("opening snapshot store")?;
    let series = store
        .load_latest()
        .context("loading latest snapshot; run fetch first")?;

    let releases = ReleaseTable::load(raw_dir).context("loading release table")?;
    if releases.is_none() {
        info!("No release table found, release1 will proxy the final series");
    }

    let dataset = MergeEngine::default()
        .merge(&series, releases.as_ref())
        .context("merging revision dataset")?;
    info!(rows = dataset.rows.len(), "Merged revision dataset");

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    dataset
        .write_parquet(&out_dir.join("nfp_revisions.parquet"))
        .context("writing parquet dataset")?;
    dataset
        .write_csv(&out_dir.join("nfp_revisions.csv"))
        .context("writing csv dataset")?;

    let summary = SummaryReport::build(&dataset);
    summary
        .save(&out_dir.join("summary_report.json"))
        .context("writing summary report")?;
    info!(
        records = summary.total_records,
        outliers = summary.outlier_count,
        "Wrote summary report"
    );
    Ok(())
}

fn check_stage(out_dir: &Path) -> Result<()> {
    let parquet = out_dir.join("nfp_revisions.parquet");
    let csv = out_dir.join("nfp_revisions.csv");
    let data_file = if parquet.exists() { parquet } else { csv };

    let checker = QualityChecker::new(&data_file);
    let report = checker.run().context("running quality checks")?;
    QualityChecker::save_report(&report, &out_dir.join("quality_report.json"))
        .context("writing quality report")?;
    quality::print_summary(&report);
    Ok(())
}
