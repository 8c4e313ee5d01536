use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use ingest_core::{
    chunk_windows, DirectorySource, FeedCatalog, FetchWindow, IngestionRun, RunOptions,
    RunReport, SqliteStore, DEFAULT_CHUNK_DAYS,
};
use log::info;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ingest_core")]
#[command(about = "Normalize market time series into quarter-hour tables")]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "INGEST_DB", default_value = "market_data.db")]
    db: PathBuf,

    /// Feed catalog JSON (defaults to the built-in catalog)
    #[arg(long, env = "INGEST_FEEDS")]
    feeds: Option<PathBuf>,

    /// Directory holding downloaded documents, one sub-directory per feed
    #[arg(long, env = "INGEST_INPUT", default_value = "downloads")]
    input_dir: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value = "summary")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one feed for a date range in a single run
    Run(RunArgs),
    /// Ingest a long date range as a sequence of independent chunks
    Backfill {
        #[command(flatten)]
        run: RunArgs,

        /// Days per chunk
        #[arg(long, default_value_t = DEFAULT_CHUNK_DAYS)]
        chunk_days: u32,

        /// Seconds to wait between chunks
        #[arg(long, default_value_t = 0)]
        pause_secs: u64,
    },
    /// List configured feeds
    Feeds,
}

#[derive(Args)]
struct RunArgs {
    /// Feed name from the catalog
    feed: String,

    /// Start date (YYYY-MM-DD, local calendar)
    #[arg(long)]
    start_date: String,

    /// End date (YYYY-MM-DD, inclusive; defaults to the start date)
    #[arg(long)]
    end_date: Option<String>,

    /// Restrict to these area ids
    #[arg(long = "area")]
    areas: Vec<i32>,

    /// Parse and aggregate without writing
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    fn dates(&self) -> Result<(NaiveDate, NaiveDate)> {
        let start = NaiveDate::parse_from_str(&self.start_date, "%Y-%m-%d")
            .with_context(|| format!("invalid start date {}", self.start_date))?;
        let end = match &self.end_date {
            Some(end) => NaiveDate::parse_from_str(end, "%Y-%m-%d")
                .with_context(|| format!("invalid end date {}", end))?,
            None => start,
        };
        Ok((start, end))
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            dry_run: self.dry_run,
            areas: (!self.areas.is_empty()).then(|| self.areas.clone()),
        }
    }
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
    Summary,
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let catalog = match &cli.feeds {
        Some(path) => FeedCatalog::from_path(path)
            .with_context(|| format!("loading feed catalog {}", path.display()))?,
        None => FeedCatalog::embedded().context("loading built-in feed catalog")?,
    };
    let basis = catalog.time_basis()?;

    let (args, windows, pause) = match &cli.command {
        Command::Feeds => {
            for feed in catalog.feeds() {
                println!(
                    "{:<26} {:<30} {:>3} min  {} columns",
                    feed.name(),
                    feed.table(),
                    feed.config.native_resolution_minutes,
                    feed.schema.width()
                );
            }
            return Ok(ExitCode::SUCCESS);
        }
        Command::Run(args) => {
            let (start, end) = args.dates()?;
            (args, vec![FetchWindow::local_days(&basis, start, end)?], Duration::ZERO)
        }
        Command::Backfill {
            run,
            chunk_days,
            pause_secs,
        } => {
            let (start, end) = run.dates()?;
            let windows = chunk_windows(&basis, start, end, *chunk_days)?;
            info!("Backfilling {} in {} chunks", run.feed, windows.len());
            (run, windows, Duration::from_secs(*pause_secs))
        }
    };

    let source = DirectorySource::new(&cli.input_dir, basis.clone());
    let mut store = SqliteStore::open(&cli.db)
        .with_context(|| format!("opening {}", cli.db.display()))?;
    let reports = {
        let mut run = IngestionRun::new(&catalog, &args.feed, &source, &mut store, args.options())?;
        run.run_backfill(&windows, pause)
    };

    print_reports(&reports, &cli.output)?;

    if reports.iter().any(RunReport::is_failure) {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn print_reports(reports: &[RunReport], format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(reports)?);
        }
        OutputFormat::Csv => {
            println!("Feed,WindowStart,WindowEnd,Documents,Skipped,Duplicates,Rows,Intervals,FetchFailures,DocumentFailures");
            for r in reports {
                println!(
                    "{},{},{},{},{},{},{},{},{},{}",
                    r.feed,
                    r.window_start.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    r.window_end.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    r.documents,
                    r.skipped_rows,
                    r.duplicates,
                    r.rows_written,
                    r.intervals_written,
                    r.fetch_failures.len(),
                    r.document_failures.len()
                );
            }
        }
        OutputFormat::Summary => {
            let mut total = RunReport::default();
            for report in reports {
                total.absorb(report.clone());
            }
            println!("Ingestion Summary");
            println!("=================");
            println!("Feed: {}{}", total.feed, if total.dry_run { " (dry run)" } else { "" });
            if let (Some(start), Some(end)) = (total.window_start, total.window_end) {
                println!("Window: {} .. {}", start, end);
            }
            println!("Chunks: {}", reports.len());
            println!("Documents parsed: {}", total.documents);
            println!("Observations: {}", total.observations);
            println!("Rows skipped: {}", total.skipped_rows);
            println!("Unmapped codes: {}", total.unmapped);
            println!("Superseded values: {}", total.superseded);
            println!("Outside requested days: {}", total.out_of_window);
            println!("Duplicates collapsed: {}", total.duplicates);
            println!("Rows upserted: {}", total.rows_written);
            println!("Intervals aggregated: {}", total.intervals_written);
            println!("Missing or discarded documents: {}", total.fetch_failures.len());
            for failure in &total.document_failures {
                println!("  FAILED: {}", failure);
            }
            if let Some(failure) = &total.persist_failure {
                println!("  WRITE FAILED: {}", failure);
            }
        }
    }
    Ok(())
}
