use anyhow::{Context, Result};
use chrono::NaiveDate;
use ingest_core::{FeedCatalog, Period, SqliteStore, TimeBasis};
use std::path::{Path, PathBuf};

mod archive_extractor;
mod inbox_processor;

const DEFAULT_DB: &str = "market_data.db";

fn load_catalog() -> Result<FeedCatalog> {
    match std::env::var_os("INGEST_FEEDS") {
        Some(path) => FeedCatalog::from_path(Path::new(&path))
            .with_context(|| format!("Failed to load feed catalog {:?}", path)),
        None => Ok(FeedCatalog::embedded()?),
    }
}

/// Periods a complete local day carries; the spring transition day loses its skipped hour.
fn expected_periods(basis: &TimeBasis, date: NaiveDate) -> usize {
    Period::all()
        .filter(|p| basis.to_utc(basis.period_start(date, *p)).is_some())
        .count()
}

fn verify_store(db_path: &Path, basis: &TimeBasis) -> Result<usize> {
    println!("\n🔍 Store Verification: {}", db_path.display());
    println!("{}", "=".repeat(60));

    let store = SqliteStore::open(db_path)?;
    let mut total_issues = 0;

    for table in store.tables()? {
        let columns = store.table_columns(&table)?;
        let has = |name: &str| columns.iter().any(|c| c == name);
        if !has("trade_date") || !has("period") {
            continue;
        }

        println!("\n📁 {} ({} rows)", table, store.count_rows(&table)?);

        if has("time_interval") {
            let mismatched: Vec<(i64, String)> = store
                .interval_labels(&table)?
                .into_iter()
                .filter(|(period, label)| {
                    u8::try_from(*period)
                        .ok()
                        .and_then(Period::new)
                        .map_or(true, |p| Period::from_label(label) != Some(p))
                })
                .collect();
            if mismatched.is_empty() {
                println!("    ✅ Interval labels match their periods");
            } else {
                for (period, label) in &mismatched {
                    println!("    ❌ period {} labelled {}", period, label);
                }
                total_issues += mismatched.len();
            }
        }

        // Fine-grained tables carry many rows per period
        let fine = has(ingest_core::store::TIMESTAMP_COLUMN);
        let mut incomplete = 0;
        for day in store.day_coverage(&table)? {
            let Ok(date) = NaiveDate::parse_from_str(&day.trade_date, ingest_core::store::DATE_FORMAT)
            else {
                println!("    ❌ unparseable trade_date {}", day.trade_date);
                total_issues += 1;
                continue;
            };
            let expected = expected_periods(basis, date);
            if day.periods < expected {
                incomplete += 1;
                println!(
                    "    ⚠️  {}: {}/{} periods, {} rows",
                    day.trade_date, day.periods, expected, day.rows
                );
            } else if !fine && day.rows % day.periods != 0 {
                println!(
                    "    ⚠️  {}: {} rows spread unevenly over {} periods",
                    day.trade_date, day.rows, day.periods
                );
            }
        }
        if incomplete == 0 {
            println!("    ✅ Every stored day covers all periods");
        }
        total_issues += incomplete;
    }

    println!("\n{}", "=".repeat(60));
    if total_issues == 0 {
        println!("✅ No issues found");
    } else {
        println!("⚠️  {} issues found", total_issues);
    }
    Ok(total_issues)
}

fn print_usage() {
    println!("🚀 Market Data Ingest");
    println!("{}", "=".repeat(60));
    println!("  --extract <downloads> [inbox]   unpack archives into per-feed inbox folders");
    println!("  --process <inbox> [db]          ingest every dated document in the inbox");
    println!("  --verify [db]                   check stored days for missing periods");
    println!("  --dry-run                       with --process: parse and report, write nothing");
    println!("\nINGEST_FEEDS=<file> overrides the built-in feed catalog.");
}

fn arg_after(args: &[String], flag: &str, offset: usize) -> Option<PathBuf> {
    let at = args.iter().position(|a| a == flag)?;
    args.get(at + offset)
        .filter(|a| !a.starts_with("--"))
        .map(PathBuf::from)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build_global()?;

    let args: Vec<String> = std::env::args().collect();
    let catalog = load_catalog()?;

    if args.iter().any(|arg| arg == "--extract") {
        let downloads = arg_after(&args, "--extract", 1).unwrap_or_else(|| PathBuf::from("downloads"));
        let inbox = arg_after(&args, "--extract", 2).unwrap_or_else(|| PathBuf::from("inbox"));
        println!("📦 Extracting archives with {} threads", rayon::current_num_threads());
        archive_extractor::extract_downloads(downloads, inbox, &catalog)?;
    } else if args.iter().any(|arg| arg == "--process") {
        let inbox = arg_after(&args, "--process", 1).unwrap_or_else(|| PathBuf::from("inbox"));
        let db = arg_after(&args, "--process", 2).unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
        let dry_run = args.iter().any(|arg| arg == "--dry-run");

        let start = std::time::Instant::now();
        let mut store = SqliteStore::open(&db)?;
        let processor = inbox_processor::InboxProcessor::new(inbox, catalog)?.dry_run(dry_run);
        let reports = processor.process_all(&mut store)?;

        let failed = reports.iter().filter(|r| r.is_failure()).count();
        println!("\n✅ Processing complete in {:?}!", start.elapsed());
        if failed > 0 {
            anyhow::bail!("{} of {} feeds reported failures", failed, reports.len());
        }
    } else if args.iter().any(|arg| arg == "--verify") {
        let db = arg_after(&args, "--verify", 1).unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
        let issues = verify_store(&db, &catalog.time_basis()?)?;
        if issues > 0 {
            std::process::exit(1);
        }
    } else {
        print_usage();
    }

    Ok(())
}
