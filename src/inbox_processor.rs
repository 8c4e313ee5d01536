use anyhow::{Context, Result};
use chrono::NaiveDate;
use glob::{glob, Pattern};
use indicatif::{ProgressBar, ProgressStyle};
use ingest_core::{
    DirectorySource, Feed, FeedCatalog, FetchWindow, IngestionRun, RunOptions, RunReport,
    SqliteStore,
};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Ingests every dated document waiting in `<inbox>/<feed name>/`, one local day at a time.
pub struct InboxProcessor {
    inbox_dir: PathBuf,
    catalog: FeedCatalog,
    dry_run: bool,
    date_pattern: Regex,
}

impl InboxProcessor {
    pub fn new(inbox_dir: PathBuf, catalog: FeedCatalog) -> Result<Self> {
        Ok(Self {
            inbox_dir,
            catalog,
            dry_run: false,
            date_pattern: Regex::new(r"(\d{8})")?,
        })
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn process_all(&self, store: &mut SqliteStore) -> Result<Vec<RunReport>> {
        println!("🚀 Market Data Inbox Processor");
        println!("Inbox: {}", self.inbox_dir.display());
        if self.dry_run {
            println!("Mode: dry run, nothing is written");
        }
        println!("{}", "=".repeat(60));

        let basis = self.catalog.time_basis()?;
        let source = DirectorySource::new(self.inbox_dir.clone(), basis.clone());
        let mut reports = Vec::new();

        for feed in self.catalog.feeds() {
            let dates = self.pending_dates(feed)?;
            if dates.is_empty() {
                println!("\n⏭️  {}: no documents", feed.name());
                continue;
            }
            println!(
                "\n📅 {}: {} days ({} .. {})",
                feed.name(),
                dates.len(),
                dates[0],
                dates[dates.len() - 1]
            );

            let options = RunOptions {
                dry_run: self.dry_run,
                areas: None,
            };
            let mut run = IngestionRun::new(&self.catalog, feed.name(), &source, &mut *store, options)
                .with_context(|| format!("Failed to prepare feed {}", feed.name()))?;

            let pb = ProgressBar::new(dates.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?,
            );

            let mut total = RunReport::default();
            for date in dates {
                pb.set_message(date.to_string());
                let window = FetchWindow::local_day(&basis, date)?;
                total.absorb(run.execute(&window));
                pb.inc(1);
            }
            pb.finish_and_clear();

            print_feed_summary(&total);
            reports.push(total);
        }

        Ok(reports)
    }

    /// Local dates named by the documents of one feed, oldest first.
    pub fn pending_dates(&self, feed: &Feed) -> Result<Vec<NaiveDate>> {
        let dir = self.inbox_dir.join(feed.name());
        let pattern = format!("{}/*", Pattern::escape(&dir.to_string_lossy()));

        let mut dates = BTreeSet::new();
        for path in glob(&pattern)?.filter_map(Result::ok) {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(date) = self.extract_date(name) {
                dates.insert(date);
            }
        }
        Ok(dates.into_iter().collect())
    }

    fn extract_date(&self, file_name: &str) -> Option<NaiveDate> {
        self.date_pattern
            .captures_iter(file_name)
            .filter_map(|caps| NaiveDate::parse_from_str(&caps[1], "%Y%m%d").ok())
            .next()
    }
}

fn print_feed_summary(report: &RunReport) {
    let marker = if report.is_failure() { "❌" } else { "✅" };
    println!(
        "  {} {} documents, {} observations, {} rows, {} intervals",
        marker, report.documents, report.observations, report.rows_written, report.intervals_written
    );
    if report.skipped_rows > 0 || report.unmapped > 0 || report.duplicates > 0 {
        println!(
            "  ⚠️  skipped rows: {}, unmapped codes: {}, duplicates collapsed: {}",
            report.skipped_rows, report.unmapped, report.duplicates
        );
    }
    if report.superseded > 0 || report.out_of_window > 0 {
        println!(
            "  ℹ️  superseded values: {}, outside requested days: {}",
            report.superseded, report.out_of_window
        );
    }
    if !report.fetch_failures.is_empty() {
        println!("  ⚠️  {} requests found no usable document", report.fetch_failures.len());
    }
    for failure in &report.document_failures {
        println!("  ❌ {}", failure);
    }
    if let Some(failure) = &report.persist_failure {
        println!("  ❌ write failed: {}", failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_pending_dates_are_sorted_and_unique() {
        let inbox = TempDir::new().unwrap();
        let dir = inbox.path().join("ceps_imbalance");
        fs::create_dir_all(&dir).unwrap();
        for name in [
            "data_AktualniSystemovaOdchylkaCR_20260105.csv",
            "data_AktualniSystemovaOdchylkaCR_20260104.csv",
            "data_AktualniSystemovaOdchylkaCR_20260104_retry.csv",
            "data_AktualniSystemovaOdchylkaCR_latest.csv",
            "data_AktualniSystemovaOdchylkaCR_20261399.csv",
        ] {
            fs::write(dir.join(name), "x").unwrap();
        }

        let catalog = FeedCatalog::embedded().unwrap();
        let processor = InboxProcessor::new(inbox.path().to_path_buf(), catalog.clone()).unwrap();
        let dates = processor
            .pending_dates(catalog.feed("ceps_imbalance").unwrap())
            .unwrap();

        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2026, 1, 4).unwrap(),
                NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            ]
        );
    }

    #[test]
    fn test_processes_one_day_of_minutes() {
        let inbox = TempDir::new().unwrap();
        let dir = inbox.path().join("ceps_imbalance");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("data_AktualniSystemovaOdchylkaCR_20260104.csv"),
            "Verze dat;Od;Do;Agregační funkce;Agregace;\n\
             ;04.01.2026 00:00:00;04.01.2026 23:59:59;agregace průměr;minuta;\n\
             Datum;Aktuální odchylka [MW];\n\
             04.01.2026 00:00;-160.5;\n\
             04.01.2026 00:01;-150.5;\n",
        )
        .unwrap();

        let processor =
            InboxProcessor::new(inbox.path().to_path_buf(), FeedCatalog::embedded().unwrap()).unwrap();
        let mut store = SqliteStore::open_in_memory().unwrap();
        let reports = processor.process_all(&mut store).unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].feed, "ceps_imbalance");
        assert_eq!(reports[0].rows_written, 2);
        assert_eq!(reports[0].intervals_written, 1);
        assert!(!reports[0].is_failure());
        assert_eq!(store.count_rows("ceps_actual_imbalance_1min").unwrap(), 2);
    }
}
