use crate::aggregation::AggregationEngine;
use crate::assembler::{AssembledRows, WideAssembler};
use crate::dedup::{dedup_last_wins, Deduplicator};
use crate::error::{IngestError, Result};
use crate::feed_config::{Feed, FeedCatalog};
use crate::models::{AreaContext, FineRow};
use crate::parser::{parser_for, Document};
use crate::source::{DocumentRequest, DocumentSource, FetchWindow};
use crate::store::RowStore;
use crate::time_basis::TimeBasis;
use crate::upsert::UpsertWriter;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;

pub const DEFAULT_CHUNK_DAYS: u32 = 7;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Restrict area-keyed feeds to these area ids.
    pub areas: Option<Vec<i32>>,
}

/// Counters and failures of one run; failures never abort the remaining documents.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub feed: String,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub documents: usize,
    pub observations: usize,
    pub skipped_rows: usize,
    pub unmapped: usize,
    /// Values dropped for a finer resolution or a preferred code.
    pub superseded: usize,
    /// Observations outside the local day they were requested for.
    pub out_of_window: usize,
    pub duplicates: usize,
    pub rows_written: usize,
    pub intervals_written: usize,
    pub fetch_failures: Vec<String>,
    pub document_failures: Vec<String>,
    pub persist_failure: Option<String>,
}

impl RunReport {
    /// Only structurally broken documents and failed writes make a run fail.
    pub fn is_failure(&self) -> bool {
        !self.document_failures.is_empty() || self.persist_failure.is_some()
    }

    /// Folds a chunk report into a running total.
    pub fn absorb(&mut self, other: RunReport) {
        if self.feed.is_empty() {
            self.feed = other.feed;
        }
        self.window_start = match (self.window_start, other.window_start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.window_end = match (self.window_end, other.window_end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.dry_run |= other.dry_run;
        self.documents += other.documents;
        self.observations += other.observations;
        self.skipped_rows += other.skipped_rows;
        self.unmapped += other.unmapped;
        self.superseded += other.superseded;
        self.out_of_window += other.out_of_window;
        self.duplicates += other.duplicates;
        self.rows_written += other.rows_written;
        self.intervals_written += other.intervals_written;
        self.fetch_failures.extend(other.fetch_failures);
        self.document_failures.extend(other.document_failures);
        if self.persist_failure.is_none() {
            self.persist_failure = other.persist_failure;
        }
    }
}

/// One feed, one fetch window: fetch, parse, assemble, dedup, aggregate, upsert.
pub struct IngestionRun<'a> {
    feed: &'a Feed,
    areas: Vec<AreaContext>,
    basis: TimeBasis,
    source: &'a dyn DocumentSource,
    writer: UpsertWriter<'a>,
}

impl<'a> IngestionRun<'a> {
    pub fn new(
        catalog: &'a FeedCatalog,
        feed_name: &str,
        source: &'a dyn DocumentSource,
        store: &'a mut dyn RowStore,
        options: RunOptions,
    ) -> Result<Self> {
        let feed = catalog.feed(feed_name)?;
        let areas = catalog.area_contexts(feed, options.areas.as_deref());
        if areas.is_empty() {
            return Err(IngestError::Config(format!(
                "no configured area matches {:?} for feed {}",
                options.areas.unwrap_or_default(),
                feed.name()
            )));
        }
        let mut writer = UpsertWriter::new(store, options.dry_run);
        writer.ensure_tables(feed)?;
        Ok(Self {
            feed,
            areas,
            basis: catalog.time_basis()?,
            source,
            writer,
        })
    }

    pub fn execute(&mut self, window: &FetchWindow) -> RunReport {
        let mut report = RunReport {
            feed: self.feed.name().to_string(),
            window_start: Some(window.start),
            window_end: Some(window.end),
            dry_run: self.writer.is_dry_run(),
            ..Default::default()
        };
        info!(
            "Running {} for {} .. {}",
            self.feed.name(),
            window.start,
            window.end
        );

        // Documents are stored one per local day, so every day gets its own request
        let days = window.split_local_days(&self.basis);

        let mut quarter_rows = Vec::new();
        let mut fine_rows = Vec::new();
        for area in &self.areas {
            let mut assembler = WideAssembler::new(self.feed);
            for (date, day) in &days {
                for request in self.requests_for(*day, area) {
                    if let Some(doc) = self.fetch(&request, &mut report) {
                        self.parse_into(&doc, *date, area, &mut assembler, &mut report);
                    }
                }
            }
            report.unmapped += assembler.unmapped();
            report.superseded += assembler.superseded();
            match assembler.finish() {
                AssembledRows::Quarter(rows) => quarter_rows.extend(rows),
                AssembledRows::Fine(rows) => fine_rows.extend(rows),
            }
        }

        let outcome = if self.feed.is_fine_grained() {
            self.persist_fine(fine_rows, &mut report)
        } else {
            let deduped = Deduplicator::collapse(quarter_rows);
            report.duplicates += deduped.duplicates;
            self.writer
                .write_wide(self.feed, &deduped.rows)
                .map(|n| report.rows_written += n)
        };
        if let Err(e) = outcome {
            error!("{}: {}", self.feed.name(), e);
            report.persist_failure = Some(e.to_string());
        }

        info!(
            "{}: {} documents, {} observations, {} rows written, {} intervals aggregated",
            self.feed.name(),
            report.documents,
            report.observations,
            report.rows_written,
            report.intervals_written
        );
        report
    }

    /// Runs windows one after another; a failing chunk does not stop later ones.
    pub fn run_backfill(
        &mut self,
        windows: &[FetchWindow],
        pause: std::time::Duration,
    ) -> Vec<RunReport> {
        let mut reports = Vec::with_capacity(windows.len());
        for (i, window) in windows.iter().enumerate() {
            info!("Backfill chunk {}/{}", i + 1, windows.len());
            let report = self.execute(window);
            if report.is_failure() {
                warn!("Chunk {}/{} failed, continuing", i + 1, windows.len());
            }
            reports.push(report);
            if i + 1 < windows.len() && !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }
        reports
    }

    fn requests_for(&self, window: FetchWindow, area: &AreaContext) -> Vec<DocumentRequest> {
        let base = DocumentRequest::new(window, area.clone());
        if self.feed.config.variants.is_empty() {
            return vec![base];
        }
        self.feed
            .config
            .variants
            .iter()
            .map(|variant| base.clone().with_variant(variant))
            .collect()
    }

    fn fetch(&self, request: &DocumentRequest, report: &mut RunReport) -> Option<Document> {
        match self.source.fetch_document(self.feed, request) {
            Ok(doc) => Some(doc),
            Err(e) if e.is_fetch_failure() => {
                warn!("{} [{}]: {}", self.feed.name(), request.describe(), e);
                report.fetch_failures.push(e.to_string());
                None
            }
            Err(e) => {
                error!("{} [{}]: {}", self.feed.name(), request.describe(), e);
                report.document_failures.push(e.to_string());
                None
            }
        }
    }

    fn parse_into(
        &self,
        doc: &Document,
        date: NaiveDate,
        area: &AreaContext,
        assembler: &mut WideAssembler,
        report: &mut RunReport,
    ) {
        match parser_for(self.feed).parse(doc, &self.basis) {
            Ok(mut outcome) => {
                let parsed = outcome.observations.len();
                outcome.observations.retain(|o| o.timestamp.date() == date);
                let outside = parsed - outcome.observations.len();
                if outside > 0 {
                    debug!("{}: {} observations fall outside {}", doc.name, outside, date);
                }
                report.out_of_window += outside;
                report.documents += 1;
                report.observations += outcome.observations.len();
                report.skipped_rows += outcome.skipped_rows;
                if outcome.is_empty() {
                    warn!("{}: no data", doc.name);
                }
                assembler.begin_document();
                assembler.extend(&outcome.observations, area);
            }
            // Wrong-date payloads count as "nothing delivered"
            Err(e) if e.is_fetch_failure() => {
                warn!("Discarding {}: {}", doc.name, e);
                report.fetch_failures.push(e.to_string());
            }
            Err(e) => {
                error!("{}", e);
                report.document_failures.push(e.to_string());
            }
        }
    }

    fn persist_fine(&mut self, rows: Vec<FineRow>, report: &mut RunReport) -> Result<()> {
        let deduped = Deduplicator::collapse(rows);
        report.duplicates += deduped.duplicates;
        let mut rows = deduped.rows;
        rows.sort_by_key(|r| r.timestamp);

        if !self.feed.config.aggregate_15min {
            report.rows_written += self.writer.write_fine(self.feed, &rows)?;
            return Ok(());
        }

        // Statistics cover everything stored for a touched date with this run's rows laid over it
        let touched: BTreeSet<NaiveDate> = rows.iter().map(FineRow::trade_date).collect();
        let mut day_rows = Vec::new();
        for date in touched {
            day_rows.extend(self.writer.stored_fine_rows(self.feed, date)?);
        }
        day_rows.extend(rows.iter().cloned());
        let day_rows = dedup_last_wins(day_rows, |r: &FineRow| r.timestamp).rows;
        let intervals = AggregationEngine::new(self.feed.schema.width()).aggregate(&day_rows);

        let (minutes, quarters) = self
            .writer
            .write_fine_with_aggregates(self.feed, &rows, &intervals)?;
        report.rows_written += minutes;
        report.intervals_written += quarters;
        Ok(())
    }
}

/// Consecutive windows of `chunk_days` local days covering `start..=end`.
pub fn chunk_windows(
    basis: &TimeBasis,
    start: NaiveDate,
    end: NaiveDate,
    chunk_days: u32,
) -> Result<Vec<FetchWindow>> {
    if chunk_days == 0 {
        return Err(IngestError::Config("chunk size must be at least one day".to_string()));
    }
    if end < start {
        return Err(IngestError::Config(format!("end {} precedes start {}", end, start)));
    }
    let mut windows = Vec::new();
    let mut from = start;
    while from <= end {
        let to = (from + Duration::days(chunk_days as i64 - 1)).min(end);
        windows.push(FetchWindow::local_days(basis, from, to)?);
        from = to + Duration::days(1);
    }
    Ok(windows)
}
