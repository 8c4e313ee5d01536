use crate::error::{IngestError, Result};
use crate::feed_config::Feed;
use crate::models::AreaContext;
use crate::parser::Document;
use crate::time_basis::TimeBasis;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use glob::Pattern;
use log::{debug, info};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use zip::ZipArchive;

/// Half-open UTC interval `[start, end)` requested from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(IngestError::Config(format!(
                "empty fetch window {} .. {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Local calendar day `date` expressed in UTC.
    pub fn local_day(basis: &TimeBasis, date: NaiveDate) -> Result<Self> {
        Self::local_days(basis, date, date)
    }

    /// Local days `from..=to` expressed in UTC.
    pub fn local_days(basis: &TimeBasis, from: NaiveDate, to: NaiveDate) -> Result<Self> {
        let next = to + Duration::days(1);
        match (basis.day_start_utc(from), basis.day_start_utc(next)) {
            (Some(start), Some(end)) => Self::new(start, end),
            _ => Err(IngestError::Config(format!(
                "local midnight of {} or {} does not exist",
                from, next
            ))),
        }
    }

    pub fn local_start_date(&self, basis: &TimeBasis) -> NaiveDate {
        basis.local_date(self.start)
    }

    /// One window per local day touched, clipped to this window.
    pub fn split_local_days(&self, basis: &TimeBasis) -> Vec<(NaiveDate, FetchWindow)> {
        let last = basis.local_date(self.end - Duration::seconds(1));
        let mut date = basis.local_date(self.start);
        let mut days = Vec::new();
        while date <= last {
            let next = date + Duration::days(1);
            let start = basis.day_start_utc(date).unwrap_or(self.start).max(self.start);
            let end = basis.day_start_utc(next).unwrap_or(self.end).min(self.end);
            if start < end {
                days.push((date, FetchWindow { start, end }));
            }
            date = next;
        }
        days
    }
}

/// One document to fetch: a window, the area it covers and an optional feed variant.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRequest {
    pub window: FetchWindow,
    pub area: AreaContext,
    pub variant: Option<String>,
}

impl DocumentRequest {
    pub fn new(window: FetchWindow, area: AreaContext) -> Self {
        Self {
            window,
            area,
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: &str) -> Self {
        self.variant = Some(variant.to_string());
        self
    }

    pub fn describe(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{} {}", self.area.describe(), variant),
            None => self.area.describe(),
        }
    }
}

/// Pull interface over wherever documents come from.
pub trait DocumentSource {
    fn fetch_document(&self, feed: &Feed, request: &DocumentRequest) -> Result<Document>;
}

/// Documents previously downloaded to `<root>/<feed name>/`.
pub struct DirectorySource {
    root: PathBuf,
    basis: TimeBasis,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>, basis: TimeBasis) -> Self {
        Self {
            root: root.into(),
            basis,
        }
    }

    fn pattern_for(&self, feed: &Feed, date: NaiveDate, request: &DocumentRequest) -> Result<String> {
        let dir = self.root.join(feed.name());
        let dir = dir.to_str().ok_or_else(|| {
            IngestError::Config(format!("non UTF-8 input path {}", dir.display()))
        })?;
        let fill = |value: Option<&str>| value.map(Pattern::escape).unwrap_or_else(|| "*".to_string());
        let name = feed
            .config
            .file_pattern
            .replace("{date}", &date.format("%Y%m%d").to_string())
            .replace("{area}", &fill(request.area.label.as_deref()))
            .replace("{variant}", &fill(request.variant.as_deref()));
        Ok(format!("{}/{}", Pattern::escape(dir), name))
    }
}

impl DocumentSource for DirectorySource {
    fn fetch_document(&self, feed: &Feed, request: &DocumentRequest) -> Result<Document> {
        let date = request.window.local_start_date(&self.basis);
        let pattern = self.pattern_for(feed, date, request)?;

        let mut matches: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| IngestError::Config(format!("bad file pattern {}: {}", pattern, e)))?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect();
        matches.sort();
        debug!("{} files match {}", matches.len(), pattern);

        // Later downloads sort last and supersede earlier ones
        let path = matches.pop().ok_or_else(|| {
            IngestError::fetch(
                feed.name(),
                format!("no document for {} ({})", date, request.describe()),
            )
        })?;

        let mut document = read_document(&path)?;
        if feed.config.daily_documents {
            document.expected_date = Some(date);
        }
        info!("Fetched {} ({} bytes)", document.name, document.bytes.len());
        Ok(document)
    }
}

/// Reads a payload from disk, unpacking the first XML or CSV entry of a ZIP archive.
pub fn read_document(path: &Path) -> Result<Document> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let is_zip = path
        .extension()
        .and_then(|s| s.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("zip"));

    if !is_zip {
        return Ok(Document::new(name, fs::read(path)?));
    }

    let mut archive = ZipArchive::new(fs::File::open(path)?)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let entry_name = entry.name().to_string();
        let lower = entry_name.to_ascii_lowercase();
        if entry.is_file() && (lower.ends_with(".xml") || lower.ends_with(".csv")) {
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            return Ok(Document::new(format!("{}!{}", name, entry_name), bytes));
        }
    }
    Err(IngestError::fetch(
        name,
        "archive holds no .xml or .csv entry",
    ))
}
