//! Document parsers: one document in, a flat list of observations out.

pub mod delimited;
pub mod position_series;

use crate::error::{IngestError, Result};
use crate::feed_config::{Feed, ShapeConfig};
use crate::models::Observation;
use crate::time_basis::TimeBasis;
use chrono::NaiveDate;

pub use delimited::DelimitedParser;
pub use position_series::PositionSeriesParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentShape {
    PositionSeries,
    Delimited,
}

/// A raw payload as delivered by a document source.
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub bytes: Vec<u8>,
    /// Date the payload was requested for; checked against a declared date when present.
    pub expected_date: Option<NaiveDate>,
}

impl Document {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
            expected_date: None,
        }
    }

    pub fn expecting(mut self, date: NaiveDate) -> Self {
        self.expected_date = Some(date);
        self
    }

    /// Payload as UTF-8 with any byte order mark removed.
    pub fn text(&self) -> Result<&str> {
        let text = std::str::from_utf8(&self.bytes)
            .map_err(|e| IngestError::structure(&self.name, format!("not UTF-8 text: {}", e)))?;
        Ok(text.trim_start_matches('\u{feff}'))
    }

    pub fn shape(&self) -> Option<DocumentShape> {
        detect_shape(&self.bytes)
    }
}

/// Classifies raw bytes as XML or delimited text; `None` for an empty payload.
pub fn detect_shape(bytes: &[u8]) -> Option<DocumentShape> {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    let first = bytes.iter().find(|b| !b.is_ascii_whitespace())?;
    if *first == b'<' {
        Some(DocumentShape::PositionSeries)
    } else {
        Some(DocumentShape::Delimited)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub observations: Vec<Observation>,
    pub skipped_rows: usize,
    pub declared_date: Option<NaiveDate>,
}

impl ParseOutcome {
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

pub trait SeriesParser {
    fn parse(&self, doc: &Document, basis: &TimeBasis) -> Result<ParseOutcome>;
}

/// Parser bound to the shape declared for `feed`.
pub fn parser_for(feed: &Feed) -> Box<dyn SeriesParser + '_> {
    match &feed.config.shape {
        ShapeConfig::PositionSeries(shape) => Box::new(PositionSeriesParser::new(shape)),
        ShapeConfig::Delimited(shape) => Box::new(DelimitedParser::new(
            shape,
            feed.config.native_resolution_minutes,
        )),
    }
}

/// Rejects payloads whose shape disagrees with the declared one.
pub(crate) fn expect_shape(doc: &Document, expected: DocumentShape) -> Result<()> {
    match doc.shape() {
        None => Err(IngestError::structure(&doc.name, "empty document")),
        Some(shape) if shape != expected => Err(IngestError::structure(
            &doc.name,
            format!("expected {:?} content, found {:?}", expected, shape),
        )),
        Some(_) => Ok(()),
    }
}
