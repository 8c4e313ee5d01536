use super::{expect_shape, Document, DocumentShape, ParseOutcome, SeriesParser};
use crate::error::{IngestError, Result};
use crate::feed_config::{DelimitedShape, TimestampZone};
use crate::models::Observation;
use crate::time_basis::{truncate_to_minute, TimeBasis};
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use csv::{ReaderBuilder, Trim};
use log::{debug, warn};
use regex::Regex;
use std::sync::LazyLock;

static DECLARED_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{2})\.(\d{2})\.(\d{4})").expect("declared date regex"));

/// Parser for semicolon-style exports: metadata lines, one header row, then data rows.
pub struct DelimitedParser<'a> {
    shape: &'a DelimitedShape,
    resolution_minutes: u32,
}

impl<'a> DelimitedParser<'a> {
    pub fn new(shape: &'a DelimitedShape, resolution_minutes: u32) -> Self {
        Self {
            shape,
            resolution_minutes,
        }
    }

    fn parse_timestamp(&self, text: &str, basis: &TimeBasis) -> Option<NaiveDateTime> {
        let naive = NaiveDateTime::parse_from_str(text, &self.shape.timestamp_format).ok()?;
        let local = match self.shape.timestamp_zone {
            TimestampZone::Local => naive,
            TimestampZone::Utc => basis.to_local(Utc.from_utc_datetime(&naive)),
        };
        Some(truncate_to_minute(local))
    }

    fn parse_number(&self, text: &str) -> Option<f64> {
        parse_number(text, self.shape.decimal_separator, self.shape.thousands_separator)
    }
}

impl SeriesParser for DelimitedParser<'_> {
    fn parse(&self, doc: &Document, basis: &TimeBasis) -> Result<ParseOutcome> {
        expect_shape(doc, DocumentShape::Delimited)?;
        let text = doc.text()?;

        let (metadata, body) = split_metadata(text, self.shape.metadata_lines).ok_or_else(|| {
            IngestError::structure(
                &doc.name,
                format!("expected {} metadata lines", self.shape.metadata_lines),
            )
        })?;

        let mut outcome = ParseOutcome {
            declared_date: self
                .shape
                .declared_date_line
                .and_then(|line| metadata.get(line))
                .and_then(|line| extract_declared_date(line)),
            ..Default::default()
        };
        if let (Some(expected), Some(declared)) = (doc.expected_date, outcome.declared_date) {
            if expected != declared {
                return Err(IngestError::DateMismatch {
                    document: doc.name.clone(),
                    expected,
                    declared,
                });
            }
        }

        let mut reader = ReaderBuilder::new()
            .delimiter(self.shape.delimiter as u8)
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(body.as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| IngestError::structure(&doc.name, format!("unreadable header row: {}", e)))?
            .clone();
        if headers.iter().all(str::is_empty) {
            return Err(IngestError::structure(&doc.name, "missing header row"));
        }

        let ts_column = self.shape.timestamp_column;
        let value_columns: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(idx, name)| *idx != ts_column && !name.is_empty())
            .map(|(idx, name)| (idx, name.to_string()))
            .collect();
        let required = match value_columns.iter().map(|(idx, _)| *idx).max() {
            Some(last) => last.max(ts_column) + 1,
            None => {
                return Err(IngestError::structure(
                    &doc.name,
                    "header row names no value columns",
                ))
            }
        };

        for (ordinal, result) in reader.records().enumerate() {
            let line = self.shape.metadata_lines + ordinal + 2;
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    warn!("{} line {}: {}", doc.name, line, e);
                    outcome.skipped_rows += 1;
                    continue;
                }
            };
            if record.len() < required {
                debug!("{} line {}: {} of {} columns", doc.name, line, record.len(), required);
                outcome.skipped_rows += 1;
                continue;
            }
            let timestamp = match self.parse_timestamp(&record[ts_column], basis) {
                Some(ts) => ts,
                None => {
                    debug!("{} line {}: bad timestamp '{}'", doc.name, line, &record[ts_column]);
                    outcome.skipped_rows += 1;
                    continue;
                }
            };

            for (idx, name) in &value_columns {
                outcome.observations.push(Observation {
                    timestamp,
                    field_code: name.clone(),
                    value: self.parse_number(&record[*idx]),
                    resolution_minutes: self.resolution_minutes,
                    record: ordinal as u64,
                });
            }
        }

        if outcome.skipped_rows > 0 {
            warn!("{}: skipped {} rows", doc.name, outcome.skipped_rows);
        }
        Ok(outcome)
    }
}

fn split_metadata(text: &str, count: usize) -> Option<(Vec<&str>, &str)> {
    let mut rest = text;
    let mut lines = Vec::with_capacity(count);
    for _ in 0..count {
        let (line, tail) = rest.split_once('\n')?;
        lines.push(line.trim_end_matches('\r'));
        rest = tail;
    }
    Some((lines, rest))
}

/// First `dd.mm.yyyy` date found on a metadata line.
pub fn extract_declared_date(line: &str) -> Option<NaiveDate> {
    let caps = DECLARED_DATE.captures(line)?;
    NaiveDate::from_ymd_opt(
        caps[3].parse().ok()?,
        caps[2].parse().ok()?,
        caps[1].parse().ok()?,
    )
}

/// Empty or unreadable cells are `None`.
pub fn parse_number(text: &str, decimal: char, thousands: Option<char>) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let mut cleaned: String = match thousands {
        Some(sep) => text.chars().filter(|c| *c != sep && !c.is_whitespace()).collect(),
        None => text.to_string(),
    };
    if decimal != '.' {
        cleaned = cleaned.replace(decimal, ".");
    }
    cleaned.parse::<f64>().ok()
}
