//! Error types for the ingestion pipeline.

use chrono::NaiveDate;
use thiserror::Error;

/// Errors raised while fetching, parsing or persisting market documents.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The document's shape could not be recognized; fatal for that document.
    #[error("unrecognized structure in {document}: {reason}")]
    Structure { document: String, reason: String },

    /// A single row or point could not be read; counted and skipped by parsers.
    #[error("bad row {row} in {document}: {reason}")]
    Row {
        document: String,
        row: usize,
        reason: String,
    },

    /// The payload declares a different date than the one requested.
    #[error("{document} declares {declared}, expected {expected}")]
    DateMismatch {
        document: String,
        expected: NaiveDate,
        declared: NaiveDate,
    },

    /// The document source could not deliver a document.
    #[error("fetch failed for {feed}: {reason}")]
    Fetch { feed: String, reason: String },

    /// A batch write failed and was rolled back.
    #[error("write to {table} failed: {source}")]
    Persist {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Invalid feed catalog or runtime configuration
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IngestError {
    pub fn structure(document: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Structure {
            document: document.into(),
            reason: reason.into(),
        }
    }

    pub fn fetch(feed: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            feed: feed.into(),
            reason: reason.into(),
        }
    }

    /// Document-level failures: the document is dropped, the run continues.
    pub fn is_document_failure(&self) -> bool {
        matches!(self, Self::Structure { .. })
    }

    /// Failures that count as "nothing was delivered" rather than a bad document.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. } | Self::DateMismatch { .. } | Self::Io(_) | Self::Zip(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        let structural = IngestError::structure("a.xml", "no TimeSeries");
        assert!(structural.is_document_failure());
        assert!(!structural.is_fetch_failure());

        let mismatch = IngestError::DateMismatch {
            document: "b.csv".to_string(),
            expected: NaiveDate::from_ymd_opt(2026, 1, 4).unwrap(),
            declared: NaiveDate::from_ymd_opt(2026, 1, 3).unwrap(),
        };
        assert!(mismatch.is_fetch_failure());
        assert!(!mismatch.is_document_failure());
        assert_eq!(
            mismatch.to_string(),
            "b.csv declares 2026-01-03, expected 2026-01-04"
        );
    }
}
