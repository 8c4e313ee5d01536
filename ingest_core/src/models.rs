use crate::time_basis::Period;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One declared sample of a position-indexed sub-series.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPoint {
    pub position: u32, // 1-based
    pub value: Option<f64>,
    pub category: Option<String>,
    /// Component values keyed by sub code, e.g. `A01` of a `Financial_Price`.
    pub components: Vec<(String, f64)>,
}

/// A contiguous span of uniform sampling.
#[derive(Debug, Clone)]
pub struct SourcePeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resolution_minutes: u32,
    pub points: Vec<RawPoint>,
}

impl SourcePeriod {
    /// Number of positions implied by the span.
    pub fn slot_count(&self) -> u32 {
        ((self.end - self.start).num_minutes() / self.resolution_minutes as i64).max(0) as u32
    }

    pub fn is_aligned(&self) -> bool {
        (self.end - self.start).num_minutes() % self.resolution_minutes as i64 == 0
    }

    pub fn position_start(&self, position: u32) -> DateTime<Utc> {
        self.start + Duration::minutes(((position - 1) * self.resolution_minutes) as i64)
    }
}

/// The parser triple: one value for one field code at one local timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub timestamp: NaiveDateTime,
    pub field_code: String,
    pub value: Option<f64>,
    pub resolution_minutes: u32,
    /// Source record ordinal; observations sharing it came from one row or position.
    pub record: u64,
}

/// Natural unique key of a quarter-hour row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NormalizedKey {
    pub trade_date: NaiveDate,
    pub period: Period,
    pub area_id: Option<i32>,
    pub country_code: Option<String>,
}

impl NormalizedKey {
    pub fn new(trade_date: NaiveDate, period: Period, area: &AreaContext) -> Self {
        Self {
            trade_date,
            period,
            area_id: area.area_id,
            country_code: area.country_code.clone(),
        }
    }

    pub fn time_interval(&self) -> String {
        self.period.label()
    }
}

/// Area dimension attached to a run; empty for feeds not keyed by area.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AreaContext {
    pub area_id: Option<i32>,
    pub country_code: Option<String>,
    pub label: Option<String>,
}

impl AreaContext {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn describe(&self) -> String {
        match (&self.label, self.area_id) {
            (Some(label), Some(id)) => format!("{} (area_id={})", label, id),
            (None, Some(id)) => format!("area_id={}", id),
            _ => "all".to_string(),
        }
    }
}

/// One quarter-hour record; `values` follows the feed schema's column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WideRow {
    pub key: NormalizedKey,
    pub time_interval: String,
    pub values: Vec<Option<f64>>,
}

impl WideRow {
    pub fn empty(key: NormalizedKey, width: usize) -> Self {
        Self {
            time_interval: key.time_interval(),
            key,
            values: vec![None; width],
        }
    }
}

/// A sub-15-minute record keyed by its local, minute-truncated timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FineRow {
    pub timestamp: NaiveDateTime,
    pub values: Vec<Option<f64>>,
}

impl FineRow {
    pub fn trade_date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    pub fn period(&self) -> Period {
        Period::of(self.timestamp)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ColumnStats {
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub last: Option<f64>,
}

/// 15-minute statistics derived from the fine rows of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedInterval {
    pub trade_date: NaiveDate,
    pub period: Period,
    pub time_interval: String,
    pub stats: Vec<ColumnStats>,
}
