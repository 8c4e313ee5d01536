use crate::models::{AggregatedInterval, ColumnStats, FineRow};
use crate::time_basis::Period;
use chrono::NaiveDate;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Rolls sub-15-minute rows up into quarter-hour mean, median and last value.
pub struct AggregationEngine {
    width: usize,
}

impl AggregationEngine {
    pub fn new(width: usize) -> Self {
        Self { width }
    }

    pub fn aggregate(&self, rows: &[FineRow]) -> Vec<AggregatedInterval> {
        let mut by_date: BTreeMap<NaiveDate, Vec<&FineRow>> = BTreeMap::new();
        for row in rows {
            by_date.entry(row.trade_date()).or_default().push(row);
        }

        let mut intervals: Vec<AggregatedInterval> = by_date
            .into_par_iter()
            .flat_map_iter(|(date, day)| self.aggregate_day(date, day))
            .collect();
        intervals.sort_by_key(|i| (i.trade_date, i.period));
        intervals
    }

    fn aggregate_day(&self, date: NaiveDate, day: Vec<&FineRow>) -> Vec<AggregatedInterval> {
        let mut buckets: BTreeMap<Period, Vec<&FineRow>> = BTreeMap::new();
        for row in day {
            buckets.entry(row.period()).or_default().push(row);
        }

        buckets
            .into_iter()
            .map(|(period, mut bucket)| {
                // Stable: equal timestamps keep input order, so the later row counts as last
                bucket.sort_by_key(|row| row.timestamp);
                AggregatedInterval {
                    trade_date: date,
                    period,
                    time_interval: period.label(),
                    stats: (0..self.width)
                        .map(|column| column_stats(&bucket, column))
                        .collect(),
                }
            })
            .collect()
    }
}

fn column_stats(bucket: &[&FineRow], column: usize) -> ColumnStats {
    let mut values: Vec<f64> = bucket
        .iter()
        .filter_map(|row| row.values.get(column).copied().flatten())
        .collect();
    if values.is_empty() {
        return ColumnStats::default();
    }

    let last = values.last().copied();
    let mean = values.iter().sum::<f64>() / values.len() as f64;

    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    let median = if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    };

    ColumnStats {
        mean: Some(mean),
        median: Some(median),
        last,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn row(ts: NaiveDateTime, value: Option<f64>) -> FineRow {
        FineRow {
            timestamp: ts,
            values: vec![value],
        }
    }

    #[test]
    fn test_mean_median_last() {
        let rows = vec![
            row(at(4, 0, 0), Some(10.0)),
            row(at(4, 0, 1), Some(20.0)),
            row(at(4, 0, 2), Some(30.0)),
        ];
        let out = AggregationEngine::new(1).aggregate(&rows);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].time_interval, "00:00-00:15");
        assert_eq!(
            out[0].stats[0],
            ColumnStats {
                mean: Some(20.0),
                median: Some(20.0),
                last: Some(30.0)
            }
        );
    }

    #[test]
    fn test_even_count_median_and_unordered_input() {
        let rows = vec![
            row(at(4, 10, 14), Some(4.0)),
            row(at(4, 10, 0), Some(1.0)),
            row(at(4, 10, 5), Some(2.0)),
            row(at(4, 10, 7), Some(10.0)),
            row(at(4, 10, 9), None),
        ];
        let out = AggregationEngine::new(1).aggregate(&rows);
        let stats = out[0].stats[0];
        assert_eq!(stats.median, Some(3.0));
        assert_eq!(stats.mean, Some(4.25));
        assert_eq!(stats.last, Some(4.0));
    }

    #[test]
    fn test_last_skips_trailing_nulls() {
        let rows = vec![row(at(4, 23, 45), Some(-5.0)), row(at(4, 23, 59), None)];
        let out = AggregationEngine::new(1).aggregate(&rows);
        assert_eq!(out[0].period.get(), 96);
        assert_eq!(out[0].time_interval, "23:45-00:00");
        assert_eq!(out[0].stats[0].last, Some(-5.0));
    }

    #[test]
    fn test_empty_and_null_buckets() {
        let rows = vec![
            row(at(4, 0, 0), Some(1.0)),
            row(at(4, 0, 30), None),
            row(at(5, 0, 0), Some(2.0)),
        ];
        let out = AggregationEngine::new(1).aggregate(&rows);
        // 00:15 bucket had no rows and is not emitted
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].period.get(), 3);
        assert_eq!(out[1].stats[0], ColumnStats::default());
        assert_eq!(out[2].trade_date, NaiveDate::from_ymd_opt(2026, 1, 5).unwrap());
        assert!(AggregationEngine::new(1).aggregate(&[]).is_empty());
    }
}
