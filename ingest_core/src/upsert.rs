use crate::error::Result;
use crate::feed_config::Feed;
use crate::models::{AggregatedInterval, FineRow, WideRow};
use crate::store::{
    CellValue, ColumnDef, RowStore, SqlType, TableSpec, DATE_FORMAT, TIMESTAMP_COLUMN,
    TIMESTAMP_FORMAT,
};
use chrono::NaiveDate;
use log::{info, warn};

const PERIOD_CHECK: &str = "period BETWEEN 1 AND 96";

/// Quarter-hour table: one row per `(trade_date, period[, area_id][, country_code])`.
pub fn quarter_table(feed: &Feed) -> TableSpec {
    let mut columns = vec![
        ColumnDef::key("trade_date", SqlType::Text),
        ColumnDef::key("period", SqlType::Integer).with_check(PERIOD_CHECK),
    ];
    let mut unique = vec!["trade_date".to_string(), "period".to_string()];
    if feed.config.keyed_by_area {
        columns.push(ColumnDef::key("area_id", SqlType::Integer));
        unique.push("area_id".to_string());
    }
    if feed.config.keyed_by_country {
        columns.push(ColumnDef::key("country_code", SqlType::Text));
        unique.push("country_code".to_string());
    }
    columns.push(ColumnDef::key("time_interval", SqlType::Text));
    columns.extend(feed.schema.column_names().iter().map(|c| ColumnDef::value(c)));

    TableSpec {
        name: feed.table().to_string(),
        columns,
        unique,
    }
}

/// Sub-15-minute table keyed by the local delivery timestamp.
pub fn fine_table(feed: &Feed) -> TableSpec {
    let mut columns = vec![
        ColumnDef::key(TIMESTAMP_COLUMN, SqlType::Text),
        ColumnDef::key("trade_date", SqlType::Text),
        ColumnDef::key("period", SqlType::Integer).with_check(PERIOD_CHECK),
        ColumnDef::key("time_interval", SqlType::Text),
    ];
    columns.extend(feed.schema.column_names().iter().map(|c| ColumnDef::value(c)));

    TableSpec {
        name: feed.table().to_string(),
        columns,
        unique: vec![TIMESTAMP_COLUMN.to_string()],
    }
}

/// 15-minute statistics table: `<column>_mean`, `<column>_median`, `<column>_last` per value column.
pub fn aggregated_table(feed: &Feed) -> TableSpec {
    let mut columns = vec![
        ColumnDef::key("trade_date", SqlType::Text),
        ColumnDef::key("time_interval", SqlType::Text),
        ColumnDef::key("period", SqlType::Integer).with_check(PERIOD_CHECK),
    ];
    for name in feed.schema.column_names() {
        for stat in ["mean", "median", "last"] {
            columns.push(ColumnDef::value(&format!("{}_{}", name, stat)));
        }
    }

    TableSpec {
        name: feed.aggregated_table(),
        columns,
        unique: vec!["trade_date".to_string(), "time_interval".to_string()],
    }
}

fn date_cell(date: NaiveDate) -> CellValue {
    CellValue::Text(date.format(DATE_FORMAT).to_string())
}

fn fine_batch(rows: &[FineRow]) -> Vec<Vec<CellValue>> {
    rows.iter()
        .map(|row| {
            let period = row.period();
            let mut cells = vec![
                CellValue::Text(row.timestamp.format(TIMESTAMP_FORMAT).to_string()),
                date_cell(row.trade_date()),
                CellValue::Int(period.get() as i64),
                CellValue::Text(period.label()),
            ];
            cells.extend(row.values.iter().map(|v| CellValue::from(*v)));
            cells
        })
        .collect()
}

fn aggregated_batch(rows: &[AggregatedInterval]) -> Vec<Vec<CellValue>> {
    rows.iter()
        .map(|row| {
            let mut cells = vec![
                date_cell(row.trade_date),
                CellValue::Text(row.time_interval.clone()),
                CellValue::Int(row.period.get() as i64),
            ];
            for stats in &row.stats {
                cells.push(stats.mean.into());
                cells.push(stats.median.into());
                cells.push(stats.last.into());
            }
            cells
        })
        .collect()
}

/// Idempotent batch writer; in dry-run mode nothing reaches the store.
pub struct UpsertWriter<'s> {
    store: &'s mut dyn RowStore,
    dry_run: bool,
}

impl<'s> UpsertWriter<'s> {
    pub fn new(store: &'s mut dyn RowStore, dry_run: bool) -> Self {
        Self { store, dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Creates the feed's destination tables when missing.
    pub fn ensure_tables(&mut self, feed: &Feed) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        if feed.is_fine_grained() {
            self.store.ensure_table(&fine_table(feed))?;
            if feed.config.aggregate_15min {
                self.store.ensure_table(&aggregated_table(feed))?;
            }
        } else {
            self.store.ensure_table(&quarter_table(feed))?;
        }
        Ok(())
    }

    pub fn write_wide(&mut self, feed: &Feed, rows: &[WideRow]) -> Result<usize> {
        let spec = quarter_table(feed);
        let batch: Vec<Vec<CellValue>> = rows
            .iter()
            .map(|row| {
                let mut cells = vec![
                    date_cell(row.key.trade_date),
                    CellValue::Int(row.key.period.get() as i64),
                ];
                if feed.config.keyed_by_area {
                    cells.push(row.key.area_id.map_or(CellValue::Null, |id| CellValue::Int(id as i64)));
                }
                if feed.config.keyed_by_country {
                    cells.push(
                        row.key
                            .country_code
                            .clone()
                            .map_or(CellValue::Null, CellValue::Text),
                    );
                }
                cells.push(CellValue::Text(row.time_interval.clone()));
                cells.extend(row.values.iter().map(|v| CellValue::from(*v)));
                cells
            })
            .collect();
        self.write(&spec, &batch)
    }

    pub fn write_fine(&mut self, feed: &Feed, rows: &[FineRow]) -> Result<usize> {
        self.write(&fine_table(feed), &fine_batch(rows))
    }

    pub fn write_aggregated(&mut self, feed: &Feed, rows: &[AggregatedInterval]) -> Result<usize> {
        self.write(&aggregated_table(feed), &aggregated_batch(rows))
    }

    /// Fine rows and their 15-minute statistics in one transaction.
    pub fn write_fine_with_aggregates(
        &mut self,
        feed: &Feed,
        rows: &[FineRow],
        intervals: &[AggregatedInterval],
    ) -> Result<(usize, usize)> {
        let fine = fine_table(feed);
        let aggregated = aggregated_table(feed);
        let fine_rows = fine_batch(rows);
        let interval_rows = aggregated_batch(intervals);

        if fine_rows.is_empty() && interval_rows.is_empty() {
            warn!("No rows to upsert into {} or {}", fine.name, aggregated.name);
            return Ok((0, 0));
        }
        if self.dry_run {
            info!(
                "[DRY RUN] Would upsert {} rows into {} and {} into {}",
                fine_rows.len(),
                fine.name,
                interval_rows.len(),
                aggregated.name
            );
            return Ok((fine_rows.len(), interval_rows.len()));
        }
        let written = self
            .store
            .upsert_batches(&[(&fine, &fine_rows[..]), (&aggregated, &interval_rows[..])])?;
        let minutes = written.first().copied().unwrap_or_default();
        let quarters = written.get(1).copied().unwrap_or_default();
        info!(
            "Upserted {} rows into {} and {} into {}",
            minutes, fine.name, quarters, aggregated.name
        );
        Ok((minutes, quarters))
    }

    /// Fine rows already stored for `date`; empty in dry-run mode.
    pub fn stored_fine_rows(&self, feed: &Feed, date: NaiveDate) -> Result<Vec<FineRow>> {
        if self.dry_run {
            return Ok(Vec::new());
        }
        self.store
            .load_fine_rows(feed.table(), feed.schema.column_names(), date)
    }

    fn write(&mut self, spec: &TableSpec, batch: &[Vec<CellValue>]) -> Result<usize> {
        if batch.is_empty() {
            warn!("No rows to upsert into {}", spec.name);
            return Ok(0);
        }
        if self.dry_run {
            info!("[DRY RUN] Would upsert {} rows into {}", batch.len(), spec.name);
            return Ok(batch.len());
        }
        let written = self.store.upsert_batch(spec, batch)?;
        info!("Upserted {} rows into {}", written, spec.name);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed_config::FeedCatalog;
    use crate::models::{AreaContext, ColumnStats, NormalizedKey};
    use crate::store::SqliteStore;
    use crate::time_basis::Period;
    use chrono::NaiveDateTime;

    fn load_row(area: &AreaContext, period: u8, actual: f64) -> WideRow {
        let key = NormalizedKey::new(
            NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
            Period::new(period).unwrap(),
            area,
        );
        let mut row = WideRow::empty(key, 2);
        row.values[0] = Some(actual);
        row
    }

    #[test]
    fn test_quarter_table_layout() {
        let catalog = FeedCatalog::embedded().unwrap();
        let spec = quarter_table(catalog.feed("entsoe_load").unwrap());
        assert_eq!(spec.unique, vec!["trade_date", "period", "area_id", "country_code"]);
        let sql = spec.create_sql();
        assert!(sql.contains("CHECK (period BETWEEN 1 AND 96)"));
        assert!(sql.contains("\"forecast_load_mw\" REAL"));

        let spec = quarter_table(catalog.feed("entsoe_imbalance_prices").unwrap());
        assert_eq!(spec.unique, vec!["trade_date", "period"]);
    }

    #[test]
    fn test_same_batch_twice_is_idempotent() {
        let catalog = FeedCatalog::embedded().unwrap();
        let feed = catalog.feed("entsoe_load").unwrap();
        let area = catalog.area_contexts(feed, Some(&[1])).remove(0);
        let mut store = SqliteStore::open_in_memory().unwrap();

        {
            let mut writer = UpsertWriter::new(&mut store, false);
            writer.ensure_tables(feed).unwrap();
            let first = vec![load_row(&area, 1, 6100.0), load_row(&area, 2, 6150.0)];
            assert_eq!(writer.write_wide(feed, &first).unwrap(), 2);
            let second = vec![load_row(&area, 1, 6200.0), load_row(&area, 2, 6150.0)];
            assert_eq!(writer.write_wide(feed, &second).unwrap(), 2);
        }

        assert_eq!(store.count_rows("entsoe_load").unwrap(), 2);
        let actual: f64 = store
            .connection()
            .query_row(
                "SELECT actual_load_mw FROM entsoe_load WHERE period = 1 AND area_id = 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(actual, 6200.0);
        let forecast: Option<f64> = store
            .connection()
            .query_row(
                "SELECT forecast_load_mw FROM entsoe_load WHERE period = 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(forecast, None);
    }

    #[test]
    fn test_dry_run_and_empty_batch() {
        let catalog = FeedCatalog::embedded().unwrap();
        let feed = catalog.feed("ceps_imbalance").unwrap();
        let mut store = SqliteStore::open_in_memory().unwrap();

        let mut writer = UpsertWriter::new(&mut store, true);
        writer.ensure_tables(feed).unwrap();
        let ts = NaiveDateTime::parse_from_str("2026-01-04 00:00:00", TIMESTAMP_FORMAT).unwrap();
        let rows = vec![FineRow {
            timestamp: ts,
            values: vec![Some(-160.5)],
        }];
        assert_eq!(writer.write_fine(feed, &rows).unwrap(), 1);
        assert_eq!(writer.write_fine(feed, &[]).unwrap(), 0);
        drop(writer);

        assert!(store.tables().unwrap().is_empty());
    }

    #[test]
    fn test_fine_and_aggregated_round_trip() {
        let catalog = FeedCatalog::embedded().unwrap();
        let feed = catalog.feed("ceps_imbalance").unwrap();
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut writer = UpsertWriter::new(&mut store, false);
        writer.ensure_tables(feed).unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 1, 4).unwrap();
        let ts = date.and_hms_opt(23, 59, 0).unwrap();
        writer
            .write_fine(feed, &[FineRow { timestamp: ts, values: vec![Some(5.0)] }])
            .unwrap();
        let stored = writer.stored_fine_rows(feed, date).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].period().get(), 96);

        let interval = AggregatedInterval {
            trade_date: date,
            period: Period::new(96).unwrap(),
            time_interval: "23:45-00:00".to_string(),
            stats: vec![ColumnStats {
                mean: Some(5.0),
                median: Some(5.0),
                last: Some(5.0),
            }],
        };
        assert_eq!(writer.write_aggregated(feed, &[interval.clone()]).unwrap(), 1);
        assert_eq!(writer.write_aggregated(feed, &[interval]).unwrap(), 1);
        drop(writer);

        assert_eq!(store.count_rows("ceps_actual_imbalance_15min").unwrap(), 1);
        let columns = store.table_columns("ceps_actual_imbalance_15min").unwrap();
        assert!(columns.contains(&"load_mw_median".to_string()));
    }

    #[test]
    fn test_fine_with_aggregates_is_all_or_nothing() {
        let catalog = FeedCatalog::embedded().unwrap();
        let feed = catalog.feed("ceps_imbalance").unwrap();
        let mut store = SqliteStore::open_in_memory().unwrap();
        UpsertWriter::new(&mut store, false).ensure_tables(feed).unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_quarters BEFORE INSERT ON ceps_actual_imbalance_15min
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 1, 4).unwrap();
        let rows = vec![FineRow {
            timestamp: date.and_hms_opt(0, 1, 0).unwrap(),
            values: vec![Some(5.0)],
        }];
        let intervals = vec![AggregatedInterval {
            trade_date: date,
            period: Period::new(1).unwrap(),
            time_interval: "00:00-00:15".to_string(),
            stats: vec![ColumnStats {
                mean: Some(5.0),
                median: Some(5.0),
                last: Some(5.0),
            }],
        }];

        let mut writer = UpsertWriter::new(&mut store, false);
        assert!(writer.write_fine_with_aggregates(feed, &rows, &intervals).is_err());
        drop(writer);
        assert_eq!(store.count_rows("ceps_actual_imbalance_1min").unwrap(), 0);

        store.connection().execute_batch("DROP TRIGGER reject_quarters").unwrap();
        let mut writer = UpsertWriter::new(&mut store, false);
        assert_eq!(
            writer.write_fine_with_aggregates(feed, &rows, &intervals).unwrap(),
            (1, 1)
        );
    }
}
