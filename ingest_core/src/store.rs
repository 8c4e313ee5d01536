use crate::error::{IngestError, Result};
use crate::models::FineRow;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use log::{debug, info};
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::path::Path;

pub const TIMESTAMP_COLUMN: &str = "delivery_timestamp";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single bound parameter of an upsert row.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl From<Option<f64>> for CellValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(CellValue::Null, CellValue::Real)
    }
}

impl ToSql for CellValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            CellValue::Null => ToSqlOutput::Owned(Value::Null),
            CellValue::Int(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            CellValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            CellValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    Real,
    Text,
}

impl SqlType {
    fn as_sql(self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub check: Option<String>,
}

impl ColumnDef {
    pub fn key(name: &str, sql_type: SqlType) -> Self {
        Self {
            name: name.to_string(),
            sql_type,
            nullable: false,
            check: None,
        }
    }

    pub fn value(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: SqlType::Real,
            nullable: true,
            check: None,
        }
    }

    pub fn with_check(mut self, check: &str) -> Self {
        self.check = Some(check.to_string());
        self
    }
}

/// Destination table layout; `unique` names the natural key used as the conflict target.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub unique: Vec<String>,
}

impl TableSpec {
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    fn updatable(&self) -> impl Iterator<Item = &str> {
        self.column_names()
            .filter(move |c| !self.unique.iter().any(|u| u.as_str() == *c))
    }

    pub fn create_sql(&self) -> String {
        let mut lines = vec!["    id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
        for column in &self.columns {
            let mut line = format!("    {} {}", quote_ident(&column.name), column.sql_type.as_sql());
            if !column.nullable {
                line.push_str(" NOT NULL");
            }
            if let Some(check) = &column.check {
                line.push_str(&format!(" CHECK ({})", check));
            }
            lines.push(line);
        }
        lines.push("    ingested_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP".to_string());
        lines.push(format!("    UNIQUE ({})", quoted_list(self.unique.iter().map(String::as_str))));
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            quote_ident(&self.name),
            lines.join(",\n")
        )
    }

    /// Insert-or-update touching every non-key column and the ingestion timestamp.
    pub fn upsert_sql(&self) -> String {
        let placeholders: Vec<String> = (1..=self.columns.len()).map(|i| format!("?{}", i)).collect();
        let mut updates: Vec<String> = self
            .updatable()
            .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
            .collect();
        updates.push("ingested_at = CURRENT_TIMESTAMP".to_string());
        format!(
            "INSERT INTO {} ({}) VALUES ({})\nON CONFLICT ({}) DO UPDATE SET\n    {}",
            quote_ident(&self.name),
            quoted_list(self.column_names()),
            placeholders.join(", "),
            quoted_list(self.unique.iter().map(String::as_str)),
            updates.join(",\n    ")
        )
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quoted_list<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.map(quote_ident).collect::<Vec<_>>().join(", ")
}

fn persist_error(table: &str) -> impl FnOnce(rusqlite::Error) -> IngestError + '_ {
    move |source| IngestError::Persist {
        table: table.to_string(),
        source,
    }
}

/// Durable destination for normalized rows.
pub trait RowStore {
    fn ensure_table(&mut self, spec: &TableSpec) -> Result<()>;

    /// Writes every row in one transaction; on error nothing of the batch is kept.
    fn upsert_batch(&mut self, spec: &TableSpec, rows: &[Vec<CellValue>]) -> Result<usize> {
        let written = self.upsert_batches(&[(spec, rows)])?;
        Ok(written.into_iter().sum())
    }

    /// Writes batches for several tables in one transaction, returning rows affected per batch.
    fn upsert_batches(&mut self, batches: &[(&TableSpec, &[Vec<CellValue>])]) -> Result<Vec<usize>>;

    /// All stored fine rows of one local date, ordered by timestamp.
    fn load_fine_rows(&self, table: &str, columns: &[String], date: NaiveDate)
        -> Result<Vec<FineRow>>;
}

/// Row count and period coverage of one trade date.
#[derive(Debug, Clone, PartialEq)]
pub struct DayCoverage {
    pub trade_date: String,
    pub rows: usize,
    pub periods: usize,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(persist_error("<open>"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(persist_error("<open>"))?;
        info!("Opened store {}", path.display());
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(persist_error("<memory>"))?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn tables(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .map_err(persist_error("sqlite_master"))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(persist_error("sqlite_master"))?;
        Ok(names)
    }

    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let sql = format!("PRAGMA table_info({})", quote_ident(table));
        let mut stmt = self.conn.prepare(&sql).map_err(persist_error(table))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(persist_error(table))?;
        Ok(columns)
    }

    pub fn count_rows(&self, table: &str) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(persist_error(table))?;
        Ok(count as usize)
    }

    pub fn day_coverage(&self, table: &str) -> Result<Vec<DayCoverage>> {
        let sql = format!(
            "SELECT trade_date, COUNT(*), COUNT(DISTINCT period) FROM {}
             GROUP BY trade_date ORDER BY trade_date",
            quote_ident(table)
        );
        let mut stmt = self.conn.prepare(&sql).map_err(persist_error(table))?;
        let days = stmt
            .query_map([], |row| {
                Ok(DayCoverage {
                    trade_date: row.get(0)?,
                    rows: row.get::<_, i64>(1)? as usize,
                    periods: row.get::<_, i64>(2)? as usize,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(persist_error(table))?;
        Ok(days)
    }

    /// Distinct `(period, time_interval)` pairs stored in a quarter-hour table.
    pub fn interval_labels(&self, table: &str) -> Result<Vec<(i64, String)>> {
        let sql = format!(
            "SELECT DISTINCT period, time_interval FROM {} ORDER BY period",
            quote_ident(table)
        );
        let mut stmt = self.conn.prepare(&sql).map_err(persist_error(table))?;
        let labels = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(persist_error(table))?;
        Ok(labels)
    }
}

impl RowStore for SqliteStore {
    fn ensure_table(&mut self, spec: &TableSpec) -> Result<()> {
        let sql = spec.create_sql();
        debug!("{}", sql);
        self.conn
            .execute_batch(&sql)
            .map_err(persist_error(&spec.name))
    }

    fn upsert_batches(&mut self, batches: &[(&TableSpec, &[Vec<CellValue>])]) -> Result<Vec<usize>> {
        let first = batches.first().map_or("<empty>", |(spec, _)| spec.name.as_str());
        let tx = self.conn.transaction().map_err(persist_error(first))?;
        let mut written = Vec::with_capacity(batches.len());
        for (spec, rows) in batches {
            let mut stmt = tx
                .prepare_cached(&spec.upsert_sql())
                .map_err(persist_error(&spec.name))?;
            let mut affected = 0;
            for row in rows.iter() {
                affected += stmt
                    .execute(params_from_iter(row.iter()))
                    .map_err(persist_error(&spec.name))?;
            }
            written.push(affected);
        }
        // Dropping an uncommitted transaction rolls it back
        tx.commit().map_err(persist_error(first))?;
        Ok(written)
    }

    fn load_fine_rows(
        &self,
        table: &str,
        columns: &[String],
        date: NaiveDate,
    ) -> Result<Vec<FineRow>> {
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE {0} >= ?1 AND {0} < ?2 ORDER BY {0}",
            quote_ident(TIMESTAMP_COLUMN),
            quoted_list(columns.iter().map(String::as_str)),
            quote_ident(table)
        );
        let from = date.and_time(Default::default());
        let to = from + Duration::days(1);

        let mut stmt = self.conn.prepare(&sql).map_err(persist_error(table))?;
        let raw = stmt
            .query_map(
                params![
                    from.format(TIMESTAMP_FORMAT).to_string(),
                    to.format(TIMESTAMP_FORMAT).to_string()
                ],
                |row| {
                    let timestamp: String = row.get(0)?;
                    let values = (0..columns.len())
                        .map(|i| row.get::<_, Option<f64>>(i + 1))
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok((timestamp, values))
                },
            )
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(persist_error(table))?;

        let mut rows = Vec::with_capacity(raw.len());
        for (text, values) in raw {
            let timestamp = NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT).map_err(|e| {
                IngestError::Config(format!("{}: stored timestamp '{}' unreadable: {}", table, text, e))
            })?;
            rows.push(FineRow { timestamp, values });
        }
        Ok(rows)
    }
}
