pub mod aggregation;
pub mod assembler;
pub mod dedup;
pub mod error;
pub mod feed_config;
pub mod merger;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod source;
pub mod store;
pub mod time_basis;
pub mod upsert;

pub use aggregation::AggregationEngine;
pub use assembler::{AssembledRows, WideAssembler};
pub use dedup::{dedup_last_wins, Deduplicator};
pub use error::{IngestError, Result};
pub use feed_config::{Feed, FeedCatalog, MergeRule};
pub use models::{AggregatedInterval, AreaContext, FineRow, NormalizedKey, Observation, WideRow};
pub use parser::{parser_for, Document, ParseOutcome, SeriesParser};
pub use pipeline::{chunk_windows, IngestionRun, RunOptions, RunReport, DEFAULT_CHUNK_DAYS};
pub use source::{DirectorySource, DocumentRequest, DocumentSource, FetchWindow};
pub use store::{RowStore, SqliteStore};
pub use time_basis::{Period, TimeBasis};
pub use upsert::UpsertWriter;
