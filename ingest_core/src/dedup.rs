use crate::models::{FineRow, NormalizedKey, WideRow};
use chrono::NaiveDateTime;
use log::info;
use std::collections::HashMap;
use std::hash::Hash;

/// Rows that carry a natural unique key.
pub trait Keyed {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> Self::Key;
}

impl Keyed for WideRow {
    type Key = NormalizedKey;

    fn key(&self) -> NormalizedKey {
        self.key.clone()
    }
}

impl Keyed for FineRow {
    type Key = NaiveDateTime;

    fn key(&self) -> NaiveDateTime {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome<T> {
    pub rows: Vec<T>,
    pub duplicates: usize,
}

/// Collapses rows sharing a key; the later row wins but keeps the first row's position.
pub fn dedup_last_wins<T, K, F>(rows: Vec<T>, key_fn: F) -> DedupOutcome<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut positions: HashMap<K, usize> = HashMap::with_capacity(rows.len());
    let mut kept: Vec<T> = Vec::with_capacity(rows.len());
    let mut duplicates = 0;

    for row in rows {
        match positions.get(&key_fn(&row)) {
            Some(&idx) => {
                kept[idx] = row;
                duplicates += 1;
            }
            None => {
                positions.insert(key_fn(&row), kept.len());
                kept.push(row);
            }
        }
    }

    DedupOutcome {
        rows: kept,
        duplicates,
    }
}

pub struct Deduplicator;

impl Deduplicator {
    pub fn collapse<T: Keyed>(rows: Vec<T>) -> DedupOutcome<T> {
        let before = rows.len();
        let outcome = dedup_last_wins(rows, T::key);
        if outcome.duplicates > 0 {
            info!(
                "Records before dedup: {}, after: {}",
                before,
                outcome.rows.len()
            );
        }
        outcome
    }
}
