use crate::feed_config::Feed;
use crate::merger::{merge, Cell, Contribution};
use crate::models::{AreaContext, FineRow, NormalizedKey, Observation, WideRow};
use crate::time_basis::Period;
use chrono::NaiveDateTime;
use log::debug;
use std::collections::{BTreeMap, HashMap};

struct Slot {
    cells: Vec<Option<Cell>>,
    first_seen: u64,
}

impl Slot {
    fn new(width: usize, first_seen: u64) -> Self {
        Self {
            cells: (0..width).map(|_| None).collect(),
            first_seen,
        }
    }

    fn values(&self) -> Vec<Option<f64>> {
        self.cells
            .iter()
            .map(|cell| cell.as_ref().and_then(Cell::value))
            .collect()
    }
}

/// Output of one assembly pass, shaped by the feed's native resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum AssembledRows {
    Quarter(Vec<WideRow>),
    Fine(Vec<FineRow>),
}

impl AssembledRows {
    pub fn len(&self) -> usize {
        match self {
            Self::Quarter(rows) => rows.len(),
            Self::Fine(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Folds narrow `(timestamp, code, value)` observations into wide rows.
///
/// Quarter-hour feeds key rows by `(trade_date, period, area, country)` across all
/// documents pushed into one assembler, so e.g. actual and forecast load land in
/// one row. Sub-15-minute feeds keep one row per source record; collapsing repeated
/// timestamps is left to the deduplicator.
pub struct WideAssembler<'a> {
    feed: &'a Feed,
    quarter: HashMap<NormalizedKey, Slot>,
    fine: HashMap<(usize, u64), (NaiveDateTime, Slot)>,
    document: usize,
    sequence: u64,
    unmapped: BTreeMap<String, usize>,
    superseded: usize,
}

impl<'a> WideAssembler<'a> {
    pub fn new(feed: &'a Feed) -> Self {
        Self {
            feed,
            quarter: HashMap::new(),
            fine: HashMap::new(),
            document: 0,
            sequence: 0,
            unmapped: BTreeMap::new(),
            superseded: 0,
        }
    }

    /// Marks the start of the next document; record ordinals restart per document.
    pub fn begin_document(&mut self) {
        self.document += 1;
    }

    pub fn push(&mut self, obs: &Observation, area: &AreaContext) {
        let feed = self.feed;
        let schema = &feed.schema;
        let targets = match schema.targets(&obs.field_code) {
            Some(targets) => targets,
            None => {
                *self.unmapped.entry(obs.field_code.clone()).or_insert(0) += 1;
                return;
            }
        };

        let width = schema.width();
        let sequence = self.sequence;
        self.sequence += 1;

        let slot = if feed.is_fine_grained() {
            &mut self
                .fine
                .entry((self.document, obs.record))
                .or_insert_with(|| (obs.timestamp, Slot::new(width, sequence)))
                .1
        } else {
            let key = NormalizedKey::new(obs.timestamp.date(), Period::of(obs.timestamp), area);
            self.quarter
                .entry(key)
                .or_insert_with(|| Slot::new(width, sequence))
        };

        // A null still materializes the row but never overwrites a cell
        let value = match obs.value {
            Some(value) => value,
            None => return,
        };
        for &column in &targets.columns {
            let outcome = merge(
                &mut slot.cells[column],
                Contribution {
                    field_code: obs.field_code.clone(),
                    value: value * targets.scale,
                    resolution_minutes: obs.resolution_minutes,
                    priority: targets.priority,
                },
                schema.rule(column),
            );
            if outcome.is_superseded() {
                self.superseded += 1;
            }
        }
    }

    pub fn extend<'o>(
        &mut self,
        observations: impl IntoIterator<Item = &'o Observation>,
        area: &AreaContext,
    ) {
        for obs in observations {
            self.push(obs, area);
        }
    }

    /// Codes that had no column mapping, with how often each was seen.
    pub fn unmapped_codes(&self) -> &BTreeMap<String, usize> {
        &self.unmapped
    }

    pub fn unmapped(&self) -> usize {
        self.unmapped.values().sum()
    }

    /// Cell contributions dropped for a finer resolution or a preferred code.
    pub fn superseded(&self) -> usize {
        self.superseded
    }

    /// Quarter rows in key order; fine rows in the order they were first seen.
    pub fn finish(self) -> AssembledRows {
        for (code, count) in &self.unmapped {
            debug!("{}: ignored {} observations of unmapped code {}", self.feed.name(), count, code);
        }

        if self.feed.is_fine_grained() {
            let mut slots: Vec<_> = self.fine.into_values().collect();
            slots.sort_by_key(|(_, slot)| slot.first_seen);
            AssembledRows::Fine(
                slots
                    .into_iter()
                    .map(|(timestamp, slot)| FineRow {
                        timestamp,
                        values: slot.values(),
                    })
                    .collect(),
            )
        } else {
            let mut rows: Vec<WideRow> = self
                .quarter
                .into_iter()
                .map(|(key, slot)| WideRow {
                    time_interval: key.time_interval(),
                    values: slot.values(),
                    key,
                })
                .collect();
            rows.sort_by(|a, b| a.key.cmp(&b.key));
            AssembledRows::Quarter(rows)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed_config::FeedCatalog;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 12, 1)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn obs(ts: NaiveDateTime, code: &str, value: Option<f64>, resolution: u32) -> Observation {
        Observation {
            timestamp: ts,
            field_code: code.to_string(),
            value,
            resolution_minutes: resolution,
            record: 0,
        }
    }

    fn quarter_rows(rows: AssembledRows) -> Vec<WideRow> {
        match rows {
            AssembledRows::Quarter(rows) => rows,
            AssembledRows::Fine(_) => panic!("expected quarter rows"),
        }
    }

    #[test]
    fn test_actual_and_forecast_share_a_row() {
        let catalog = FeedCatalog::embedded().unwrap();
        let feed = catalog.feed("entsoe_load").unwrap();
        let area = catalog.area_contexts(feed, Some(&[1])).remove(0);

        let mut assembler = WideAssembler::new(feed);
        assembler.push(&obs(at(10, 0), "A16", Some(6100.0), 15), &area);
        assembler.begin_document();
        assembler.push(&obs(at(10, 0), "A01", Some(6050.0), 15), &area);
        assembler.push(&obs(at(10, 0), "A99", Some(1.0), 15), &area);
        assert_eq!(assembler.unmapped(), 1);

        let rows = quarter_rows(assembler.finish());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, vec![Some(6100.0), Some(6050.0)]);
        assert_eq!(rows[0].key.period.get(), 41);
        assert_eq!(rows[0].key.area_id, Some(1));
        assert_eq!(rows[0].key.country_code.as_deref(), Some("CZ"));
        assert_eq!(rows[0].time_interval, "10:00-10:15");
    }

    #[test]
    fn test_unfed_columns_stay_null() {
        let catalog = FeedCatalog::embedded().unwrap();
        let feed = catalog.feed("entsoe_generation").unwrap();
        let area = catalog.area_contexts(feed, Some(&[1])).remove(0);

        let mut assembler = WideAssembler::new(feed);
        assembler.push(&obs(at(0, 0), "B02", Some(1200.0), 15), &area);
        assembler.push(&obs(at(0, 0), "B05", Some(300.0), 15), &area);
        assembler.push(&obs(at(0, 0), "B14", None, 15), &area);
        assembler.push(&obs(at(0, 15), "B16", None, 15), &area);

        let rows = quarter_rows(assembler.finish());
        assert_eq!(rows.len(), 2);
        let coal = feed.schema.column_index("gen_coal_mw").unwrap();
        assert_eq!(rows[0].values[coal], Some(1500.0));
        assert_eq!(rows[0].values.iter().filter(|v| v.is_some()).count(), 1);
        assert!(rows[1].values.iter().all(Option::is_none));
    }

    #[test]
    fn test_one_code_feeds_both_price_columns() {
        let catalog = FeedCatalog::embedded().unwrap();
        let feed = catalog.feed("entsoe_imbalance_prices").unwrap();

        let pos = feed.schema.column_index("pos_imb_price_czk_mwh").unwrap();
        let neg = feed.schema.column_index("neg_imb_price_czk_mwh").unwrap();

        let mut assembler = WideAssembler::new(feed);
        assembler.push(&obs(at(8, 30), "A04", Some(2450.5), 15), &AreaContext::none());
        let rows = quarter_rows(assembler.finish());
        assert_eq!(rows[0].values[pos], Some(2450.5));
        assert_eq!(rows[0].values[neg], Some(2450.5));
        assert_eq!(rows[0].values.iter().filter(|v| v.is_some()).count(), 2);
        assert_eq!(rows[0].key.area_id, None);
    }

    #[test]
    fn test_long_price_category_preferred_regardless_of_order() {
        let catalog = FeedCatalog::embedded().unwrap();
        let feed = catalog.feed("entsoe_imbalance_prices").unwrap();
        let pos = feed.schema.column_index("pos_imb_price_czk_mwh").unwrap();
        let scarcity = feed.schema.column_index("neg_imb_scarcity_czk_mwh").unwrap();
        let none = AreaContext::none();

        let mut assembler = WideAssembler::new(feed);
        // 08:30 sees A05 first, 08:45 sees A04 first
        assembler.push(&obs(at(8, 30), "A05", Some(200.0), 15), &none);
        assembler.push(&obs(at(8, 30), "A04", Some(100.0), 15), &none);
        assembler.push(&obs(at(8, 45), "A04", Some(100.0), 15), &none);
        assembler.push(&obs(at(8, 45), "A05", Some(200.0), 15), &none);
        assembler.push(&obs(at(8, 45), "A05:A01", Some(7.0), 15), &none);
        // 09:00 has a zero long price, so the short one stands in
        assembler.push(&obs(at(9, 0), "A04", Some(0.0), 15), &none);
        assembler.push(&obs(at(9, 0), "A05", Some(300.0), 15), &none);
        assert_eq!(assembler.superseded(), 2);

        let rows = quarter_rows(assembler.finish());
        assert_eq!(rows[0].values[pos], Some(100.0));
        assert_eq!(rows[1].values[pos], Some(100.0));
        assert_eq!(rows[1].values[scarcity], Some(7.0));
        assert_eq!(rows[2].values[pos], Some(300.0));
    }

    #[test]
    fn test_scaled_codes_net_out() {
        let catalog = FeedCatalog::embedded().unwrap();
        let feed = catalog.feed("entsoe_cross_border_flows").unwrap();
        let area = catalog.area_contexts(feed, None).remove(0);
        let de = feed.schema.column_index("flow_de_mw").unwrap();
        let total = feed.schema.column_index("flow_total_net_mw").unwrap();

        let mut assembler = WideAssembler::new(feed);
        // Export to DE, import from DE and from AT
        assembler.push(&obs(at(0, 0), "10YDE-EON------1:10YCZ-CEPS-----N", Some(900.0), 15), &area);
        assembler.push(&obs(at(0, 0), "10YCZ-CEPS-----N:10YDE-EON------1", Some(250.0), 15), &area);
        assembler.push(&obs(at(0, 0), "10YCZ-CEPS-----N:10YAT-APG------L", Some(100.0), 15), &area);

        let rows = quarter_rows(assembler.finish());
        assert_eq!(rows[0].values[de], Some(-650.0));
        assert_eq!(rows[0].values[total], Some(-550.0));
        assert_eq!(rows[0].key.area_id, Some(1));
    }

    #[test]
    fn test_quarter_beats_hourly_through_assembler() {
        let catalog = FeedCatalog::embedded().unwrap();
        let feed = catalog.feed("entsoe_generation").unwrap();
        let area = catalog.area_contexts(feed, Some(&[1])).remove(0);
        let solar = feed.schema.column_index("gen_solar_mw").unwrap();

        let mut assembler = WideAssembler::new(feed);
        assembler.push(&obs(at(12, 0), "B16", Some(410.0), 15), &area);
        assembler.push(&obs(at(12, 0), "B16", Some(400.0), 60), &area);
        assembler.push(&obs(at(12, 15), "B16", Some(400.0), 60), &area);

        let rows = quarter_rows(assembler.finish());
        assert_eq!(rows[0].values[solar], Some(410.0));
        assert_eq!(rows[1].values[solar], Some(400.0));
    }

    #[test]
    fn test_fine_rows_follow_source_records() {
        let catalog = FeedCatalog::embedded().unwrap();
        let feed = catalog.feed("ceps_svr_activation").unwrap();
        let none = AreaContext::none();

        let mut assembler = WideAssembler::new(feed);
        let mut first = obs(at(10, 0), "aFRR+ [MW]", Some(12.5), 1);
        let mut second = obs(at(10, 0), "mFRR5 [MW]", Some(3.0), 1);
        assembler.push(&first, &none);
        assembler.push(&second, &none);

        // The same minute again in a later document
        assembler.begin_document();
        first.value = Some(13.0);
        second.record = 1;
        second.timestamp = at(10, 1);
        assembler.push(&first, &none);
        assembler.push(&second, &none);

        match assembler.finish() {
            AssembledRows::Fine(rows) => {
                assert_eq!(rows.len(), 3);
                assert_eq!(rows[0].values, vec![Some(12.5), None, None, None, Some(3.0)]);
                assert_eq!(rows[1].timestamp, at(10, 0));
                assert_eq!(rows[1].values[0], Some(13.0));
                assert_eq!(rows[2].timestamp, at(10, 1));
            }
            AssembledRows::Quarter(_) => panic!("expected fine rows"),
        }
    }
}
