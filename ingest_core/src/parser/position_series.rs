use super::{expect_shape, Document, DocumentShape, ParseOutcome, SeriesParser};
use crate::error::{IngestError, Result};
use crate::feed_config::XmlShape;
use crate::models::{Observation, RawPoint, SourcePeriod};
use crate::time_basis::{resolution_minutes, truncate_to_minute, TimeBasis, PERIOD_MINUTES};
use chrono::Duration;
use log::debug;
use roxmltree::Node;
use std::collections::BTreeMap;

/// Parser for `TimeSeries/Period/Point` documents with sparse, 1-based positions.
pub struct PositionSeriesParser<'a> {
    shape: &'a XmlShape,
}

impl<'a> PositionSeriesParser<'a> {
    pub fn new(shape: &'a XmlShape) -> Self {
        Self { shape }
    }

    fn read_period(
        &self,
        doc: &Document,
        period: Node,
        basis: &TimeBasis,
        skipped: &mut usize,
    ) -> Result<SourcePeriod> {
        let interval = child(period, "timeInterval")
            .ok_or_else(|| IngestError::structure(&doc.name, "Period without timeInterval"))?;
        let instant = |name: &str| {
            child_text(interval, name)
                .and_then(|text| basis.parse_instant(text))
                .ok_or_else(|| {
                    IngestError::structure(&doc.name, format!("timeInterval has no valid {}", name))
                })
        };
        let start = instant("start")?;
        let end = instant("end")?;

        let code = child_text(period, "resolution").unwrap_or(&self.shape.default_resolution);
        let resolution = resolution_minutes(code).ok_or_else(|| {
            IngestError::structure(&doc.name, format!("unknown resolution {}", code))
        })?;

        let mut source = SourcePeriod {
            start,
            end,
            resolution_minutes: resolution,
            points: Vec::new(),
        };
        if end <= start || !source.is_aligned() {
            return Err(IngestError::structure(
                &doc.name,
                format!("span {} - {} is not a whole number of {}", start, end, code),
            ));
        }

        let slots = source.slot_count();
        for point in named(period, &self.shape.point_element) {
            let position = child_text(point, "position").and_then(|t| t.trim().parse::<u32>().ok());
            let value = child_text(point, &self.shape.value_element)
                .and_then(|t| t.trim().parse::<f64>().ok());
            match (position, value) {
                (Some(position), Some(value)) if (1..=slots).contains(&position) => {
                    let category = self
                        .shape
                        .category_element
                        .as_deref()
                        .and_then(|name| child_text(point, name))
                        .map(|t| t.trim().to_string());
                    source.points.push(RawPoint {
                        position,
                        value: Some(value),
                        category,
                        components: self.read_components(point),
                    });
                }
                _ => {
                    debug!("{}: skipping unreadable or out-of-span point", doc.name);
                    *skipped += 1;
                }
            }
        }
        Ok(source)
    }

    fn read_components(&self, point: Node) -> Vec<(String, f64)> {
        let mut values = Vec::new();
        for component in &self.shape.components {
            for node in named(point, &component.element) {
                let text = match &component.value_element {
                    Some(name) => child_text(node, name),
                    None => node.text(),
                };
                let Some(value) = text.and_then(|t| t.trim().parse::<f64>().ok()) else {
                    continue;
                };
                let code = component
                    .code_element
                    .as_deref()
                    .and_then(|name| child_text(node, name))
                    .map(str::trim)
                    .unwrap_or(component.element.as_str());
                values.push((code.to_string(), value));
            }
        }
        values
    }

    /// Forward-fills each field code from its first declared position to the end of the span.
    fn emit(
        &self,
        source: &SourcePeriod,
        series_code: Option<&str>,
        basis: &TimeBasis,
        next_record: &mut u64,
        out: &mut Vec<Observation>,
    ) {
        let mut by_code: BTreeMap<String, BTreeMap<u32, Option<f64>>> = BTreeMap::new();
        for point in &source.points {
            let code = point
                .category
                .clone()
                .or_else(|| series_code.map(str::to_string))
                .unwrap_or_else(|| self.shape.value_element.clone());
            for (sub, value) in &point.components {
                by_code
                    .entry(format!("{}:{}", code, sub))
                    .or_default()
                    .insert(point.position, Some(*value));
            }
            by_code
                .entry(code)
                .or_default()
                .insert(point.position, point.value);
        }

        let resolution = source.resolution_minutes;
        let quarters = if resolution > PERIOD_MINUTES && resolution % PERIOD_MINUTES == 0 {
            resolution / PERIOD_MINUTES
        } else {
            1
        };
        let slots = source.slot_count();

        for (code, declared) in &by_code {
            let first = match declared.keys().next() {
                Some(first) => *first,
                None => continue,
            };
            let mut carried = None;
            for position in first..=slots {
                if let Some(value) = declared.get(&position) {
                    carried = *value;
                }
                let start = source.position_start(position);
                for quarter in 0..quarters {
                    let instant = start + Duration::minutes((quarter * PERIOD_MINUTES) as i64);
                    let slot = ((position - 1) * quarters + quarter) as u64;
                    out.push(Observation {
                        timestamp: truncate_to_minute(basis.to_local(instant)),
                        field_code: code.clone(),
                        value: carried,
                        resolution_minutes: resolution,
                        record: *next_record + slot,
                    });
                }
            }
        }
        *next_record += (slots * quarters) as u64;
    }
}

impl SeriesParser for PositionSeriesParser<'_> {
    fn parse(&self, doc: &Document, basis: &TimeBasis) -> Result<ParseOutcome> {
        expect_shape(doc, DocumentShape::PositionSeries)?;
        let xml = roxmltree::Document::parse(doc.text()?)
            .map_err(|e| IngestError::structure(&doc.name, format!("malformed XML: {}", e)))?;
        let root = xml.root_element();
        let root_name = root.tag_name().name();

        let mut outcome = ParseOutcome::default();
        if self.shape.empty_roots.iter().any(|r| r == root_name) {
            debug!("{}: {} carries no data", doc.name, root_name);
            return Ok(outcome);
        }

        let code_element = self.shape.series_code_element.as_deref();
        let document_code = code_element.and_then(|name| child_text(root, name));
        let qualifier_element = self.shape.series_qualifier_element.as_deref();

        let series: Vec<Node> = root
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == self.shape.series_element)
            .collect();
        if series.is_empty() {
            return Err(IngestError::structure(
                &doc.name,
                format!("<{}> has no {} elements", root_name, self.shape.series_element),
            ));
        }

        let mut next_record = 0u64;
        for node in series {
            let code = code_element
                .and_then(|name| descendant_text(node, name))
                .or(document_code)
                .map(str::trim);
            let qualifier = qualifier_element
                .and_then(|name| descendant_text(node, name).or_else(|| child_text(root, name)))
                .map(str::trim);
            let series_code = match (code, qualifier) {
                (Some(code), Some(qualifier)) => Some(format!("{}:{}", code, qualifier)),
                (code, _) => code.map(str::to_string),
            };
            for period in named(node, &self.shape.period_element) {
                let source = self.read_period(doc, period, basis, &mut outcome.skipped_rows)?;
                self.emit(
                    &source,
                    series_code.as_deref(),
                    basis,
                    &mut next_record,
                    &mut outcome.observations,
                );
            }
        }

        debug!(
            "{}: {} observations, {} points skipped",
            doc.name,
            outcome.observations.len(),
            outcome.skipped_rows
        );
        Ok(outcome)
    }
}

fn named<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|n| n.text())
}

fn descendant_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .and_then(|n| n.text())
}
