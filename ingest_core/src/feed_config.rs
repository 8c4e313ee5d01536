use crate::error::{IngestError, Result};
use crate::models::AreaContext;
use crate::time_basis::{TimeBasis, PERIOD_MINUTES};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

const EMBEDDED_CATALOG: &str = include_str!("../feeds/feeds.json");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Most recently parsed value wins among equal resolutions.
    #[default]
    Override,
    /// Values from different source codes at equal resolution are summed.
    Accumulate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default)]
    pub merge: MergeRule,
}

/// Source code → destination columns. One code may feed several columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeMapping {
    pub code: String,
    pub columns: Vec<String>,
    /// Among overriding codes of equal resolution the higher priority wins;
    /// a lower one only fills in while the preferred value is absent or zero.
    #[serde(default)]
    pub priority: u8,
    /// Multiplier applied before merging, e.g. `-1` for imports netted against exports.
    #[serde(default = "default_scale")]
    pub scale: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampZone {
    Utc,
    #[default]
    Local,
}

/// Element names of a position-indexed XML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlShape {
    #[serde(default = "default_series_element")]
    pub series_element: String,
    #[serde(default = "default_period_element")]
    pub period_element: String,
    #[serde(default = "default_point_element")]
    pub point_element: String,
    /// Series-level (or document-level) code, e.g. `psrType` or `processType`.
    #[serde(default)]
    pub series_code_element: Option<String>,
    pub value_element: String,
    /// Second series-level element joined to the series code as `<code>:<qualifier>`,
    /// e.g. `flowDirection.direction` under `businessType`.
    #[serde(default)]
    pub series_qualifier_element: Option<String>,
    /// Point-level code, e.g. `imbalance_Price.category`; takes precedence over the series code.
    #[serde(default)]
    pub category_element: Option<String>,
    /// Further values carried by each point besides `value_element`.
    #[serde(default)]
    pub components: Vec<PointComponent>,
    #[serde(default = "default_resolution")]
    pub default_resolution: String,
    /// Root elements that signal "no data" rather than a malformed document.
    #[serde(default = "default_empty_roots")]
    pub empty_roots: Vec<String>,
}

/// An extra value read from every point, emitted under `<point code>:<sub code>`.
///
/// `Financial_Price` children carry their own `amount` and `priceDescriptor.type`,
/// so one point yields one observation per child. A plain element such as
/// `secondaryQuantity` holds the value itself and its name is the sub code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointComponent {
    pub element: String,
    #[serde(default)]
    pub value_element: Option<String>,
    #[serde(default)]
    pub code_element: Option<String>,
}

/// Layout of a delimited text document with metadata header lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelimitedShape {
    #[serde(default)]
    pub metadata_lines: usize,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_decimal_separator")]
    pub decimal_separator: char,
    #[serde(default)]
    pub thousands_separator: Option<char>,
    #[serde(default)]
    pub timestamp_column: usize,
    pub timestamp_format: String,
    #[serde(default)]
    pub timestamp_zone: TimestampZone,
    /// Metadata line carrying the payload's own date (`dd.mm.yyyy`).
    #[serde(default)]
    pub declared_date_line: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeConfig {
    PositionSeries(XmlShape),
    Delimited(DelimitedShape),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub table: String,
    pub shape: ShapeConfig,
    pub native_resolution_minutes: u32,
    #[serde(default)]
    pub keyed_by_area: bool,
    #[serde(default)]
    pub keyed_by_country: bool,
    pub columns: Vec<ColumnSpec>,
    pub mappings: Vec<CodeMapping>,
    #[serde(default)]
    pub aggregate_15min: bool,
    /// Destination of the 15-minute statistics; defaults to `<table>_15min`.
    #[serde(default)]
    pub aggregated_table: Option<String>,
    /// Payloads declare their own local day, which must match the day requested.
    #[serde(default)]
    pub daily_documents: bool,
    /// Documents fetched separately for the same window, e.g. actual and forecast load.
    #[serde(default)]
    pub variants: Vec<String>,
    /// File name glob under `<root>/<feed name>/`; `{date}`, `{area}` and `{variant}` are substituted.
    pub file_pattern: String,
    /// Areas this feed is published for; empty means every configured area.
    #[serde(default)]
    pub area_ids: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaConfig {
    pub area_id: i32,
    pub eic: String,
    pub label: String,
    pub country_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default = "default_time_zone")]
    time_zone: String,
    #[serde(default)]
    areas: Vec<AreaConfig>,
    feeds: Vec<FeedConfig>,
}

/// Where one source code lands and how it competes with other codes.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeTargets {
    pub columns: Vec<usize>,
    pub priority: u8,
    pub scale: f64,
}

/// Column names and merge rules resolved to indices once at load time.
#[derive(Debug, Clone)]
pub struct FeedSchema {
    columns: Vec<String>,
    rules: Vec<MergeRule>,
    code_table: HashMap<String, CodeTargets>,
}

impl FeedSchema {
    fn build(config: &FeedConfig) -> Result<Self> {
        let mut index = HashMap::new();
        for (idx, column) in config.columns.iter().enumerate() {
            check_identifier(&column.name)?;
            if index.insert(column.name.clone(), idx).is_some() {
                return Err(IngestError::Config(format!(
                    "feed {}: column {} declared twice",
                    config.name, column.name
                )));
            }
        }

        let mut code_table: HashMap<String, CodeTargets> = HashMap::new();
        for mapping in &config.mappings {
            if !mapping.scale.is_finite() || mapping.scale == 0.0 {
                return Err(IngestError::Config(format!(
                    "feed {}: code {} has unusable scale {}",
                    config.name, mapping.code, mapping.scale
                )));
            }
            let targets = code_table
                .entry(mapping.code.clone())
                .or_insert_with(|| CodeTargets {
                    columns: Vec::new(),
                    priority: mapping.priority,
                    scale: mapping.scale,
                });
            if targets.priority != mapping.priority || targets.scale != mapping.scale {
                return Err(IngestError::Config(format!(
                    "feed {}: code {} is mapped twice with different priority or scale",
                    config.name, mapping.code
                )));
            }
            for column in &mapping.columns {
                let idx = *index.get(column).ok_or_else(|| {
                    IngestError::Config(format!(
                        "feed {}: code {} maps to unknown column {}",
                        config.name, mapping.code, column
                    ))
                })?;
                if !targets.columns.contains(&idx) {
                    targets.columns.push(idx);
                }
            }
        }

        Ok(Self {
            columns: config.columns.iter().map(|c| c.name.clone()).collect(),
            rules: config.columns.iter().map(|c| c.merge).collect(),
            code_table,
        })
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn rule(&self, column: usize) -> MergeRule {
        self.rules[column]
    }

    pub fn targets(&self, code: &str) -> Option<&CodeTargets> {
        self.code_table.get(code)
    }

    pub fn columns_for(&self, code: &str) -> Option<&[usize]> {
        self.targets(code).map(|t| t.columns.as_slice())
    }
}

#[derive(Debug, Clone)]
pub struct Feed {
    pub config: FeedConfig,
    pub schema: FeedSchema,
}

impl Feed {
    pub fn from_config(config: FeedConfig) -> Result<Self> {
        check_identifier(&config.table)?;
        if let Some(table) = &config.aggregated_table {
            check_identifier(table)?;
        }
        if config.native_resolution_minutes == 0 {
            return Err(IngestError::Config(format!(
                "feed {}: native resolution must be positive",
                config.name
            )));
        }
        if config.aggregate_15min && config.native_resolution_minutes >= PERIOD_MINUTES {
            return Err(IngestError::Config(format!(
                "feed {}: 15-minute aggregation needs a sub-15-minute native resolution",
                config.name
            )));
        }
        if config.native_resolution_minutes < PERIOD_MINUTES
            && (config.keyed_by_area || config.keyed_by_country)
        {
            return Err(IngestError::Config(format!(
                "feed {}: sub-15-minute feeds are keyed by timestamp only",
                config.name
            )));
        }
        let schema = FeedSchema::build(&config)?;
        Ok(Self { config, schema })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn table(&self) -> &str {
        &self.config.table
    }

    pub fn aggregated_table(&self) -> String {
        self.config
            .aggregated_table
            .clone()
            .unwrap_or_else(|| format!("{}_15min", self.config.table))
    }

    /// Rows are keyed by minute timestamp instead of quarter-hour period.
    pub fn is_fine_grained(&self) -> bool {
        self.config.native_resolution_minutes < PERIOD_MINUTES
    }
}

/// Immutable catalog of feeds and areas, loaded once at start-up.
#[derive(Debug, Clone)]
pub struct FeedCatalog {
    time_zone: String,
    areas: Vec<AreaConfig>,
    feeds: BTreeMap<String, Feed>,
}

impl FeedCatalog {
    pub fn embedded() -> Result<Self> {
        Self::from_json_str(EMBEDDED_CATALOG)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(text)?;
        TimeBasis::new(&file.time_zone)?;

        let mut area_ids = HashSet::new();
        for area in &file.areas {
            if !area_ids.insert(area.area_id) {
                return Err(IngestError::Config(format!(
                    "area_id {} declared twice",
                    area.area_id
                )));
            }
        }

        let mut feeds = BTreeMap::new();
        for config in file.feeds {
            let name = config.name.clone();
            if let Some(id) = config.area_ids.iter().find(|id| !area_ids.contains(*id)) {
                return Err(IngestError::Config(format!(
                    "feed {} is published for unknown area_id {}",
                    name, id
                )));
            }
            if feeds.insert(name.clone(), Feed::from_config(config)?).is_some() {
                return Err(IngestError::Config(format!("feed {} declared twice", name)));
            }
        }

        Ok(Self {
            time_zone: file.time_zone,
            areas: file.areas,
            feeds,
        })
    }

    pub fn time_basis(&self) -> Result<TimeBasis> {
        TimeBasis::new(&self.time_zone)
    }

    pub fn feed(&self, name: &str) -> Result<&Feed> {
        self.feeds.get(name).ok_or_else(|| {
            IngestError::Config(format!(
                "unknown feed '{}' (known: {})",
                name,
                self.feeds.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    pub fn feeds(&self) -> impl Iterator<Item = &Feed> {
        self.feeds.values()
    }

    pub fn areas(&self) -> &[AreaConfig] {
        &self.areas
    }

    /// Area contexts a feed runs over; `only` restricts to the given area ids.
    pub fn area_contexts(&self, feed: &Feed, only: Option<&[i32]>) -> Vec<AreaContext> {
        if !feed.config.keyed_by_area && !feed.config.keyed_by_country {
            return vec![AreaContext::none()];
        }
        let published = &feed.config.area_ids;
        self.areas
            .iter()
            .filter(|a| published.is_empty() || published.contains(&a.area_id))
            .filter(|a| only.map_or(true, |ids| ids.contains(&a.area_id)))
            .map(|a| AreaContext {
                area_id: feed.config.keyed_by_area.then_some(a.area_id),
                country_code: feed
                    .config
                    .keyed_by_country
                    .then(|| a.country_code.clone()),
                label: Some(a.label.clone()),
            })
            .collect()
    }
}

fn check_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(IngestError::Config(format!(
            "'{}' is not a valid table or column name",
            name
        )))
    }
}

fn default_series_element() -> String {
    "TimeSeries".to_string()
}

fn default_period_element() -> String {
    "Period".to_string()
}

fn default_point_element() -> String {
    "Point".to_string()
}

fn default_resolution() -> String {
    "PT15M".to_string()
}

fn default_empty_roots() -> Vec<String> {
    vec!["Acknowledgement_MarketDocument".to_string()]
}

fn default_scale() -> f64 {
    1.0
}

fn default_delimiter() -> char {
    ';'
}

fn default_decimal_separator() -> char {
    '.'
}

fn default_time_zone() -> String {
    crate::time_basis::DEFAULT_TIME_ZONE.to_string()
}
