use crate::error::{IngestError, Result};
use chrono::{
    DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PERIODS_PER_DAY: u8 = 96;
pub const PERIOD_MINUTES: u32 = 15;
pub const DEFAULT_TIME_ZONE: &str = "Europe/Prague";

/// One of the 96 quarter-hour slots of a local calendar day, 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Period(u8);

impl Period {
    pub fn new(value: u8) -> Option<Self> {
        (1..=PERIODS_PER_DAY).contains(&value).then_some(Self(value))
    }

    /// Period containing a local wall-clock time; seconds are ignored.
    pub fn of(local: NaiveDateTime) -> Self {
        Self((local.hour() * 4 + local.minute() / PERIOD_MINUTES + 1) as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn start_time(self) -> NaiveTime {
        NaiveTime::default() + Duration::minutes(self.minutes_from_midnight() as i64)
    }

    /// `HH:MM-HH:MM`; the last period of the day ends at `00:00`.
    pub fn label(self) -> String {
        let start = self.minutes_from_midnight();
        let end = (start + PERIOD_MINUTES) % (24 * 60);
        format!(
            "{:02}:{:02}-{:02}:{:02}",
            start / 60,
            start % 60,
            end / 60,
            end % 60
        )
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let (start, _) = label.split_once('-')?;
        let time = NaiveTime::parse_from_str(start, "%H:%M").ok()?;
        if time.minute() % PERIOD_MINUTES != 0 {
            return None;
        }
        let period = Self::of(NaiveDate::default().and_time(time));
        (period.label() == label).then_some(period)
    }

    pub fn all() -> impl Iterator<Item = Period> {
        (1..=PERIODS_PER_DAY).map(Period)
    }

    fn minutes_from_midnight(self) -> u32 {
        (self.0 as u32 - 1) * PERIOD_MINUTES
    }
}

impl TryFrom<u8> for Period {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Period::new(value).ok_or_else(|| format!("period {} outside 1..=96", value))
    }
}

impl From<Period> for u8 {
    fn from(period: Period) -> u8 {
        period.0
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversion from upstream UTC instants to the destination calendar.
#[derive(Debug, Clone)]
pub struct TimeBasis {
    zone: Tz,
}

impl TimeBasis {
    pub fn new(zone_name: &str) -> Result<Self> {
        let zone: Tz = zone_name
            .parse()
            .map_err(|e| IngestError::Config(format!("unknown time zone '{}': {}", zone_name, e)))?;
        Ok(Self { zone })
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    pub fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.zone).naive_local()
    }

    /// Inverse of `to_local`. Ambiguous wall-clock times resolve to the earlier
    /// instant; times skipped by a forward transition return `None`.
    pub fn to_utc(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.zone
            .from_local_datetime(&local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        self.to_local(instant).date()
    }

    pub fn period_of(&self, local: NaiveDateTime) -> Period {
        Period::of(local)
    }

    pub fn interval_label(&self, period: Period) -> String {
        period.label()
    }

    /// Local start of a period on a given date.
    pub fn period_start(&self, date: NaiveDate, period: Period) -> NaiveDateTime {
        date.and_time(period.start_time())
    }

    /// UTC instant at which local midnight of `date` begins.
    pub fn day_start_utc(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        self.to_utc(date.and_time(NaiveTime::default()))
    }

    /// Parses upstream instants: RFC 3339, or ENTSO-E's minute form `2024-12-01T23:00Z`.
    pub fn parse_instant(&self, text: &str) -> Option<DateTime<Utc>> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.with_timezone(&Utc));
        }
        let naive = text.trim_end_matches('Z');
        NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M")
            .ok()
            .map(|dt| Utc.from_utc_datetime(&dt))
    }
}

impl Default for TimeBasis {
    fn default() -> Self {
        Self {
            zone: chrono_tz::Europe::Prague,
        }
    }
}

pub fn truncate_to_minute(local: NaiveDateTime) -> NaiveDateTime {
    local
        - Duration::seconds(local.second() as i64)
        - Duration::nanoseconds(local.nanosecond() as i64)
}

/// Start of the quarter-hour bucket containing `local`.
pub fn bucket_start(local: NaiveDateTime) -> NaiveDateTime {
    local.date().and_time(Period::of(local).start_time())
}

/// ISO 8601 durations as used for series resolution (`PT15M`, `PT60M`, `PT1H`, `P1D`).
pub fn resolution_minutes(code: &str) -> Option<u32> {
    let code = code.trim();
    if let Some(rest) = code.strip_prefix("PT") {
        if let Some(minutes) = rest.strip_suffix('M') {
            return minutes.parse::<u32>().ok().filter(|m| *m > 0);
        }
        if let Some(hours) = rest.strip_suffix('H') {
            return hours.parse::<u32>().ok().filter(|h| *h > 0).map(|h| h * 60);
        }
        return None;
    }
    code.strip_prefix('P')
        .and_then(|rest| rest.strip_suffix('D'))
        .and_then(|days| days.parse::<u32>().ok())
        .filter(|d| *d > 0)
        .map(|d| d * 24 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_period_round_trip_through_local_time() {
        let basis = TimeBasis::default();
        let date = NaiveDate::from_ymd_opt(2024, 6, 12).unwrap();

        for period in Period::all() {
            let local = basis.period_start(date, period);
            let instant = basis.to_utc(local).unwrap();
            let back = basis.to_local(instant);
            assert_eq!(basis.period_of(back), period);
            assert_eq!(back.date(), date);

            let label = basis.interval_label(period);
            assert_eq!(Period::from_label(&label), Some(period));
            assert_eq!(&label[..5], local.format("%H:%M").to_string());
        }
    }

    #[test]
    fn test_labels_at_day_edges() {
        assert_eq!(Period::new(1).unwrap().label(), "00:00-00:15");
        assert_eq!(Period::new(4).unwrap().label(), "00:45-01:00");
        assert_eq!(Period::new(96).unwrap().label(), "23:45-00:00");
        assert!(Period::new(0).is_none());
        assert!(Period::new(97).is_none());
        assert!(Period::from_label("00:05-00:20").is_none());
    }

    #[test]
    fn test_seasonal_offsets() {
        let basis = TimeBasis::default();

        // Winter: UTC+1
        let winter = basis.to_local(utc("2024-01-15T23:00:00Z"));
        assert_eq!(winter.date(), NaiveDate::from_ymd_opt(2024, 1, 16).unwrap());
        assert_eq!(basis.period_of(winter).get(), 1);

        // Summer: UTC+2
        let summer = basis.to_local(utc("2024-07-01T22:00:00Z"));
        assert_eq!(summer.date(), NaiveDate::from_ymd_opt(2024, 7, 2).unwrap());
        assert_eq!(basis.period_of(summer).get(), 1);

        // Spring transition: 01:00 UTC jumps local time from 02:00 to 03:00
        let after_jump = basis.to_local(utc("2024-03-31T01:00:00Z"));
        assert_eq!(after_jump.format("%H:%M").to_string(), "03:00");
    }

    #[test]
    fn test_period_ignores_seconds() {
        let local = NaiveDate::from_ymd_opt(2026, 1, 4)
            .unwrap()
            .and_hms_opt(10, 14, 59)
            .unwrap();
        assert_eq!(Period::of(local).get(), 41);
        assert_eq!(truncate_to_minute(local).second(), 0);
        assert_eq!(bucket_start(local).format("%H:%M").to_string(), "10:00");
    }

    #[test]
    fn test_resolution_codes() {
        assert_eq!(resolution_minutes("PT15M"), Some(15));
        assert_eq!(resolution_minutes("PT60M"), Some(60));
        assert_eq!(resolution_minutes("PT1H"), Some(60));
        assert_eq!(resolution_minutes("PT1M"), Some(1));
        assert_eq!(resolution_minutes("P1D"), Some(1440));
        assert_eq!(resolution_minutes("PT0M"), None);
        assert_eq!(resolution_minutes("15 minutes"), None);
    }

    #[test]
    fn test_parse_instant_forms() {
        let basis = TimeBasis::default();
        assert_eq!(
            basis.parse_instant("2024-12-01T23:00Z"),
            Some(utc("2024-12-01T23:00:00Z"))
        );
        assert_eq!(
            basis.parse_instant("2024-12-01T23:00:00+00:00"),
            Some(utc("2024-12-01T23:00:00Z"))
        );
        assert!(basis.parse_instant("yesterday").is_none());
    }

    #[test]
    fn test_unknown_zone_is_config_error() {
        assert!(matches!(
            TimeBasis::new("Mars/Olympus"),
            Err(IngestError::Config(_))
        ));
        assert!(TimeBasis::new(DEFAULT_TIME_ZONE).is_ok());
    }
}
