//! Bar intervals and scan timeframes.
//!
//! An [`Interval`] is the bar size requested from a provider; a [`Timeframe`] pairs it with
//! the lookback window. [`TimeframePreset`] holds the named timeframes offered to users.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Months, Utc};

use crate::{Result, StratError};

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// Bar interval supported by the scanner.
///
/// Variants are declared from finest to coarsest, so the derived ordering compares coarseness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Interval {
    FourHour,
    Day,
    TwoDay,
    Week,
    TwoWeek,
    Month,
    Quarter,
}

impl Interval {
    /// Canonical string form ("4h", "1d", "2d", "1wk", "2wk", "1mo", "3mo").
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::FourHour => "4h",
            Interval::Day => "1d",
            Interval::TwoDay => "2d",
            Interval::Week => "1wk",
            Interval::TwoWeek => "2wk",
            Interval::Month => "1mo",
            Interval::Quarter => "3mo",
        }
    }

    /// All intervals, finest first.
    pub fn all() -> &'static [Interval] {
        &[
            Interval::FourHour,
            Interval::Day,
            Interval::TwoDay,
            Interval::Week,
            Interval::TwoWeek,
            Interval::Month,
            Interval::Quarter,
        ]
    }

    /// Nominal length in seconds. Calendar intervals use 30 days per month.
    pub fn nominal_seconds(self) -> u64 {
        match self {
            Interval::FourHour => 4 * HOUR,
            Interval::Day => DAY,
            Interval::TwoDay => 2 * DAY,
            Interval::Week => 7 * DAY,
            Interval::TwoWeek => 14 * DAY,
            Interval::Month => 30 * DAY,
            Interval::Quarter => 90 * DAY,
        }
    }

    /// Number of calendar months for month-based intervals.
    pub fn months(self) -> Option<u32> {
        match self {
            Interval::Month => Some(1),
            Interval::Quarter => Some(3),
            _ => None,
        }
    }

    /// End of the period that starts at `start`.
    pub fn period_end(self, start: DateTime<Utc>) -> DateTime<Utc> {
        let end = match self.months() {
            Some(months) => start.checked_add_months(Months::new(months)),
            None => i64::try_from(self.nominal_seconds())
                .ok()
                .and_then(|secs| start.checked_add_signed(chrono::Duration::seconds(secs))),
        };
        end.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Short lookback that is enough to read the latest few bars of this interval.
    pub fn probe_lookback(self) -> Duration {
        Duration::from_secs(self.nominal_seconds() * 5)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = StratError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "4h" => Ok(Interval::FourHour),
            "1d" => Ok(Interval::Day),
            "2d" => Ok(Interval::TwoDay),
            "1wk" => Ok(Interval::Week),
            "2wk" => Ok(Interval::TwoWeek),
            "1mo" => Ok(Interval::Month),
            "3mo" => Ok(Interval::Quarter),
            _ => Err(StratError::InvalidInterval(s.to_string())),
        }
    }
}

impl serde::Serialize for Interval {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Interval {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(d)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Interval plus the amount of history requested for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeframe {
    pub interval: Interval,
    pub lookback: Duration,
}

impl Timeframe {
    pub fn new(interval: Interval, lookback: Duration) -> Self {
        Self { interval, lookback }
    }

    pub fn days(interval: Interval, days: u64) -> Self {
        Self::new(interval, Duration::from_secs(days * DAY))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} over {}d", self.interval, self.lookback.as_secs() / DAY)
    }
}

/// Named timeframes with their default lookback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeframePreset {
    FourHour,
    Daily,
    TwoDay,
    Weekly,
    TwoWeek,
    Monthly,
    ThreeMonth,
}

impl TimeframePreset {
    pub fn all() -> &'static [TimeframePreset] {
        &[
            TimeframePreset::FourHour,
            TimeframePreset::Daily,
            TimeframePreset::TwoDay,
            TimeframePreset::Weekly,
            TimeframePreset::TwoWeek,
            TimeframePreset::Monthly,
            TimeframePreset::ThreeMonth,
        ]
    }

    pub fn label(self) -> &'static str {
        match self {
            TimeframePreset::FourHour => "4H",
            TimeframePreset::Daily => "Daily",
            TimeframePreset::TwoDay => "2 Day",
            TimeframePreset::Weekly => "Weekly",
            TimeframePreset::TwoWeek => "2 Week",
            TimeframePreset::Monthly => "Monthly",
            TimeframePreset::ThreeMonth => "3 Month",
        }
    }

    pub fn timeframe(self) -> Timeframe {
        match self {
            TimeframePreset::FourHour => Timeframe::days(Interval::FourHour, 60),
            TimeframePreset::Daily => Timeframe::days(Interval::Day, 365),
            TimeframePreset::TwoDay => Timeframe::days(Interval::TwoDay, 2 * 365),
            TimeframePreset::Weekly => Timeframe::days(Interval::Week, 5 * 365),
            TimeframePreset::TwoWeek => Timeframe::days(Interval::TwoWeek, 10 * 365),
            TimeframePreset::Monthly => Timeframe::days(Interval::Month, 15 * 365),
            TimeframePreset::ThreeMonth => Timeframe::days(Interval::Quarter, 20 * 365),
        }
    }

    /// Preset whose interval is `interval`.
    pub fn for_interval(interval: Interval) -> Self {
        match interval {
            Interval::FourHour => TimeframePreset::FourHour,
            Interval::Day => TimeframePreset::Daily,
            Interval::TwoDay => TimeframePreset::TwoDay,
            Interval::Week => TimeframePreset::Weekly,
            Interval::TwoWeek => TimeframePreset::TwoWeek,
            Interval::Month => TimeframePreset::Monthly,
            Interval::Quarter => TimeframePreset::ThreeMonth,
        }
    }
}

impl FromStr for TimeframePreset {
    type Err = StratError;

    /// Accepts preset labels ("Daily", "2 Week", ...) ignoring case and spaces,
    /// or an interval string ("1wk").
    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        let preset = match key.as_str() {
            "4h" => TimeframePreset::FourHour,
            "daily" => TimeframePreset::Daily,
            "2day" => TimeframePreset::TwoDay,
            "weekly" => TimeframePreset::Weekly,
            "2week" => TimeframePreset::TwoWeek,
            "monthly" => TimeframePreset::Monthly,
            "3month" => TimeframePreset::ThreeMonth,
            _ => return key.parse::<Interval>().map(TimeframePreset::for_interval),
        };
        Ok(preset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_interval_parse() {
        assert_eq!("1d".parse::<Interval>().unwrap(), Interval::Day);
        assert_eq!(" 1WK ".parse::<Interval>().unwrap(), Interval::Week);
        assert_eq!("3mo".parse::<Interval>().unwrap(), Interval::Quarter);
        assert!(matches!(
            "60m".parse::<Interval>(),
            Err(StratError::InvalidInterval(_))
        ));
        assert!("".parse::<Interval>().is_err());
    }

    #[test]
    fn test_interval_roundtrip_strings() {
        for interval in Interval::all() {
            assert_eq!(interval.as_str().parse::<Interval>().unwrap(), *interval);
        }
    }

    #[test]
    fn test_interval_ordering_is_coarseness() {
        assert!(Interval::FourHour < Interval::Day);
        assert!(Interval::Week < Interval::Month);
        assert!(Interval::Month < Interval::Quarter);
    }

    #[test]
    fn test_period_end_calendar_months() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let end = Interval::Month.period_end(start);
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());

        let start = Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap();
        assert_eq!(
            Interval::Week.period_end(start),
            Utc.with_ymd_and_hms(2024, 3, 11, 14, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_presets() {
        assert_eq!(
            "Daily".parse::<TimeframePreset>().unwrap(),
            TimeframePreset::Daily
        );
        assert_eq!(
            "2 week".parse::<TimeframePreset>().unwrap(),
            TimeframePreset::TwoWeek
        );
        assert_eq!(
            "1mo".parse::<TimeframePreset>().unwrap(),
            TimeframePreset::Monthly
        );
        assert!("hourly".parse::<TimeframePreset>().is_err());

        let tf = TimeframePreset::Weekly.timeframe();
        assert_eq!(tf.interval, Interval::Week);
        assert_eq!(tf.lookback, Duration::from_secs(5 * 365 * DAY));

        for preset in TimeframePreset::all() {
            assert_eq!(
                TimeframePreset::for_interval(preset.timeframe().interval),
                *preset
            );
        }
    }
}
