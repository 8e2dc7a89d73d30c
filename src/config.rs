//! TOML scan configuration
//!
//! Every field is optional; an empty document reproduces the default daily scan over all four
//! patterns.
//!
//! # Example
//!
//! ```rust
//! use stratscan::config::ScanConfig;
//!
//! let config = ScanConfig::from_toml_str(
//!     r#"
//!     timeframe = "Weekly"
//!     previous = ["1"]
//!     current = ["2U", "2D"]
//!     lookback_depth = 3
//!
//!     [continuity]
//!     intervals = ["1mo"]
//!     "#,
//! )
//! .unwrap();
//!
//! let request = config.build_request(["AAPL", "MSFT"]).unwrap();
//! assert_eq!(request.universe().len(), 2);
//! ```

use std::{path::Path, time::Duration};

use crate::{
    detectors::{AlignmentFilter, Comparison, ContinuityConfig, ContinuityMode, LabelFilter},
    timeframe::{Interval, Timeframe, TimeframePreset},
    universe::{self, StaticSymbols},
    OpenBarPolicy, Result, ScanRequest, StratError, DEFAULT_BATCH_SIZE, DEFAULT_CONCURRENCY,
    DEFAULT_TIMEOUT,
};

// ============================================================
// SECTIONS
// ============================================================

/// `[continuity]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContinuitySection {
    /// Coarser intervals; empty means weekly and monthly where coarser than the scan.
    pub intervals: Vec<Interval>,
    pub mode: ContinuityMode,
}

/// `[universe]` table
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UniverseSection {
    pub sp500: bool,
    pub etfs: bool,
    pub indexes: bool,
    pub extra: Vec<String>,
    pub cache_ttl_hours: u64,
    pub sp500_url: Option<String>,
}

impl Default for UniverseSection {
    fn default() -> Self {
        Self {
            sp500: true,
            etfs: true,
            indexes: true,
            extra: Vec::new(),
            cache_ttl_hours: universe::DEFAULT_UNIVERSE_TTL.as_secs() / 3600,
            sp500_url: None,
        }
    }
}

impl UniverseSection {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 3600)
    }

    /// Sources that need no network access: curated lists plus `extra`.
    pub fn static_sources(&self) -> Vec<StaticSymbols> {
        let mut sources = Vec::new();
        if self.etfs {
            sources.push(universe::curated_etfs());
        }
        if self.indexes {
            sources.push(universe::curated_indexes());
        }
        if !self.extra.is_empty() {
            sources.push(StaticSymbols::new("extra", &self.extra));
        }
        sources
    }
}

// ============================================================
// SCAN CONFIG
// ============================================================

fn default_filter() -> Vec<String> {
    ["1", "2U", "2D", "3"].iter().map(|s| s.to_string()).collect()
}

/// Scan settings as read from a TOML file
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Preset label ("Daily", "4H", "2 Week", ...) or interval code ("1d", "1wk", ...)
    pub timeframe: String,
    /// Overrides the preset's lookback
    pub lookback_days: Option<u64>,
    pub previous: Vec<String>,
    pub current: Vec<String>,
    /// Enables the sliding window when set
    pub lookback_depth: Option<usize>,
    pub color_aware: bool,
    pub comparison: Comparison,
    pub open_bars: OpenBarPolicy,
    pub alignment: AlignmentFilter,
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub batch_size: usize,
    pub continuity: Option<ContinuitySection>,
    pub universe: UniverseSection,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeframe: TimeframePreset::Daily.label().to_string(),
            lookback_days: None,
            previous: default_filter(),
            current: default_filter(),
            lookback_depth: None,
            color_aware: false,
            comparison: Comparison::default(),
            open_bars: OpenBarPolicy::default(),
            alignment: AlignmentFilter::default(),
            concurrency: DEFAULT_CONCURRENCY,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            batch_size: DEFAULT_BATCH_SIZE,
            continuity: None,
            universe: UniverseSection::default(),
        }
    }
}

impl ScanConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| StratError::InvalidConfig(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StratError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| StratError::InvalidConfig(e.to_string()))
    }

    /// Resolve the timeframe, applying `lookback_days` if set.
    pub fn timeframe(&self) -> Result<Timeframe> {
        let preset: TimeframePreset = self
            .timeframe
            .parse()
            .map_err(|_| StratError::InvalidInterval(self.timeframe.clone()))?;
        let timeframe = preset.timeframe();
        Ok(match self.lookback_days {
            Some(days) => Timeframe::days(timeframe.interval, days),
            None => timeframe,
        })
    }

    fn continuity_config(&self, scan: Interval) -> Option<ContinuityConfig> {
        self.continuity.as_ref().map(|section| {
            if section.intervals.is_empty() {
                ContinuityConfig {
                    mode: section.mode,
                    ..ContinuityConfig::coarser_than(scan)
                }
            } else {
                ContinuityConfig::new(section.intervals.iter().copied(), section.mode)
            }
        })
    }

    /// Validated request over `universe`.
    pub fn build_request<I, S>(&self, universe: I) -> Result<ScanRequest>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let timeframe = self.timeframe()?;
        let mut builder = ScanRequest::builder(universe, timeframe)
            .previous(LabelFilter::parse(&self.previous)?)
            .current(LabelFilter::parse(&self.current)?)
            .color_aware(self.color_aware)
            .comparison(self.comparison)
            .open_bars(self.open_bars)
            .alignment(self.alignment)
            .concurrency(self.concurrency)
            .timeout(Duration::from_secs(self.timeout_secs))
            .batch_size(self.batch_size);

        if let Some(depth) = self.lookback_depth {
            builder = builder.lookback_depth(depth);
        }
        if let Some(continuity) = self.continuity_config(timeframe.interval) {
            builder = builder.continuity(continuity);
        }
        builder.build()
    }
}
