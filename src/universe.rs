//! Symbol universe sources.
//!
//! The scanner takes a plain symbol list; this module produces one. Sources can be merged
//! (a failing source is skipped as long as another succeeds) and wrapped in a TTL cache.

use std::{
    collections::HashSet,
    sync::RwLock,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Public S&P 500 constituents dataset.
pub const SP500_CONSTITUENTS_URL: &str =
    "https://raw.githubusercontent.com/datasets/s-and-p-500-companies/master/data/constituents.csv";

/// Broad market, sector, bond and commodity ETFs.
pub const CURATED_ETFS: &[&str] = &[
    "SPY", "QQQ", "DIA", "IWM", "XLF", "XLK", "XLE", "XLY", "XLP", "XLV", "XLI", "XLB", "XLRE",
    "XLU", "XLC", "TLT", "IEF", "HYG", "LQD", "GLD", "SLV", "TQQQ", "SQQQ",
];

/// Major index tickers.
pub const CURATED_INDEXES: &[&str] = &["^GSPC", "^NDX", "^DJI", "^RUT", "^VIX"];

/// Default freshness window for cached universes.
pub const DEFAULT_UNIVERSE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UniverseError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Column '{0}' not found")]
    MissingColumn(String),

    #[error("All universe sources failed")]
    AllSourcesFailed,
}

/// Anything that can list symbols.
pub trait SymbolSource: Send + Sync {
    fn name(&self) -> &str;

    fn list_symbols(&self) -> Result<Vec<String>, UniverseError>;
}

/// Trim, drop empty entries and remove duplicates, keeping first occurrences in order.
pub fn normalize_symbols<I, S>(symbols: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    symbols
        .into_iter()
        .filter_map(|s| {
            let s = s.as_ref().trim();
            (!s.is_empty() && seen.insert(s.to_string())).then(|| s.to_string())
        })
        .collect()
}

// ============================================================
// STATIC SOURCES
// ============================================================

/// Fixed symbol list.
#[derive(Debug, Clone)]
pub struct StaticSymbols {
    name: String,
    symbols: Vec<String>,
}

impl StaticSymbols {
    pub fn new<I, S>(name: impl Into<String>, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: name.into(),
            symbols: normalize_symbols(symbols),
        }
    }
}

impl SymbolSource for StaticSymbols {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_symbols(&self) -> Result<Vec<String>, UniverseError> {
        Ok(self.symbols.clone())
    }
}

pub fn curated_etfs() -> StaticSymbols {
    StaticSymbols::new("etfs", CURATED_ETFS)
}

pub fn curated_indexes() -> StaticSymbols {
    StaticSymbols::new("indexes", CURATED_INDEXES)
}

// ============================================================
// CSV
// ============================================================

/// Extract `column` from a CSV document with a header row.
///
/// The header match ignores case and surrounding whitespace.
pub fn parse_constituents_csv(text: &str, column: &str) -> Result<Vec<String>, UniverseError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b',')
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers().map_err(csv_error)?.clone();
    if headers.iter().all(str::is_empty) {
        return Err(UniverseError::Parse("empty CSV document".into()));
    }
    let index = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(column))
        .ok_or_else(|| UniverseError::MissingColumn(column.to_string()))?;

    let mut symbols = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        if let Some(field) = record.get(index) {
            symbols.push(field.to_string());
        }
    }
    Ok(normalize_symbols(symbols))
}

fn csv_error(err: csv::Error) -> UniverseError {
    UniverseError::Parse(err.to_string())
}

// ============================================================
// MERGED
// ============================================================

/// Union of several sources, sorted and de-duplicated.
///
/// A source that fails is logged and skipped; the merge fails only if every source fails.
#[derive(Default)]
pub struct MergedUniverse {
    sources: Vec<Box<dyn SymbolSource>>,
}

impl MergedUniverse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source<S: SymbolSource + 'static>(mut self, source: S) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl SymbolSource for MergedUniverse {
    fn name(&self) -> &str {
        "merged"
    }

    fn list_symbols(&self) -> Result<Vec<String>, UniverseError> {
        let mut all = Vec::new();
        let mut failures = 0;

        for source in &self.sources {
            match source.list_symbols() {
                Ok(symbols) => {
                    debug!(source = source.name(), count = symbols.len(), "universe source loaded");
                    all.extend(symbols);
                },
                Err(e) => {
                    warn!(source = source.name(), error = %e, "universe source failed");
                    failures += 1;
                },
            }
        }

        if failures > 0 && failures == self.sources.len() {
            return Err(UniverseError::AllSourcesFailed);
        }

        let mut symbols = normalize_symbols(all);
        symbols.sort();
        Ok(symbols)
    }
}

// ============================================================
// CACHE
// ============================================================

#[derive(Debug, Clone)]
struct CacheEntry {
    symbols: Vec<String>,
    fetched_at: DateTime<Utc>,
}

/// TTL cache around a source.
///
/// Serves the cached list while it is younger than the TTL. On refresh failure the stale list
/// is served if there is one.
pub struct CachedUniverse<S> {
    source: S,
    ttl: Duration,
    entry: RwLock<Option<CacheEntry>>,
}

impl<S: SymbolSource> CachedUniverse<S> {
    pub fn new(source: S) -> Self {
        Self::with_ttl(source, DEFAULT_UNIVERSE_TTL)
    }

    pub fn with_ttl(source: S, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entry: RwLock::new(None),
        }
    }

    pub fn symbols(&self) -> Result<Vec<String>, UniverseError> {
        self.symbols_at(Utc::now())
    }

    /// Like [`symbols`](Self::symbols) with an explicit clock.
    pub fn symbols_at(&self, now: DateTime<Utc>) -> Result<Vec<String>, UniverseError> {
        let stale = {
            let guard = self.entry.read().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(entry) if self.is_fresh(entry, now) => return Ok(entry.symbols.clone()),
                Some(entry) => Some(entry.symbols.clone()),
                None => None,
            }
        };

        match self.source.list_symbols() {
            Ok(symbols) => {
                debug!(source = self.source.name(), count = symbols.len(), "universe refreshed");
                let mut guard = self.entry.write().unwrap_or_else(|e| e.into_inner());
                *guard = Some(CacheEntry {
                    symbols: symbols.clone(),
                    fetched_at: now,
                });
                Ok(symbols)
            },
            Err(e) => match stale {
                Some(symbols) => {
                    warn!(source = self.source.name(), error = %e, "universe refresh failed, serving stale list");
                    Ok(symbols)
                },
                None => Err(e),
            },
        }
    }

    /// Time of the last successful refresh.
    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.entry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|e| e.fetched_at)
    }

    /// Drop the cached list so the next call refreshes.
    pub fn invalidate(&self) {
        *self.entry.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        (now - entry.fetched_at)
            .to_std()
            .map(|age| age < self.ttl)
            .unwrap_or(true)
    }
}

impl<S: SymbolSource> SymbolSource for CachedUniverse<S> {
    fn name(&self) -> &str {
        self.source.name()
    }

    fn list_symbols(&self) -> Result<Vec<String>, UniverseError> {
        self.symbols()
    }
}

// ============================================================
// HTTP CSV
// ============================================================

/// Downloads a constituents CSV and extracts one column.
#[cfg(feature = "http")]
pub struct HttpCsvSource {
    name: String,
    url: String,
    column: String,
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl HttpCsvSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, column: impl Into<String>) -> Result<Self, UniverseError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| UniverseError::Network(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            column: column.into(),
            client,
        })
    }

    /// S&P 500 constituents, `Symbol` column.
    pub fn sp500() -> Result<Self, UniverseError> {
        Self::new("sp500", SP500_CONSTITUENTS_URL, "Symbol")
    }
}

#[cfg(feature = "http")]
impl SymbolSource for HttpCsvSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_symbols(&self) -> Result<Vec<String>, UniverseError> {
        debug!(url = %self.url, "downloading constituents");
        let resp = self
            .client
            .get(&self.url)
            .send()
            .map_err(|e| UniverseError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(UniverseError::Network(format!("HTTP {}", resp.status())));
        }
        let text = resp
            .text()
            .map_err(|e| UniverseError::Network(e.to_string()))?;
        parse_constituents_csv(&text, &self.column)
    }
}
