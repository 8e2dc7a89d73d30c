//! # stratscan - STRAT candlestick scanner
//!
//! Classifies price bars with the STRAT taxonomy (1 inside, 2U/2D directional, 3 outside) and
//! scans a universe of symbols for a chosen pattern pair on any timeframe.
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use stratscan::prelude::*;
//!
//! let day = |d: u32| Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap();
//!
//! // Any MarketDataProvider works; the in-memory one serves prepared bars
//! let provider = InMemoryProvider::new().with_series(
//!     "AAA",
//!     Interval::Day,
//!     vec![
//!         Bar::new(day(4), 9.0, 10.0, 8.0, 9.5),
//!         Bar::new(day(5), 8.7, 9.0, 8.5, 8.8),
//!         Bar::new(day(6), 8.8, 9.5, 8.2, 9.4),
//!     ],
//! );
//!
//! // Inside bar followed by an outside bar
//! let request = ScanRequest::builder(["AAA"], TimeframePreset::Daily.timeframe())
//!     .previous(LabelFilter::kinds([LabelKind::Inside]))
//!     .current(LabelFilter::kinds([LabelKind::Outside]))
//!     .build()
//!     .unwrap();
//!
//! let report = Scanner::new(provider).run(&request, &CancelToken::new()).unwrap();
//! assert_eq!(report.rows.len(), 1);
//! assert_eq!(report.rows[0].current, StratLabel::Outside);
//! ```

pub mod config;
pub mod detectors;
pub mod provider;
pub mod timeframe;
pub mod universe;
#[cfg(feature = "http")]
pub mod yahoo;

pub mod prelude {
    pub use crate::{
        // Configuration
        config::ScanConfig,
        // Detectors
        detectors::*,
        // Providers
        provider::{
            resample, BatchRequest, FetchRequest, InMemoryProvider, MarketDataProvider,
            ProviderError,
        },
        // Timeframes
        timeframe::{Interval, Timeframe, TimeframePreset},
        // Universe
        universe::{
            curated_etfs, curated_indexes, normalize_symbols, CachedUniverse, MergedUniverse,
            StaticSymbols, SymbolSource, UniverseError,
        },
        // Data
        Bar,
        BarSeries,
        // Scanning
        CancelToken,
        Direction,
        OHLCExt,
        OpenBarPolicy,
        Result,
        ScanIter,
        ScanReport,
        ScanRequest,
        ScanRequestBuilder,
        ScanResult,
        Scanner,
        SkipReason,
        SkipSummary,
        SkippedSymbol,
        // Errors
        StratError,
        SymbolOutcome,
        WindowMode,
        OHLC,
    };
}

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use detectors::{
    AlignmentFilter, ClassifyOptions, Comparison, Continuity, ContinuityConfig, FrameReading,
    LabelFilter, StratClassifier, StratLabel,
};
use provider::{BatchRequest, FetchRequest, MarketDataProvider, ProviderError};
use timeframe::{Interval, Timeframe};
use universe::UniverseError;

// ============================================================
// ERRORS
// ============================================================

pub type Result<T> = std::result::Result<T, StratError>;

/// Errors raised by classification, configuration and collaborators
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StratError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Insufficient data: need {need} bars, got {got}")]
    InsufficientData { need: usize, got: usize },

    #[error("Malformed bar at index {index}: {reason}")]
    MalformedBar { index: usize, reason: &'static str },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Universe(#[from] UniverseError),
}

impl StratError {
    /// Point a `MalformedBar` error at `index`; other errors pass through.
    pub(crate) fn at_index(self, index: usize) -> Self {
        match self {
            StratError::MalformedBar { reason, .. } => StratError::MalformedBar { index, reason },
            other => other,
        }
    }

    /// True for errors that stop a scan before it starts.
    pub fn is_configuration(&self) -> bool {
        matches!(self, StratError::InvalidConfig(_) | StratError::InvalidInterval(_))
    }
}

// ============================================================
// OHLC TRAITS
// ============================================================

/// Core OHLC data trait
pub trait OHLC {
    fn open(&self) -> f64;
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn close(&self) -> f64;
}

impl<T: OHLC + ?Sized> OHLC for &T {
    fn open(&self) -> f64 {
        (**self).open()
    }

    fn high(&self) -> f64 {
        (**self).high()
    }

    fn low(&self) -> f64 {
        (**self).low()
    }

    fn close(&self) -> f64 {
        (**self).close()
    }
}

/// Extension trait with computed properties for OHLC data
pub trait OHLCExt: OHLC {
    #[inline]
    fn range(&self) -> f64 {
        self.high() - self.low()
    }

    #[inline]
    fn is_bullish(&self) -> bool {
        self.close() > self.open()
    }

    /// Check `low <= open, close <= high` on positive finite prices.
    fn validate(&self) -> Result<()> {
        let prices = [self.open(), self.high(), self.low(), self.close()];
        let reason = if prices.iter().any(|p| !p.is_finite()) {
            Some("non-finite price")
        } else if prices.iter().any(|p| *p <= 0.0) {
            Some("non-positive price")
        } else if self.high() < self.low() {
            Some("high < low")
        } else if self.open() < self.low() || self.open() > self.high() {
            Some("open outside high/low range")
        } else if self.close() < self.low() || self.close() > self.high() {
            Some("close outside high/low range")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(StratError::MalformedBar { index: 0, reason }),
            None => Ok(()),
        }
    }
}

impl<T: OHLC + ?Sized> OHLCExt for T {}

// ============================================================
// BARS
// ============================================================

/// One OHLC observation.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Bar {
    /// Period start
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    /// Provider's view of whether the period has ended; `None` if it cannot tell.
    #[serde(default)]
    pub closed: Option<bool>,
}

impl Bar {
    pub fn new(time: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume: 0.0,
            closed: None,
        }
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_closed(mut self, closed: bool) -> Self {
        self.closed = Some(closed);
        self
    }
}

impl OHLC for Bar {
    fn open(&self) -> f64 {
        self.open
    }

    fn high(&self) -> f64 {
        self.high
    }

    fn low(&self) -> f64 {
        self.low
    }

    fn close(&self) -> f64 {
        self.close
    }
}

/// How a trailing in-progress bar is recognised and dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenBarPolicy {
    /// The series already holds closed bars only.
    AssumeClosed,
    /// The final bar is always in progress.
    DropLast,
    /// Drop trailing bars flagged open; unflagged bars are open while their period has not
    /// ended at the scan clock.
    #[default]
    Detect,
}

/// Bars of one symbol, ascending by time with unique timestamps.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BarSeries {
    bars: Vec<Bar>,
}

impl BarSeries {
    /// Sort by time and keep the last bar for each duplicated timestamp.
    pub fn new(mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.time);
        let mut deduped: Vec<Bar> = Vec::with_capacity(bars.len());
        for bar in bars {
            match deduped.last_mut() {
                Some(last) if last.time == bar.time => *last = bar,
                _ => deduped.push(bar),
            }
        }
        Self { bars: deduped }
    }

    #[inline]
    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn into_bars(self) -> Vec<Bar> {
        self.bars
    }

    /// Leading closed bars according to `policy`.
    pub fn closed_bars(&self, policy: OpenBarPolicy, interval: Interval, as_of: DateTime<Utc>) -> &[Bar] {
        let bars = self.bars.as_slice();
        match policy {
            OpenBarPolicy::AssumeClosed => bars,
            OpenBarPolicy::DropLast => &bars[..bars.len().saturating_sub(1)],
            OpenBarPolicy::Detect => {
                let mut end = bars.len();
                while let Some(bar) = end.checked_sub(1).and_then(|i| bars.get(i)) {
                    let open = match bar.closed {
                        Some(closed) => !closed,
                        None => interval.period_end(bar.time) > as_of,
                    };
                    if !open {
                        break;
                    }
                    end -= 1;
                }
                &bars[..end]
            },
        }
    }
}

impl From<Vec<Bar>> for BarSeries {
    fn from(bars: Vec<Bar>) -> Self {
        Self::new(bars)
    }
}

// ============================================================
// SCAN REQUEST
// ============================================================

/// Bars needed for a previous and a current label.
pub const MIN_SCAN_BARS: usize = 3;
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Which 3-bar windows are inspected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WindowMode {
    /// Only the last three closed bars.
    #[default]
    Latest,
    /// Slide back up to `depth` positions and take the most recent match.
    Lookback { depth: usize },
}

impl WindowMode {
    #[inline]
    pub fn depth(self) -> usize {
        match self {
            WindowMode::Latest => 1,
            WindowMode::Lookback { depth } => depth,
        }
    }
}

/// Immutable scan parameters. Built and validated by [`ScanRequestBuilder`].
#[derive(Debug, Clone)]
pub struct ScanRequest {
    universe: Vec<String>,
    timeframe: Timeframe,
    previous: LabelFilter,
    current: LabelFilter,
    window: WindowMode,
    options: ClassifyOptions,
    open_bars: OpenBarPolicy,
    continuity: Option<ContinuityConfig>,
    alignment: AlignmentFilter,
    concurrency: usize,
    timeout: Duration,
    batch_size: usize,
    as_of: Option<DateTime<Utc>>,
}

impl ScanRequest {
    /// Start a request over `universe`. Symbols are trimmed and de-duplicated.
    pub fn builder<I, S>(universe: I, timeframe: Timeframe) -> ScanRequestBuilder
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ScanRequestBuilder {
            request: ScanRequest {
                universe: crate::universe::normalize_symbols(universe),
                timeframe,
                previous: LabelFilter::any(),
                current: LabelFilter::any(),
                window: WindowMode::default(),
                options: ClassifyOptions::default(),
                open_bars: OpenBarPolicy::default(),
                continuity: None,
                alignment: AlignmentFilter::default(),
                concurrency: DEFAULT_CONCURRENCY,
                timeout: DEFAULT_TIMEOUT,
                batch_size: DEFAULT_BATCH_SIZE,
                as_of: None,
            },
        }
    }

    pub fn universe(&self) -> &[String] {
        &self.universe
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn previous(&self) -> &LabelFilter {
        &self.previous
    }

    pub fn current(&self) -> &LabelFilter {
        &self.current
    }

    pub fn window(&self) -> WindowMode {
        self.window
    }

    pub fn options(&self) -> ClassifyOptions {
        self.options
    }

    pub fn open_bars(&self) -> OpenBarPolicy {
        self.open_bars
    }

    pub fn continuity(&self) -> Option<&ContinuityConfig> {
        self.continuity.as_ref()
    }

    pub fn alignment(&self) -> AlignmentFilter {
        self.alignment
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Same request over a different universe.
    pub fn with_universe<I, S>(&self, universe: I) -> ScanRequest
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ScanRequest {
            universe: crate::universe::normalize_symbols(universe),
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(StratError::InvalidConfig(msg.to_string()));

        if self.timeframe.lookback.is_zero() {
            return invalid("lookback must be > 0");
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be > 0");
        }
        if self.timeout.is_zero() {
            return invalid("timeout must be > 0");
        }
        if self.batch_size == 0 {
            return invalid("batch size must be > 0");
        }
        if self.window.depth() == 0 {
            return invalid("lookback depth must be > 0");
        }
        if !self.options.color_aware && (self.previous.requires_color() || self.current.requires_color()) {
            return invalid("coloured label filters need colour-aware classification");
        }
        if self.options.comparison == Comparison::Inclusive
            && (self.previous.only_undefined() || self.current.only_undefined())
        {
            return invalid("inclusive comparison never yields Undefined");
        }
        if let Some(continuity) = &self.continuity {
            if continuity.intervals.is_empty() {
                return invalid("continuity needs at least one coarser interval");
            }
            if let Some(bad) = continuity
                .intervals
                .iter()
                .find(|i| **i <= self.timeframe.interval)
            {
                return Err(StratError::InvalidConfig(format!(
                    "continuity interval {bad} is not coarser than {}",
                    self.timeframe.interval
                )));
            }
        }
        if self.alignment != AlignmentFilter::Off && self.continuity.is_none() {
            return invalid("alignment filter needs continuity");
        }
        Ok(())
    }
}

/// Builder for [`ScanRequest`]
pub struct ScanRequestBuilder {
    request: ScanRequest,
}

impl ScanRequestBuilder {
    /// Accepted labels for the previous bar
    pub fn previous(mut self, filter: LabelFilter) -> Self {
        self.request.previous = filter;
        self
    }

    /// Accepted labels for the current bar
    pub fn current(mut self, filter: LabelFilter) -> Self {
        self.request.current = filter;
        self
    }

    pub fn window(mut self, window: WindowMode) -> Self {
        self.request.window = window;
        self
    }

    /// Shorthand for `window(WindowMode::Lookback { depth })`
    pub fn lookback_depth(self, depth: usize) -> Self {
        self.window(WindowMode::Lookback { depth })
    }

    pub fn color_aware(mut self, enable: bool) -> Self {
        self.request.options.color_aware = enable;
        self
    }

    pub fn comparison(mut self, comparison: Comparison) -> Self {
        self.request.options.comparison = comparison;
        self
    }

    pub fn open_bars(mut self, policy: OpenBarPolicy) -> Self {
        self.request.open_bars = policy;
        self
    }

    pub fn continuity(mut self, config: ContinuityConfig) -> Self {
        self.request.continuity = Some(config);
        self
    }

    pub fn alignment(mut self, filter: AlignmentFilter) -> Self {
        self.request.alignment = filter;
        self
    }

    /// Worker threads
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.request.concurrency = workers;
        self
    }

    /// Upper bound for one provider call
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = timeout;
        self
    }

    /// Symbols per call for batching providers
    pub fn batch_size(mut self, size: usize) -> Self {
        self.request.batch_size = size;
        self
    }

    /// Clock used to recognise in-progress bars; defaults to the scan start time
    pub fn as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.request.as_of = Some(as_of);
        self
    }

    pub fn build(self) -> Result<ScanRequest> {
        self.request.validate()?;
        Ok(self.request)
    }
}

// ============================================================
// SCAN RESULTS
// ============================================================

/// Direction of the matched bar's body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    #[inline]
    pub fn of<T: OHLC + ?Sized>(bar: &T) -> Self {
        if bar.is_bullish() {
            Direction::Up
        } else {
            Direction::Down
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Direction::Up => "Up",
            Direction::Down => "Down",
        })
    }
}

/// One matching symbol
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ScanResult {
    pub symbol: String,
    pub timeframe: Interval,
    pub previous: StratLabel,
    pub current: StratLabel,
    pub direction: Direction,
    pub close: f64,
    /// Start of the matched current bar
    pub bar_time: DateTime<Utc>,
    /// Bars between the matched current bar and the latest closed bar
    pub offset: usize,
    pub continuity: Option<Continuity>,
}

/// Why a symbol produced no row
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SkipReason {
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(ProviderError),

    #[error("insufficient data: need {need} closed bars, got {got}")]
    InsufficientData { need: usize, got: usize },

    #[error("malformed bar at index {index}: {reason}")]
    MalformedBar { index: usize, reason: &'static str },

    #[error("no pattern match")]
    NoMatch,
}

impl From<StratError> for SkipReason {
    fn from(err: StratError) -> Self {
        match err {
            StratError::MalformedBar { index, reason } => SkipReason::MalformedBar { index, reason },
            StratError::InsufficientData { need, got } => SkipReason::InsufficientData { need, got },
            StratError::Provider(e) => SkipReason::ProviderUnavailable(e),
            other => SkipReason::ProviderUnavailable(ProviderError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedSymbol {
    pub symbol: String,
    pub reason: SkipReason,
}

/// Terminal state of one symbol
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolOutcome {
    Accepted(ScanResult),
    Skipped(SkippedSymbol),
}

impl SymbolOutcome {
    fn skipped(symbol: String, reason: SkipReason) -> Self {
        SymbolOutcome::Skipped(SkippedSymbol { symbol, reason })
    }

    pub fn symbol(&self) -> &str {
        match self {
            SymbolOutcome::Accepted(row) => &row.symbol,
            SymbolOutcome::Skipped(skip) => &skip.symbol,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, SymbolOutcome::Accepted(_))
    }
}

/// Skip counts by reason
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipSummary {
    pub provider_unavailable: usize,
    pub insufficient_data: usize,
    pub malformed: usize,
    pub no_match: usize,
}

/// Outcome of a completed (or cancelled) scan
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub rows: Vec<ScanResult>,
    pub skipped: Vec<SkippedSymbol>,
    pub universe_size: usize,
    /// Set when the scan stopped before every symbol was processed
    pub cancelled: bool,
}

impl ScanReport {
    pub fn new(universe_size: usize) -> Self {
        Self {
            universe_size,
            ..Self::default()
        }
    }

    pub fn push(&mut self, outcome: SymbolOutcome) {
        match outcome {
            SymbolOutcome::Accepted(row) => self.rows.push(row),
            SymbolOutcome::Skipped(skip) => self.skipped.push(skip),
        }
    }

    /// Symbols that reached a terminal state
    pub fn processed(&self) -> usize {
        self.rows.len() + self.skipped.len()
    }

    /// True if the scan ran and matched nothing
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Secondary filter on the current label over the computed rows
    pub fn filter_current<'a>(&'a self, filter: &'a LabelFilter) -> impl Iterator<Item = &'a ScanResult> + 'a {
        self.rows.iter().filter(move |row| filter.accepts(row.current))
    }

    /// Matched symbols, sorted
    pub fn symbols(&self) -> Vec<&str> {
        let mut symbols: Vec<&str> = self.rows.iter().map(|r| r.symbol.as_str()).collect();
        symbols.sort_unstable();
        symbols
    }

    pub fn summary(&self) -> SkipSummary {
        let mut summary = SkipSummary::default();
        for skip in &self.skipped {
            match skip.reason {
                SkipReason::ProviderUnavailable(_) => summary.provider_unavailable += 1,
                SkipReason::InsufficientData { .. } => summary.insufficient_data += 1,
                SkipReason::MalformedBar { .. } => summary.malformed += 1,
                SkipReason::NoMatch => summary.no_match += 1,
            }
        }
        summary
    }
}

/// Cooperative cancellation flag shared between the caller and the scan
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================
// SCANNER
// ============================================================

type Fetched = Vec<(String, std::result::Result<BarSeries, ProviderError>)>;

#[derive(Debug, Clone, Copy)]
struct ScanContext {
    as_of: DateTime<Utc>,
}

impl ScanContext {
    fn new(request: &ScanRequest) -> Self {
        Self {
            as_of: request.as_of.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Matched {
    previous: StratLabel,
    current: StratLabel,
    bar: Bar,
    offset: usize,
    last_close: f64,
}

/// Runs scan requests against a provider
pub struct Scanner<P: MarketDataProvider> {
    provider: P,
}

impl<P: MarketDataProvider> Scanner<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Lazy sequential scan. Creating a new iterator restarts the scan.
    pub fn iter<'a>(&'a self, request: &'a ScanRequest) -> ScanIter<'a, P> {
        ScanIter::new(self, request)
    }

    /// Scan the universe on a worker pool.
    pub fn run(&self, request: &ScanRequest, cancel: &CancelToken) -> Result<ScanReport> {
        self.run_with(request, cancel, |_| {})
    }

    /// Like [`run`](Self::run), reporting each outcome as it completes.
    pub fn run_with<F>(&self, request: &ScanRequest, cancel: &CancelToken, on_outcome: F) -> Result<ScanReport>
    where
        F: Fn(&SymbolOutcome) + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(request.concurrency)
            .thread_name(|i| format!("strat-scan-{i}"))
            .build()
            .map_err(|e| StratError::InvalidConfig(format!("worker pool: {e}")))?;

        let ctx = ScanContext::new(request);
        info!(
            symbols = request.universe.len(),
            timeframe = %request.timeframe,
            previous = %request.previous,
            current = %request.current,
            workers = request.concurrency,
            "scan started"
        );

        let chunk_size = self.chunk_size(request);
        let outcomes: Vec<Vec<SymbolOutcome>> = pool.install(|| {
            request
                .universe
                .par_chunks(chunk_size)
                .map(|chunk| {
                    if cancel.is_cancelled() {
                        return Vec::new();
                    }
                    let outcomes = self.scan_chunk(request, &ctx, chunk);
                    outcomes.iter().for_each(&on_outcome);
                    outcomes
                })
                .collect()
        });

        let mut report = ScanReport::new(request.universe.len());
        for outcome in outcomes.into_iter().flatten() {
            report.push(outcome);
        }
        report.cancelled = report.processed() < report.universe_size;

        let summary = report.summary();
        info!(
            matches = report.rows.len(),
            processed = report.processed(),
            provider_unavailable = summary.provider_unavailable,
            insufficient_data = summary.insufficient_data,
            malformed = summary.malformed,
            cancelled = report.cancelled,
            "scan finished"
        );
        Ok(report)
    }

    fn chunk_size(&self, request: &ScanRequest) -> usize {
        if self.provider.supports_batch() {
            request.batch_size
        } else {
            1
        }
    }

    /// Fetch, classify and filter one group of symbols.
    fn scan_chunk(&self, request: &ScanRequest, ctx: &ScanContext, symbols: &[String]) -> Vec<SymbolOutcome> {
        let timeframe = request.timeframe;
        let mut outcomes = Vec::with_capacity(symbols.len());
        let mut matched = Vec::new();

        for (symbol, fetched) in self.fetch(request, symbols, timeframe.interval, timeframe.lookback) {
            let evaluated = fetched
                .map_err(SkipReason::ProviderUnavailable)
                .and_then(|series| self.evaluate(request, ctx, &series));
            match evaluated {
                Ok(m) => matched.push((symbol, m)),
                Err(reason) => outcomes.push(SymbolOutcome::skipped(symbol, reason)),
            }
        }

        let mut signals = match &request.continuity {
            Some(config) if !matched.is_empty() => self.continuity(request, config, &matched),
            _ => HashMap::new(),
        };

        for (symbol, m) in matched {
            let continuity = signals.remove(&symbol);
            if !request.alignment.accepts(continuity.as_ref().map(|c| c.signal)) {
                outcomes.push(SymbolOutcome::skipped(symbol, SkipReason::NoMatch));
                continue;
            }
            outcomes.push(SymbolOutcome::Accepted(ScanResult {
                symbol,
                timeframe: timeframe.interval,
                previous: m.previous,
                current: m.current,
                direction: Direction::of(&m.bar),
                close: m.bar.close,
                bar_time: m.bar.time,
                offset: m.offset,
                continuity,
            }));
        }

        outcomes.iter().for_each(log_outcome);
        outcomes
    }

    /// Classify the trailing windows of one series.
    fn evaluate(&self, request: &ScanRequest, ctx: &ScanContext, series: &BarSeries) -> std::result::Result<Matched, SkipReason> {
        let bars = series.closed_bars(request.open_bars, request.timeframe.interval, ctx.as_of);
        let Some(last) = bars.last() else {
            return Err(SkipReason::InsufficientData {
                need: MIN_SCAN_BARS,
                got: 0,
            });
        };
        if bars.len() < MIN_SCAN_BARS {
            return Err(SkipReason::InsufficientData {
                need: MIN_SCAN_BARS,
                got: bars.len(),
            });
        }

        let classifier = StratClassifier::new(request.options);
        for offset in 0..request.window.depth() {
            let Some(end) = bars.len().checked_sub(offset) else {
                break;
            };
            if end < MIN_SCAN_BARS {
                break;
            }
            let curr = end - 1;
            let previous = classifier.classify_at(bars, curr - 1)?;
            let current = classifier.classify_at(bars, curr)?;
            if request.previous.accepts(previous) && request.current.accepts(current) {
                return Ok(Matched {
                    previous,
                    current,
                    bar: bars[curr],
                    offset,
                    last_close: last.close,
                });
            }
        }

        Err(SkipReason::NoMatch)
    }

    /// Continuity for matched symbols. Symbols missing any frame get no entry.
    fn continuity(&self, request: &ScanRequest, config: &ContinuityConfig, matched: &[(String, Matched)]) -> HashMap<String, Continuity> {
        let symbols: Vec<String> = matched.iter().map(|(s, _)| s.clone()).collect();
        let closes: HashMap<&str, f64> = matched
            .iter()
            .map(|(s, m)| (s.as_str(), m.last_close))
            .collect();
        let mut frames: HashMap<String, Option<Vec<FrameReading>>> = symbols
            .iter()
            .map(|s| (s.clone(), Some(Vec::with_capacity(config.intervals.len()))))
            .collect();

        for &interval in &config.intervals {
            for (symbol, fetched) in self.fetch(request, &symbols, interval, interval.probe_lookback()) {
                let reading = match fetched {
                    Ok(series) => series
                        .last()
                        .filter(|bar| bar.validate().is_ok())
                        .zip(closes.get(symbol.as_str()))
                        .map(|(bar, close)| FrameReading::read(interval, bar, *close, config.mode)),
                    Err(e) => {
                        debug!(symbol = %symbol, %interval, error = %e, "continuity frame unavailable");
                        None
                    },
                };
                if let Some(slot) = frames.get_mut(&symbol) {
                    match reading {
                        Some(r) => {
                            if let Some(list) = slot {
                                list.push(r);
                            }
                        },
                        None => *slot = None,
                    }
                }
            }
        }

        frames
            .into_iter()
            .filter_map(|(symbol, readings)| Some((symbol, Continuity::from_frames(readings?)?)))
            .collect()
    }

    /// One result per requested symbol. The timeout is checked on wall-clock time once the
    /// provider returns.
    fn fetch(&self, request: &ScanRequest, symbols: &[String], interval: Interval, lookback: Duration) -> Fetched {
        let timeout = request.timeout;

        if self.provider.supports_batch() {
            let batch = BatchRequest {
                symbols,
                interval,
                lookback,
                timeout,
            };
            let started = Instant::now();
            let mut results: HashMap<String, _> = self.provider.fetch_batch(&batch).into_iter().collect();
            let elapsed = started.elapsed();
            return symbols
                .iter()
                .map(|symbol| {
                    let result = results.remove(symbol).unwrap_or_else(|| Ok(BarSeries::default()));
                    (symbol.clone(), within_timeout(result, elapsed, timeout))
                })
                .collect();
        }

        symbols
            .iter()
            .map(|symbol| {
                let single = FetchRequest {
                    symbol,
                    interval,
                    lookback,
                    timeout,
                };
                let started = Instant::now();
                let result = self.provider.fetch_bars(&single);
                (symbol.clone(), within_timeout(result, started.elapsed(), timeout))
            })
            .collect()
    }
}

fn within_timeout<T>(
    result: std::result::Result<T, ProviderError>,
    elapsed: Duration,
    timeout: Duration,
) -> std::result::Result<T, ProviderError> {
    if elapsed > timeout {
        Err(ProviderError::Timeout { after: elapsed })
    } else {
        result
    }
}

fn log_outcome(outcome: &SymbolOutcome) {
    match outcome {
        SymbolOutcome::Accepted(row) => {
            debug!(symbol = %row.symbol, previous = %row.previous, current = %row.current, "match")
        },
        SymbolOutcome::Skipped(skip) => match &skip.reason {
            SkipReason::ProviderUnavailable(e) => {
                warn!(symbol = %skip.symbol, error = %e, "provider unavailable, symbol skipped")
            },
            SkipReason::MalformedBar { index, reason } => {
                warn!(symbol = %skip.symbol, index = *index, reason = *reason, "malformed bar, symbol skipped")
            },
            SkipReason::InsufficientData { need, got } => {
                debug!(symbol = %skip.symbol, need = *need, got = *got, "insufficient data")
            },
            SkipReason::NoMatch => debug!(symbol = %skip.symbol, "no match"),
        },
    }
}

// ============================================================
// SCAN ITERATOR
// ============================================================

/// Lazy, sequential scan yielding one outcome per symbol
pub struct ScanIter<'a, P: MarketDataProvider> {
    scanner: &'a Scanner<P>,
    request: &'a ScanRequest,
    ctx: ScanContext,
    chunks: std::slice::Chunks<'a, String>,
    pending: VecDeque<SymbolOutcome>,
    remaining: usize,
    cancel: Option<CancelToken>,
}

impl<'a, P: MarketDataProvider> ScanIter<'a, P> {
    fn new(scanner: &'a Scanner<P>, request: &'a ScanRequest) -> Self {
        Self {
            scanner,
            request,
            ctx: ScanContext::new(request),
            chunks: request.universe.chunks(scanner.chunk_size(request)),
            pending: VecDeque::new(),
            remaining: request.universe.len(),
            cancel: None,
        }
    }

    /// Stop yielding new symbols once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl<'a, P: MarketDataProvider> Iterator for ScanIter<'a, P> {
    type Item = SymbolOutcome;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(outcome) = self.pending.pop_front() {
                self.remaining = self.remaining.saturating_sub(1);
                return Some(outcome);
            }
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                return None;
            }
            let chunk = self.chunks.next()?;
            self.pending
                .extend(self.scanner.scan_chunk(self.request, &self.ctx, chunk));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.pending.len(), Some(self.remaining))
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        detectors::{ContinuityMode, LabelKind},
        provider::InMemoryProvider,
        timeframe::TimeframePreset,
    };
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
    }

    fn bar(d: u32, o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar::new(day(d), o, h, l, c)
    }

    fn daily() -> Timeframe {
        TimeframePreset::Daily.timeframe()
    }

    #[test]
    fn test_bar_validation() {
        assert!(bar(1, 100.0, 110.0, 90.0, 105.0).validate().is_ok());
        assert!(bar(1, 100.0, 100.0, 100.0, 100.0).validate().is_ok());

        let cases = [
            (bar(1, 100.0, 90.0, 110.0, 100.0), "high < low"),
            (bar(1, f64::NAN, 110.0, 90.0, 100.0), "non-finite price"),
            (bar(1, 100.0, f64::INFINITY, 90.0, 100.0), "non-finite price"),
            (bar(1, 0.0, 110.0, 90.0, 100.0), "non-positive price"),
            (bar(1, 120.0, 110.0, 90.0, 100.0), "open outside high/low range"),
            (bar(1, 100.0, 110.0, 90.0, 80.0), "close outside high/low range"),
        ];
        for (b, expected) in cases {
            match b.validate() {
                Err(StratError::MalformedBar { reason, .. }) => assert_eq!(reason, expected),
                other => panic!("expected malformed bar, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_ohlc_ext() {
        let b = bar(1, 100.0, 110.0, 90.0, 105.0);
        assert_eq!(b.range(), 20.0);
        assert!(b.is_bullish());
        assert_eq!(Direction::of(&b), Direction::Up);
        assert_eq!(Direction::of(&bar(1, 100.0, 110.0, 90.0, 100.0)), Direction::Down);
    }

    #[test]
    fn test_series_sorts_and_dedups() {
        let series = BarSeries::new(vec![
            bar(3, 10.0, 11.0, 9.0, 10.0),
            bar(1, 10.0, 11.0, 9.0, 10.0),
            bar(2, 10.0, 11.0, 9.0, 10.0),
            bar(2, 10.5, 12.0, 9.5, 11.0),
        ]);
        let times: Vec<_> = series.bars().iter().map(|b| b.time).collect();
        assert_eq!(times, vec![day(1), day(2), day(3)]);
        assert_eq!(series.bars()[1].close, 11.0);
    }

    #[test]
    fn test_closed_bars_policies() {
        let series = BarSeries::new(vec![
            bar(1, 10.0, 11.0, 9.0, 10.0),
            bar(2, 10.0, 11.0, 9.0, 10.0),
            bar(3, 10.0, 11.0, 9.0, 10.0),
        ]);
        let now = day(3) + chrono::Duration::hours(12);

        assert_eq!(series.closed_bars(OpenBarPolicy::AssumeClosed, Interval::Day, now).len(), 3);
        assert_eq!(series.closed_bars(OpenBarPolicy::DropLast, Interval::Day, now).len(), 2);
        // day 3 has not ended at noon
        assert_eq!(series.closed_bars(OpenBarPolicy::Detect, Interval::Day, now).len(), 2);
        // after midnight it has
        assert_eq!(series.closed_bars(OpenBarPolicy::Detect, Interval::Day, day(4)).len(), 3);
        // weekly period starting day 1 is still running on day 4
        assert_eq!(series.closed_bars(OpenBarPolicy::Detect, Interval::Week, day(4)).len(), 0);

        assert!(BarSeries::default()
            .closed_bars(OpenBarPolicy::DropLast, Interval::Day, now)
            .is_empty());
    }

    #[test]
    fn test_closed_bars_prefers_provider_flag() {
        let series = BarSeries::new(vec![
            bar(1, 10.0, 11.0, 9.0, 10.0).with_closed(true),
            bar(2, 10.0, 11.0, 9.0, 10.0).with_closed(true),
            bar(3, 10.0, 11.0, 9.0, 10.0).with_closed(false),
        ]);
        let later = day(20);
        assert_eq!(series.closed_bars(OpenBarPolicy::Detect, Interval::Day, later).len(), 2);

        let early = day(2);
        let flagged = BarSeries::new(vec![bar(1, 10.0, 11.0, 9.0, 10.0).with_closed(true)]);
        assert_eq!(flagged.closed_bars(OpenBarPolicy::Detect, Interval::Week, early).len(), 1);
    }

    #[test]
    fn test_builder_defaults() {
        let request = ScanRequest::builder([" AAA", "BBB", "AAA", ""], daily())
            .build()
            .unwrap();
        assert_eq!(request.universe(), &["AAA".to_string(), "BBB".to_string()]);
        assert!(request.previous().is_empty());
        assert!(request.current().is_empty());
        assert_eq!(request.window(), WindowMode::Latest);
        assert_eq!(request.open_bars(), OpenBarPolicy::Detect);
        assert_eq!(request.concurrency(), DEFAULT_CONCURRENCY);
        assert_eq!(request.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(request.batch_size(), DEFAULT_BATCH_SIZE);
        assert!(request.continuity().is_none());

        let other = request.with_universe(["CCC"]);
        assert_eq!(other.universe(), &["CCC".to_string()]);
        assert_eq!(other.timeframe(), request.timeframe());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let base = || ScanRequest::builder(["AAA"], daily());
        let cases = [
            ScanRequest::builder(["AAA"], Timeframe::new(Interval::Day, Duration::ZERO)).build(),
            base().concurrency(0).build(),
            base().timeout(Duration::ZERO).build(),
            base().batch_size(0).build(),
            base().lookback_depth(0).build(),
            base()
                .current(LabelFilter::parse(["2U-G"]).unwrap())
                .build(),
            base()
                .continuity(ContinuityConfig::new([], ContinuityMode::ScanClose))
                .build(),
            base()
                .continuity(ContinuityConfig::new([Interval::Day], ContinuityMode::ScanClose))
                .build(),
            base().alignment(AlignmentFilter::Bullish).build(),
            base()
                .comparison(Comparison::Inclusive)
                .previous(LabelFilter::kinds([LabelKind::Undefined]))
                .build(),
            base()
                .comparison(Comparison::Inclusive)
                .current(LabelFilter::parse(["undefined"]).unwrap())
                .build(),
        ];
        for case in cases {
            let err = case.unwrap_err();
            assert!(err.is_configuration(), "unexpected error {err}");
        }

        assert!(base()
            .color_aware(true)
            .current(LabelFilter::parse(["2U-G"]).unwrap())
            .build()
            .is_ok());
        assert!(base()
            .current(LabelFilter::kinds([LabelKind::Undefined]))
            .build()
            .is_ok());
        assert!(base()
            .comparison(Comparison::Inclusive)
            .current(LabelFilter::kinds([LabelKind::Undefined, LabelKind::Inside]))
            .build()
            .is_ok());
        assert!(base()
            .continuity(ContinuityConfig::coarser_than(Interval::Day))
            .alignment(AlignmentFilter::Aligned)
            .build()
            .is_ok());
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_within_timeout() {
        let ok: std::result::Result<u8, ProviderError> = Ok(1);
        assert_eq!(
            within_timeout(ok.clone(), Duration::from_millis(5), Duration::from_millis(10)),
            Ok(1)
        );
        assert!(matches!(
            within_timeout(ok, Duration::from_millis(11), Duration::from_millis(10)),
            Err(ProviderError::Timeout { .. })
        ));
    }

    #[test]
    fn test_report_summary_and_filter() {
        let row = |symbol: &str, current: StratLabel| ScanResult {
            symbol: symbol.to_string(),
            timeframe: Interval::Day,
            previous: StratLabel::Inside,
            current,
            direction: Direction::Up,
            close: 10.0,
            bar_time: day(1),
            offset: 0,
            continuity: None,
        };
        let mut report = ScanReport::new(5);
        report.push(SymbolOutcome::Accepted(row("BBB", StratLabel::Outside)));
        report.push(SymbolOutcome::Accepted(row("AAA", StratLabel::DirectionalUp(None))));
        report.push(SymbolOutcome::skipped("C".into(), SkipReason::NoMatch));
        report.push(SymbolOutcome::skipped(
            "D".into(),
            SkipReason::InsufficientData { need: 3, got: 2 },
        ));
        report.push(SymbolOutcome::skipped(
            "E".into(),
            SkipReason::ProviderUnavailable(ProviderError::RateLimited),
        ));

        assert_eq!(report.processed(), 5);
        assert_eq!(report.symbols(), vec!["AAA", "BBB"]);
        assert_eq!(
            report.summary(),
            SkipSummary {
                provider_unavailable: 1,
                insufficient_data: 1,
                malformed: 0,
                no_match: 1,
            }
        );

        let outside = LabelFilter::kinds([LabelKind::Outside]);
        let filtered: Vec<_> = report.filter_current(&outside).map(|r| r.symbol.as_str()).collect();
        assert_eq!(filtered, vec!["BBB"]);
        assert_eq!(report.rows.len(), 2);
    }

    #[test]
    fn test_skip_reason_from_error() {
        assert_eq!(
            SkipReason::from(StratError::MalformedBar {
                index: 2,
                reason: "high < low"
            }),
            SkipReason::MalformedBar {
                index: 2,
                reason: "high < low"
            }
        );
        assert_eq!(
            SkipReason::from(StratError::Provider(ProviderError::NotFound)),
            SkipReason::ProviderUnavailable(ProviderError::NotFound)
        );
    }

    #[test]
    fn test_iterator_size_hint() {
        let scanner = Scanner::new(InMemoryProvider::new());
        let request = ScanRequest::builder(["A", "B", "C"], daily()).build().unwrap();
        let mut iter = scanner.iter(&request);
        assert_eq!(iter.size_hint(), (0, Some(3)));
        assert!(iter.next().is_some());
        assert_eq!(iter.size_hint().1, Some(2));
        assert_eq!(iter.count(), 2);
    }
}
