//! Market data provider abstraction.
//!
//! [`MarketDataProvider`] is the seam between the scanner and any bar source. Providers
//! return bars in ascending time order, an empty series when a symbol has no data, and an
//! error only for transport-level failures.
//!
//! [`InMemoryProvider`] serves prepared series and is what the tests (and replays of captured
//! data) run against. [`resample`] builds coarser bars for intervals a source lacks.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Datelike, TimeZone, Utc};

use crate::{timeframe::Interval, Bar, BarSeries};

// ============================================================
// ERRORS
// ============================================================

/// Transport-level failures reported by providers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by provider")]
    RateLimited,

    #[error("Fetch timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Data not found")]
    NotFound,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// ============================================================
// REQUESTS
// ============================================================

/// Single-symbol bar request.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub symbol: &'a str,
    pub interval: Interval,
    pub lookback: Duration,
    /// Providers must give up after this long.
    pub timeout: Duration,
}

/// Multi-symbol bar request for providers that can fetch in one round trip.
#[derive(Debug, Clone, Copy)]
pub struct BatchRequest<'a> {
    pub symbols: &'a [String],
    pub interval: Interval,
    pub lookback: Duration,
    pub timeout: Duration,
}

impl<'a> BatchRequest<'a> {
    /// Per-symbol request with the same interval, lookback and timeout.
    pub fn single(&self, symbol: &'a str) -> FetchRequest<'a> {
        FetchRequest {
            symbol,
            interval: self.interval,
            lookback: self.lookback,
            timeout: self.timeout,
        }
    }
}

// ============================================================
// PROVIDER TRAIT
// ============================================================

/// Source of bar series.
pub trait MarketDataProvider: Send + Sync {
    /// Bars for one symbol in ascending order, empty when the source has none.
    ///
    /// Implementations must give up after `request.timeout`. The scanner reports a slow call as
    /// [`ProviderError::Timeout`] once it returns, but it cannot interrupt a call that never
    /// does, and such a call holds its worker thread for good.
    fn fetch_bars(&self, request: &FetchRequest<'_>) -> Result<BarSeries, ProviderError>;

    /// Whether [`fetch_batch`](Self::fetch_batch) does real batching.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Fetch several symbols. The default issues one call per symbol.
    fn fetch_batch(&self, request: &BatchRequest<'_>) -> Vec<(String, Result<BarSeries, ProviderError>)> {
        request
            .symbols
            .iter()
            .map(|symbol| (symbol.clone(), self.fetch_bars(&request.single(symbol))))
            .collect()
    }
}

macro_rules! forward_provider {
  ($($wrapper:ty),* $(,)?) => {
    $(impl<P: MarketDataProvider + ?Sized> MarketDataProvider for $wrapper {
      fn fetch_bars(&self, request: &FetchRequest<'_>) -> Result<BarSeries, ProviderError> {
        (**self).fetch_bars(request)
      }

      fn supports_batch(&self) -> bool {
        (**self).supports_batch()
      }

      fn fetch_batch(&self, request: &BatchRequest<'_>) -> Vec<(String, Result<BarSeries, ProviderError>)> {
        (**self).fetch_batch(request)
      }
    })*
  };
}

forward_provider!(&P, Box<P>, Arc<P>);

// ============================================================
// IN-MEMORY PROVIDER
// ============================================================

/// Provider backed by prepared series.
///
/// Unknown symbols yield an empty series. Failures can be injected per symbol, and an
/// artificial latency can be set to exercise timeouts.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    series: HashMap<(String, Interval), BarSeries>,
    failures: HashMap<String, ProviderError>,
    batching: bool,
    latency: Option<Duration>,
    calls: AtomicUsize,
    batch_calls: AtomicUsize,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, symbol: impl Into<String>, interval: Interval, bars: impl Into<BarSeries>) -> Self {
        self.insert(symbol, interval, bars);
        self
    }

    pub fn insert(&mut self, symbol: impl Into<String>, interval: Interval, bars: impl Into<BarSeries>) {
        self.series.insert((symbol.into(), interval), bars.into());
    }

    pub fn with_failure(mut self, symbol: impl Into<String>, error: ProviderError) -> Self {
        self.failures.insert(symbol.into(), error);
        self
    }

    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.batching = enabled;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Single-symbol fetches served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Batch fetches served so far.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::Relaxed)
    }

    fn lookup(&self, symbol: &str, interval: Interval) -> Result<BarSeries, ProviderError> {
        if let Some(err) = self.failures.get(symbol) {
            return Err(err.clone());
        }
        Ok(self
            .series
            .get(&(symbol.to_string(), interval))
            .cloned()
            .unwrap_or_default())
    }

    fn wait(&self) {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
    }
}

impl MarketDataProvider for InMemoryProvider {
    fn fetch_bars(&self, request: &FetchRequest<'_>) -> Result<BarSeries, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.wait();
        self.lookup(request.symbol, request.interval)
    }

    fn supports_batch(&self) -> bool {
        self.batching
    }

    fn fetch_batch(&self, request: &BatchRequest<'_>) -> Vec<(String, Result<BarSeries, ProviderError>)> {
        if !self.batching {
            return request
                .symbols
                .iter()
                .map(|symbol| (symbol.clone(), self.fetch_bars(&request.single(symbol))))
                .collect();
        }
        self.batch_calls.fetch_add(1, Ordering::Relaxed);
        self.wait();
        request
            .symbols
            .iter()
            .map(|symbol| (symbol.clone(), self.lookup(symbol, request.interval)))
            .collect()
    }
}

// ============================================================
// RESAMPLING
// ============================================================

/// Aggregate bars into `target` periods.
///
/// Fixed-length targets bucket by `floor(timestamp / length)` from the Unix epoch, shifted to a
/// Monday for week multiples; month-based targets bucket by calendar month. Each output bar starts at its bucket start and takes the
/// first open, max high, min low, last close and summed volume. A bucket containing a bar
/// flagged open is flagged open; otherwise the flag is left unknown, so the scanner decides
/// from the clock.
pub fn resample(bars: &[Bar], target: Interval) -> Vec<Bar> {
    let mut out: Vec<Bar> = Vec::new();
    let mut current_key: Option<i64> = None;

    for bar in bars {
        let key = bucket_key(bar.time, target);
        if current_key == Some(key) {
            if let Some(agg) = out.last_mut() {
                agg.high = agg.high.max(bar.high);
                agg.low = agg.low.min(bar.low);
                agg.close = bar.close;
                agg.volume += bar.volume;
                if bar.closed == Some(false) {
                    agg.closed = Some(false);
                }
                continue;
            }
        }

        let mut agg = *bar;
        agg.time = bucket_start(key, target).unwrap_or(bar.time);
        agg.closed = (bar.closed == Some(false)).then_some(false);
        out.push(agg);
        current_key = Some(key);
    }

    out
}

fn bucket_key(time: DateTime<Utc>, target: Interval) -> i64 {
    match target.months() {
        Some(months) => {
            let month_index = i64::from(time.year()) * 12 + i64::from(time.month0());
            month_index.div_euclid(i64::from(months))
        },
        None => {
            let length = i64::try_from(target.nominal_seconds()).unwrap_or(i64::MAX);
            (time.timestamp() - epoch_offset(length)).div_euclid(length)
        },
    }
}

fn bucket_start(key: i64, target: Interval) -> Option<DateTime<Utc>> {
    match target.months() {
        Some(months) => {
            let month_index = key * i64::from(months);
            let year = i32::try_from(month_index.div_euclid(12)).ok()?;
            let month = u32::try_from(month_index.rem_euclid(12)).ok()? + 1;
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
        },
        None => {
            let length = i64::try_from(target.nominal_seconds()).ok()?;
            let start = key.checked_mul(length)?.checked_add(epoch_offset(length))?;
            Utc.timestamp_opt(start, 0).single()
        },
    }
}

/// 1970-01-01 was a Thursday; week-based buckets start on the following Monday.
fn epoch_offset(length: i64) -> i64 {
    const WEEK: i64 = 7 * 86_400;
    if length % WEEK == 0 {
        4 * 86_400
    } else {
        0
    }
}
