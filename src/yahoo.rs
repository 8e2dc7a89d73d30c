//! Yahoo Finance v8 chart provider
//!
//! Native intervals are `60m`, `1d`, `1wk`, `1mo` and `3mo`. The 4-hour, 2-day and 2-week
//! timeframes are resampled from the next finer native interval. Bar times are normalised to
//! period starts in UTC so the scanner can tell whether the last bar has closed.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use reqwest::{blocking::Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::{
    provider::{resample, FetchRequest, MarketDataProvider, ProviderError},
    timeframe::Interval,
    Bar, BarSeries,
};

pub const CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

/// Hourly history is only served for the last 730 days.
const INTRADAY_MAX_LOOKBACK: Duration = Duration::from_secs(729 * 24 * 60 * 60);

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Blocking Yahoo Finance client
#[derive(Debug, Clone)]
pub struct YahooProvider {
    client: Client,
    base_url: String,
}

impl YahooProvider {
    pub fn new() -> Result<Self, ProviderError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: CHART_URL.to_string(),
        })
    }

    /// Point the client at another chart endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

/// Native interval to request and the target to resample it into.
fn source_interval(interval: Interval) -> (&'static str, Option<Interval>) {
    match interval {
        Interval::FourHour => ("60m", Some(Interval::FourHour)),
        Interval::Day => ("1d", None),
        Interval::TwoDay => ("1d", Some(Interval::TwoDay)),
        Interval::Week => ("1wk", None),
        Interval::TwoWeek => ("1wk", Some(Interval::TwoWeek)),
        Interval::Month => ("1mo", None),
        Interval::Quarter => ("3mo", None),
    }
}

/// Yahoo uses `-` where listings use `.` (BRK.B -> BRK-B).
pub fn yahoo_symbol(symbol: &str) -> String {
    symbol.trim().replace('.', "-")
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout { after: timeout }
    } else {
        ProviderError::Network(err.to_string())
    }
}

impl MarketDataProvider for YahooProvider {
    fn fetch_bars(&self, request: &FetchRequest<'_>) -> Result<BarSeries, ProviderError> {
        let (code, resample_to) = source_interval(request.interval);
        let lookback = match request.interval {
            Interval::FourHour => request.lookback.min(INTRADAY_MAX_LOOKBACK),
            _ => request.lookback,
        };
        let period2 = Utc::now().timestamp();
        let period1 = period2.saturating_sub(i64::try_from(lookback.as_secs()).unwrap_or(i64::MAX));

        let url = format!("{}/{}", self.base_url, yahoo_symbol(request.symbol));
        debug!(%url, interval = code, period1, period2, "yahoo chart request");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", code.to_string()),
                ("includePrePost", "false".to_string()),
            ])
            .timeout(request.timeout)
            .send()
            .map_err(|e| transport_error(e, request.timeout))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if status == StatusCode::NOT_FOUND {
            debug!(symbol = request.symbol, "unknown to yahoo");
            return Ok(BarSeries::default());
        }
        if !status.is_success() {
            return Err(ProviderError::Network(format!("HTTP {status}")));
        }

        let body = response
            .text()
            .map_err(|e| transport_error(e, request.timeout))?;
        let mut bars = parse_chart(&body)?;

        if code != "60m" {
            for bar in &mut bars {
                bar.time = period_start(bar.time, request.interval);
            }
        }
        Ok(match resample_to {
            Some(target) => BarSeries::new(resample(&bars, target)),
            None => BarSeries::new(bars),
        })
    }
}

/// Midnight UTC at the start of the bar's period: the Monday for week-based intervals, the
/// first of the month for month-based ones, otherwise the bar's own date.
fn period_start(time: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
    let day = if interval.months().is_some() { 1 } else { time.day() };
    let Some(midnight) = Utc
        .with_ymd_and_hms(time.year(), time.month(), day, 0, 0, 0)
        .single()
    else {
        return time;
    };
    match interval {
        Interval::Week | Interval::TwoWeek => {
            midnight - chrono::Duration::days(i64::from(time.weekday().num_days_from_monday()))
        },
        _ => midnight,
    }
}

// ============================================================
// CHART RESPONSE
// ============================================================

#[derive(Deserialize, Debug)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Deserialize, Debug)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Deserialize, Debug)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Deserialize, Debug)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Deserialize, Debug)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct Quote {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<f64>>,
}

/// Decode a v8 chart document into bars, dropping rows with a missing price.
pub fn parse_chart(body: &str) -> Result<Vec<Bar>, ProviderError> {
    let response: ChartResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))?;

    if let Some(err) = response.chart.error {
        if err.code.eq_ignore_ascii_case("not found") {
            return Ok(Vec::new());
        }
        return Err(ProviderError::Unknown(err.description));
    }

    let Some(result) = response.chart.result.and_then(|mut r| r.pop()) else {
        return Ok(Vec::new());
    };
    let Some(quote) = result.indicators.quote.first() else {
        return Ok(Vec::new());
    };

    let mut bars = Vec::with_capacity(result.timestamp.len());
    for (i, &ts) in result.timestamp.iter().enumerate() {
        let field = |column: &[Option<f64>]| column.get(i).copied().flatten();
        let (Some(o), Some(h), Some(l), Some(c)) = (
            field(&quote.open[..]),
            field(&quote.high[..]),
            field(&quote.low[..]),
            field(&quote.close[..]),
        ) else {
            continue;
        };
        let Some(time) = Utc.timestamp_opt(ts, 0).single() else {
            continue;
        };
        bars.push(Bar::new(time, o, h, l, c).with_volume(field(&quote.volume[..]).unwrap_or(0.0)));
    }
    Ok(bars)
}
