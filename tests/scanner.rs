//! Integration tests for the multi-symbol scanner.
//!
//! These run complete scans against the in-memory provider.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use stratscan::{
    detectors::{
        AlignmentFilter, ContinuityConfig, ContinuityMode, ContinuitySignal, FrameBias, LabelFilter,
        LabelKind, StratLabel,
    },
    provider::{BatchRequest, FetchRequest, InMemoryProvider, MarketDataProvider, ProviderError},
    timeframe::{Interval, Timeframe},
    Bar, BarSeries, CancelToken, Direction, OpenBarPolicy, ScanRequest, ScanRequestBuilder, Scanner,
    SkipReason, StratError, SymbolOutcome,
};

type Row = (f64, f64, f64, f64);

/// Previous bar inside, current bar outside.
const INSIDE_OUTSIDE: [Row; 3] = [(9.0, 10.0, 8.0, 9.5), (8.7, 9.0, 8.5, 8.8), (8.8, 9.5, 8.2, 9.4)];

/// Identical bars: every label is Undefined.
const FLAT: [Row; 3] = [(10.0, 11.0, 9.0, 10.0), (10.0, 11.0, 9.0, 10.0), (10.0, 11.0, 9.0, 10.0)];

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
}

fn as_of() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

fn bars(rows: &[Row]) -> Vec<Bar> {
    rows.iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| Bar::new(day(i as u32 + 1), o, h, l, c))
        .collect()
}

fn daily(symbols: &[&str]) -> ScanRequestBuilder {
    ScanRequest::builder(symbols.iter().copied(), Timeframe::days(Interval::Day, 30)).as_of(as_of())
}

fn inside_then_outside(symbols: &[&str]) -> ScanRequestBuilder {
    daily(symbols)
        .previous(LabelFilter::kinds([LabelKind::Inside]))
        .current(LabelFilter::kinds([LabelKind::Outside]))
}

fn skip_reason<'a>(outcomes: &'a [SymbolOutcome], symbol: &str) -> Option<&'a SkipReason> {
    outcomes.iter().find_map(|o| match o {
        SymbolOutcome::Skipped(skip) if skip.symbol == symbol => Some(&skip.reason),
        _ => None,
    })
}

#[test]
fn test_inside_then_outside_match() {
    let provider = InMemoryProvider::new().with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE));
    let request = inside_then_outside(&["AAA"]).build().unwrap();

    let report = Scanner::new(provider).run(&request, &CancelToken::new()).unwrap();
    assert_eq!(report.rows.len(), 1);
    assert!(!report.cancelled);

    let row = &report.rows[0];
    assert_eq!(row.symbol, "AAA");
    assert_eq!(row.previous, StratLabel::Inside);
    assert_eq!(row.current, StratLabel::Outside);
    assert_eq!(row.direction, Direction::Up);
    assert_eq!(row.close, 9.4);
    assert_eq!(row.timeframe, Interval::Day);
    assert_eq!(row.bar_time, day(3));
    assert_eq!(row.offset, 0);
    assert!(row.continuity.is_none());
}

#[test]
fn test_empty_filters_accept_everything() {
    let provider = InMemoryProvider::new()
        .with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE))
        .with_series("FLAT", Interval::Day, bars(&FLAT));
    let request = daily(&["AAA", "FLAT"]).build().unwrap();

    let report = Scanner::new(provider).run(&request, &CancelToken::new()).unwrap();
    assert_eq!(report.symbols(), vec!["AAA", "FLAT"]);
    let flat = report.rows.iter().find(|r| r.symbol == "FLAT").unwrap();
    assert_eq!(flat.current, StratLabel::Undefined);
    assert_eq!(flat.direction, Direction::Down);
}

#[test]
fn test_insufficient_data_is_skipped() {
    let provider = InMemoryProvider::new().with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE[..2]));
    let request = inside_then_outside(&["AAA", "NODATA"]).build().unwrap();
    let scanner = Scanner::new(provider);

    let outcomes: Vec<_> = scanner.iter(&request).collect();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        skip_reason(&outcomes, "AAA"),
        Some(&SkipReason::InsufficientData { need: 3, got: 2 })
    );
    assert_eq!(
        skip_reason(&outcomes, "NODATA"),
        Some(&SkipReason::InsufficientData { need: 3, got: 0 })
    );

    let report = scanner.run(&request, &CancelToken::new()).unwrap();
    assert!(report.is_empty());
    assert_eq!(report.summary().insufficient_data, 2);
}

#[test]
fn test_malformed_bar_skips_only_that_symbol() {
    let mut broken = bars(&INSIDE_OUTSIDE);
    broken[2].high = 7.0;
    let provider = InMemoryProvider::new()
        .with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE))
        .with_series("BAD", Interval::Day, broken);
    let request = inside_then_outside(&["AAA", "BAD"]).build().unwrap();

    let scanner = Scanner::new(provider);
    let outcomes: Vec<_> = scanner.iter(&request).collect();
    assert_eq!(
        skip_reason(&outcomes, "BAD"),
        Some(&SkipReason::MalformedBar {
            index: 2,
            reason: "high < low"
        })
    );

    let report = scanner.run(&request, &CancelToken::new()).unwrap();
    assert_eq!(report.symbols(), vec!["AAA"]);
    assert_eq!(report.summary().malformed, 1);
}

#[test]
fn test_provider_errors_are_isolated() {
    let provider = InMemoryProvider::new()
        .with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE))
        .with_failure("LIMITED", ProviderError::RateLimited)
        .with_failure("DOWN", ProviderError::Network("connection reset".into()));
    let request = inside_then_outside(&["AAA", "LIMITED", "DOWN"]).build().unwrap();

    let scanner = Scanner::new(provider);
    let outcomes: Vec<_> = scanner.iter(&request).collect();
    assert_eq!(
        skip_reason(&outcomes, "LIMITED"),
        Some(&SkipReason::ProviderUnavailable(ProviderError::RateLimited))
    );
    assert!(matches!(
        skip_reason(&outcomes, "DOWN"),
        Some(SkipReason::ProviderUnavailable(ProviderError::Network(_)))
    ));

    let report = scanner.run(&request, &CancelToken::new()).unwrap();
    assert_eq!(report.symbols(), vec!["AAA"]);
    assert_eq!(report.summary().provider_unavailable, 2);
    assert_eq!(report.processed(), 3);
}

#[test]
fn test_slow_provider_times_out() {
    let provider = InMemoryProvider::new()
        .with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE))
        .with_latency(Duration::from_millis(40));
    let request = inside_then_outside(&["AAA", "BBB"])
        .timeout(Duration::from_millis(5))
        .build()
        .unwrap();

    let report = Scanner::new(provider).run(&request, &CancelToken::new()).unwrap();
    assert!(report.is_empty());
    assert_eq!(report.skipped.len(), 2);
    assert!(report
        .skipped
        .iter()
        .all(|s| matches!(s.reason, SkipReason::ProviderUnavailable(ProviderError::Timeout { .. }))));
}

#[test]
fn test_cancel_before_start() {
    let provider = InMemoryProvider::new().with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE));
    let request = inside_then_outside(&["AAA", "BBB", "CCC"]).build().unwrap();
    let token = CancelToken::new();
    token.cancel();

    let scanner = Scanner::new(&provider);
    let report = scanner.run(&request, &token).unwrap();
    assert!(report.cancelled);
    assert_eq!(report.processed(), 0);
    assert_eq!(report.universe_size, 3);
    assert_eq!(provider.calls(), 0);
}

#[test]
fn test_iterator_stops_when_cancelled() {
    let provider = InMemoryProvider::new().with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE));
    let request = inside_then_outside(&["AAA", "BBB", "CCC", "DDD"]).build().unwrap();
    let scanner = Scanner::new(provider);
    let token = CancelToken::new();

    let mut iter = scanner.iter(&request).with_cancel(token.clone());
    assert_eq!(iter.next().map(|o| o.symbol().to_string()), Some("AAA".to_string()));
    token.cancel();
    assert!(iter.next().is_none());

    // a fresh iterator restarts the scan
    assert_eq!(scanner.iter(&request).count(), 4);
}

#[test]
fn test_lookback_finds_older_window() {
    let mut rows = INSIDE_OUTSIDE.to_vec();
    rows.push((9.4, 9.8, 8.5, 9.7));
    let provider = InMemoryProvider::new().with_series("AAA", Interval::Day, bars(&rows));
    let scanner = Scanner::new(provider);

    let latest = inside_then_outside(&["AAA"]).build().unwrap();
    let report = scanner.run(&latest, &CancelToken::new()).unwrap();
    assert!(report.is_empty());
    assert_eq!(report.summary().no_match, 1);

    let lookback = inside_then_outside(&["AAA"]).lookback_depth(2).build().unwrap();
    let report = scanner.run(&lookback, &CancelToken::new()).unwrap();
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].offset, 1);
    assert_eq!(report.rows[0].bar_time, day(3));
    assert_eq!(report.rows[0].close, 9.4);
}

#[test]
fn test_lookback_prefers_most_recent_match() {
    // two inside/outside pairs; the later one wins
    let rows = [
        (9.0, 10.0, 8.0, 9.5),
        (8.7, 9.0, 8.5, 8.8),
        (8.8, 9.5, 8.2, 9.4),
        (9.0, 9.3, 8.4, 9.1),
        (9.1, 9.6, 8.0, 8.1),
    ];
    let provider = InMemoryProvider::new().with_series("AAA", Interval::Day, bars(&rows));
    let request = inside_then_outside(&["AAA"]).lookback_depth(5).build().unwrap();

    let report = Scanner::new(provider).run(&request, &CancelToken::new()).unwrap();
    assert_eq!(report.rows[0].offset, 0);
    assert_eq!(report.rows[0].direction, Direction::Down);
}

#[test]
fn test_in_progress_bar_is_dropped() {
    let mut series = bars(&INSIDE_OUTSIDE);
    series.push(Bar::new(day(4), 9.4, 9.8, 8.5, 9.7).with_closed(false));
    let provider = InMemoryProvider::new().with_series("AAA", Interval::Day, series);
    let scanner = Scanner::new(provider);

    let detect = inside_then_outside(&["AAA"]).build().unwrap();
    let report = scanner.run(&detect, &CancelToken::new()).unwrap();
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].bar_time, day(3));

    let assume_closed = inside_then_outside(&["AAA"])
        .open_bars(OpenBarPolicy::AssumeClosed)
        .build()
        .unwrap();
    assert!(scanner.run(&assume_closed, &CancelToken::new()).unwrap().is_empty());
}

#[test]
fn test_unfinished_period_is_dropped_by_clock() {
    let provider = InMemoryProvider::new().with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE));
    // noon on the day of the outside bar
    let request = inside_then_outside(&["AAA"])
        .as_of(day(3) + chrono::Duration::hours(12))
        .build()
        .unwrap();

    let report = Scanner::new(provider).run(&request, &CancelToken::new()).unwrap();
    assert_eq!(
        report.skipped[0].reason,
        SkipReason::InsufficientData { need: 3, got: 2 }
    );
}

#[test]
fn test_color_aware_filters() {
    let provider = InMemoryProvider::new()
        .with_series("UPG", Interval::Day, bars(&[(10.0, 11.0, 9.0, 10.0), (10.0, 12.0, 9.5, 11.5), (11.0, 12.5, 10.0, 12.0)]))
        .with_series("UPR", Interval::Day, bars(&[(10.0, 11.0, 9.0, 10.0), (10.0, 12.0, 9.5, 11.5), (12.0, 12.5, 10.0, 10.5)]));
    let request = daily(&["UPG", "UPR"])
        .color_aware(true)
        .current(LabelFilter::parse(["2U-G"]).unwrap())
        .build()
        .unwrap();

    let report = Scanner::new(provider).run(&request, &CancelToken::new()).unwrap();
    assert_eq!(report.symbols(), vec!["UPG"]);
    assert_eq!(report.rows[0].current.to_string(), "2U-G");
    assert_eq!(report.rows[0].previous.to_string(), "2U-G");
}

#[test]
fn test_color_filter_requires_color_aware() {
    let err = daily(&["AAA"])
        .current(LabelFilter::parse(["2D-R"]).unwrap())
        .build()
        .unwrap_err();
    assert!(matches!(err, StratError::InvalidConfig(_)));
}

fn continuity_provider() -> InMemoryProvider {
    InMemoryProvider::new()
        .with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE))
        .with_series("AAA", Interval::Week, vec![Bar::new(day(4), 9.0, 9.6, 8.2, 9.4)])
        .with_series("AAA", Interval::Month, vec![Bar::new(day(1), 8.5, 10.0, 8.0, 9.4)])
        .with_series("BBB", Interval::Day, bars(&INSIDE_OUTSIDE))
        .with_series("BBB", Interval::Week, vec![Bar::new(day(4), 9.8, 10.0, 8.2, 9.4)])
        .with_series("BBB", Interval::Month, vec![Bar::new(day(1), 8.5, 10.0, 8.0, 9.4)])
        .with_series("CCC", Interval::Day, bars(&INSIDE_OUTSIDE))
}

#[test]
fn test_continuity_is_attached() {
    let request = inside_then_outside(&["AAA", "BBB", "CCC"])
        .continuity(ContinuityConfig::coarser_than(Interval::Day))
        .build()
        .unwrap();

    let report = Scanner::new(continuity_provider())
        .run(&request, &CancelToken::new())
        .unwrap();
    assert_eq!(report.symbols(), vec!["AAA", "BBB", "CCC"]);

    let find = |s: &str| report.rows.iter().find(|r| r.symbol == s).unwrap();

    let aaa = find("AAA").continuity.as_ref().unwrap();
    assert_eq!(aaa.signal, ContinuitySignal::BullishAligned);
    assert_eq!(aaa.frames.len(), 2);
    assert_eq!(aaa.frames[0].interval, Interval::Week);
    assert_eq!(aaa.frames[0].bias, FrameBias::Bullish);

    let bbb = find("BBB").continuity.as_ref().unwrap();
    assert_eq!(bbb.signal, ContinuitySignal::Mixed);

    // no coarser data
    assert!(find("CCC").continuity.is_none());
}

#[test]
fn test_continuity_coarser_body_mode() {
    let request = inside_then_outside(&["BBB"])
        .continuity(ContinuityConfig::new([Interval::Week], ContinuityMode::CoarserBody))
        .build()
        .unwrap();

    let report = Scanner::new(continuity_provider())
        .run(&request, &CancelToken::new())
        .unwrap();
    let continuity = report.rows[0].continuity.as_ref().unwrap();
    assert_eq!(continuity.signal, ContinuitySignal::BearishAligned);
    assert_eq!(continuity.frames[0].reference, 9.4);
}

#[test]
fn test_alignment_filter() {
    let scanner = Scanner::new(continuity_provider());
    let with = |filter: AlignmentFilter| {
        let request = inside_then_outside(&["AAA", "BBB", "CCC"])
            .continuity(ContinuityConfig::coarser_than(Interval::Day))
            .alignment(filter)
            .build()
            .unwrap();
        scanner.run(&request, &CancelToken::new()).unwrap()
    };

    assert_eq!(with(AlignmentFilter::Bullish).symbols(), vec!["AAA"]);
    assert_eq!(with(AlignmentFilter::Aligned).symbols(), vec!["AAA"]);
    assert!(with(AlignmentFilter::Bearish).is_empty());

    let off = with(AlignmentFilter::Off);
    assert_eq!(off.rows.len(), 3);

    let rejected = with(AlignmentFilter::Bullish);
    assert_eq!(rejected.summary().no_match, 2);
}

#[test]
fn test_batching_provider_is_chunked() {
    let symbols = ["A", "B", "C", "D", "E"];
    let mut provider = InMemoryProvider::new().with_batching(true);
    for s in symbols {
        provider.insert(s, Interval::Day, bars(&INSIDE_OUTSIDE));
    }
    let request = inside_then_outside(&symbols).batch_size(2).build().unwrap();

    let scanner = Scanner::new(&provider);
    let report = scanner.run(&request, &CancelToken::new()).unwrap();
    assert_eq!(report.rows.len(), 5);
    assert_eq!(provider.batch_calls(), 3);
    assert_eq!(provider.calls(), 0);
}

/// Batching provider that never returns anything.
struct EmptyBatches;

impl MarketDataProvider for EmptyBatches {
    fn fetch_bars(&self, _request: &FetchRequest<'_>) -> Result<BarSeries, ProviderError> {
        Err(ProviderError::Unknown("single fetches unsupported".into()))
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn fetch_batch(&self, _request: &BatchRequest<'_>) -> Vec<(String, Result<BarSeries, ProviderError>)> {
        Vec::new()
    }
}

#[test]
fn test_symbol_missing_from_batch_has_no_data() {
    let request = inside_then_outside(&["AAA", "BBB"]).build().unwrap();
    let report = Scanner::new(EmptyBatches).run(&request, &CancelToken::new()).unwrap();
    assert_eq!(report.summary().insufficient_data, 2);
    assert!(!report.cancelled);
}

#[test]
fn test_scan_is_repeatable() {
    let symbols: Vec<String> = (0..40).map(|i| format!("S{i:02}")).collect();
    let mut provider = InMemoryProvider::new();
    for (i, s) in symbols.iter().enumerate() {
        let rows = if i % 3 == 0 { &INSIDE_OUTSIDE } else { &FLAT };
        provider.insert(s.as_str(), Interval::Day, bars(rows));
    }
    let request = ScanRequest::builder(&symbols, Timeframe::days(Interval::Day, 30))
        .as_of(as_of())
        .previous(LabelFilter::kinds([LabelKind::Inside]))
        .concurrency(4)
        .build()
        .unwrap();

    let scanner = Scanner::new(provider);
    let first = scanner.run(&request, &CancelToken::new()).unwrap();
    let second = scanner.run(&request, &CancelToken::new()).unwrap();
    assert_eq!(first.symbols(), second.symbols());
    assert_eq!(first.rows.len(), 14);

    let sequential: Vec<String> = scanner
        .iter(&request)
        .filter(SymbolOutcome::is_accepted)
        .map(|o| o.symbol().to_string())
        .collect();
    assert_eq!(sequential, first.symbols());
}

#[test]
fn test_run_with_reports_every_symbol() {
    let provider = InMemoryProvider::new().with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE));
    let request = inside_then_outside(&["AAA", "BBB", "CCC"]).build().unwrap();
    let seen = AtomicUsize::new(0);

    let report = Scanner::new(provider)
        .run_with(&request, &CancelToken::new(), |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert_eq!(report.processed(), 3);
}

#[test]
fn test_empty_universe() {
    let request = inside_then_outside(&[]).build().unwrap();
    let report = Scanner::new(InMemoryProvider::new())
        .run(&request, &CancelToken::new())
        .unwrap();
    assert!(report.is_empty());
    assert_eq!(report.processed(), 0);
    assert!(!report.cancelled);
}

#[test]
fn test_filter_current_on_results() {
    let provider = InMemoryProvider::new()
        .with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE))
        .with_series("FLAT", Interval::Day, bars(&FLAT));
    let request = daily(&["AAA", "FLAT"]).build().unwrap();
    let report = Scanner::new(provider).run(&request, &CancelToken::new()).unwrap();

    let outside: LabelFilter = "3".parse().unwrap();
    let symbols: Vec<_> = report.filter_current(&outside).map(|r| r.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["AAA"]);
    assert_eq!(report.rows.len(), 2);
}

#[test]
fn test_result_serializes_to_json() {
    let provider = InMemoryProvider::new().with_series("AAA", Interval::Day, bars(&INSIDE_OUTSIDE));
    let request = inside_then_outside(&["AAA"]).build().unwrap();
    let report = Scanner::new(provider).run(&request, &CancelToken::new()).unwrap();

    let value = serde_json::to_value(&report.rows[0]).unwrap();
    assert_eq!(value["symbol"], "AAA");
    assert_eq!(value["timeframe"], "1d");
    assert_eq!(value["previous"], "1");
    assert_eq!(value["current"], "3");
    assert_eq!(value["direction"], "Up");
    assert_eq!(value["close"], 9.4);
    assert!(value["continuity"].is_null());
}
