use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stratscan::{
    config::{ContinuitySection, ScanConfig},
    detectors::{AlignmentFilter, LabelFilter},
    universe::{CachedUniverse, HttpCsvSource, MergedUniverse, SymbolSource},
    yahoo::YahooProvider,
    CancelToken, ScanResult, Scanner,
};

#[derive(Parser)]
#[command(author, version, about = "Scan symbols for STRAT candlestick patterns")]
struct Cli {
    /// Path to a TOML scan config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Timeframe preset ("Daily", "Weekly", "4H", ...) or interval ("1d", "1wk", ...)
    #[arg(short, long)]
    timeframe: Option<String>,

    /// Accepted previous-bar labels, comma separated (e.g. "1,3")
    #[arg(long)]
    prev: Option<String>,

    /// Accepted current-bar labels, comma separated (e.g. "2U,2D")
    #[arg(long)]
    curr: Option<String>,

    /// Symbols to scan instead of the configured universe (e.g. "AAPL,MSFT")
    #[arg(long)]
    symbols: Option<String>,

    /// Search the last N windows instead of only the latest
    #[arg(long)]
    lookback_depth: Option<usize>,

    /// Colour-aware labels (2U-G, 2D-R, ...)
    #[arg(long)]
    color: bool,

    /// Attach weekly/monthly continuity to each match
    #[arg(long)]
    continuity: bool,

    /// Keep only matches whose continuity is off|bullish|bearish|aligned
    #[arg(long)]
    alignment: Option<String>,

    /// Worker threads
    #[arg(long)]
    concurrency: Option<usize>,

    /// Print matches as JSON
    #[arg(long)]
    json: bool,

    /// Secondary filter on the current label, applied to the results
    #[arg(long)]
    only_current: Option<String>,
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_alignment(value: &str) -> anyhow::Result<AlignmentFilter> {
    Ok(match value.trim().to_ascii_lowercase().as_str() {
        "off" => AlignmentFilter::Off,
        "bullish" => AlignmentFilter::Bullish,
        "bearish" => AlignmentFilter::Bearish,
        "aligned" => AlignmentFilter::Aligned,
        other => bail!("unknown alignment filter '{other}'"),
    })
}

fn apply_overrides(cli: &Cli, config: &mut ScanConfig) -> anyhow::Result<()> {
    if let Some(timeframe) = &cli.timeframe {
        config.timeframe = timeframe.clone();
    }
    if let Some(prev) = &cli.prev {
        config.previous = split_list(prev);
    }
    if let Some(curr) = &cli.curr {
        config.current = split_list(curr);
    }
    if let Some(depth) = cli.lookback_depth {
        config.lookback_depth = Some(depth);
    }
    if cli.color {
        config.color_aware = true;
    }
    if cli.continuity && config.continuity.is_none() {
        config.continuity = Some(ContinuitySection::default());
    }
    if let Some(alignment) = &cli.alignment {
        config.alignment = parse_alignment(alignment)?;
    }
    if let Some(workers) = cli.concurrency {
        config.concurrency = workers;
    }
    Ok(())
}

fn load_universe(cli: &Cli, config: &ScanConfig) -> anyhow::Result<Vec<String>> {
    if let Some(symbols) = &cli.symbols {
        return Ok(split_list(symbols));
    }

    let section = &config.universe;
    let mut merged = MergedUniverse::new();
    if section.sp500 {
        let url = section
            .sp500_url
            .as_deref()
            .unwrap_or(stratscan::universe::SP500_CONSTITUENTS_URL);
        let source = HttpCsvSource::new("sp500", url, "Symbol")?;
        merged = merged.with_source(CachedUniverse::with_ttl(source, section.cache_ttl()));
    }
    for source in section.static_sources() {
        merged = merged.with_source(source);
    }
    if merged.is_empty() {
        bail!("universe is empty: enable a source in [universe] or pass --symbols");
    }
    Ok(merged.list_symbols()?)
}

fn print_table(rows: &[&ScanResult]) {
    println!(
        "{:<8} {:<12} {:<12} {:<9} {:>10} {:<10} {:<9}",
        "Ticker", "Previous", "Current", "Direction", "Close", "Continuity", "Timeframe"
    );
    for row in rows {
        let continuity = row
            .continuity
            .as_ref()
            .map(|c| c.signal.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<12} {:<12} {:<9} {:>10.2} {:<10} {:<9}",
            row.symbol,
            row.previous.to_string(),
            row.current.to_string(),
            row.direction.to_string(),
            row.close,
            continuity,
            row.timeframe.to_string(),
        );
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ScanConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => ScanConfig::default(),
    };
    apply_overrides(&cli, &mut config)?;

    // validate before touching the network
    config.build_request(["CHECK"]).context("invalid scan configuration")?;
    let only_current: Option<LabelFilter> = cli
        .only_current
        .as_deref()
        .map(str::parse::<LabelFilter>)
        .transpose()
        .context("invalid --only-current")?;

    let universe = load_universe(&cli, &config)?;
    let request = config.build_request(&universe)?;
    info!(symbols = request.universe().len(), "universe loaded");

    let scanner = Scanner::new(YahooProvider::new()?);
    let report = scanner.run(&request, &CancelToken::new())?;
    if report.cancelled {
        warn!(processed = report.processed(), "scan cancelled");
    }

    let mut rows: Vec<&ScanResult> = match &only_current {
        Some(filter) => report.filter_current(filter).collect(),
        None => report.rows.iter().collect(),
    };
    rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if !rows.is_empty() {
        print_table(&rows);
    }

    let summary = if rows.is_empty() {
        "No matches found".to_string()
    } else {
        format!("Found {} matches", rows.len())
    };
    // keep stdout parseable in JSON mode
    if cli.json {
        eprintln!("{summary}");
    } else {
        println!("{summary}");
    }
    Ok(())
}
