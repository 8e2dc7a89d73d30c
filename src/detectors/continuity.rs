//! Multi-timeframe continuity (FTFC).
//!
//! Each coarser timeframe is judged bullish or bearish from its most recent bar, which may
//! still be in progress: its open is the reference level for the period.

use crate::{timeframe::Interval, OHLC};

/// How a coarser frame is judged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuityMode {
    /// Latest close on the scan timeframe against the coarser open.
    #[default]
    ScanClose,
    /// Coarser bar's own close against its open.
    CoarserBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FrameBias {
    Bullish,
    Bearish,
    Neutral,
}

/// Summary across all coarser frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ContinuitySignal {
    BullishAligned,
    BearishAligned,
    Mixed,
}

impl std::fmt::Display for ContinuitySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ContinuitySignal::BullishAligned => "bullish",
            ContinuitySignal::BearishAligned => "bearish",
            ContinuitySignal::Mixed => "mixed",
        })
    }
}

/// Reading of one coarser frame.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct FrameReading {
    pub interval: Interval,
    pub open: f64,
    pub reference: f64,
    pub bias: FrameBias,
}

impl FrameReading {
    pub fn read<T: OHLC + ?Sized>(interval: Interval, coarser: &T, scan_close: f64, mode: ContinuityMode) -> Self {
        let reference = match mode {
            ContinuityMode::ScanClose => scan_close,
            ContinuityMode::CoarserBody => coarser.close(),
        };
        let open = coarser.open();
        let bias = if reference > open {
            FrameBias::Bullish
        } else if reference < open {
            FrameBias::Bearish
        } else {
            FrameBias::Neutral
        };
        Self {
            interval,
            open,
            reference,
            bias,
        }
    }
}

/// Continuity attached to a result row.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Continuity {
    pub signal: ContinuitySignal,
    pub frames: Vec<FrameReading>,
}

impl Continuity {
    /// Summarize frame readings. Returns `None` when there are no frames.
    pub fn from_frames(frames: Vec<FrameReading>) -> Option<Self> {
        if frames.is_empty() {
            return None;
        }
        let signal = if frames.iter().all(|f| f.bias == FrameBias::Bullish) {
            ContinuitySignal::BullishAligned
        } else if frames.iter().all(|f| f.bias == FrameBias::Bearish) {
            ContinuitySignal::BearishAligned
        } else {
            ContinuitySignal::Mixed
        };
        Some(Self { signal, frames })
    }
}

/// Coarser frames to read and how to judge them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuityConfig {
    pub intervals: Vec<Interval>,
    pub mode: ContinuityMode,
}

impl ContinuityConfig {
    pub fn new(intervals: impl IntoIterator<Item = Interval>, mode: ContinuityMode) -> Self {
        let mut intervals: Vec<Interval> = intervals.into_iter().collect();
        intervals.sort();
        intervals.dedup();
        Self { intervals, mode }
    }

    /// Weekly and monthly frames that are coarser than `scan`.
    pub fn coarser_than(scan: Interval) -> Self {
        Self::new(
            [Interval::Week, Interval::Month]
                .into_iter()
                .filter(|i| *i > scan),
            ContinuityMode::default(),
        )
    }
}

/// Opt-in filter on the continuity signal. `Off` never rejects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentFilter {
    #[default]
    Off,
    Bullish,
    Bearish,
    /// Either aligned direction.
    Aligned,
}

impl AlignmentFilter {
    pub fn accepts(self, signal: Option<ContinuitySignal>) -> bool {
        match (self, signal) {
            (AlignmentFilter::Off, _) => true,
            (_, None) => false,
            (AlignmentFilter::Bullish, Some(s)) => s == ContinuitySignal::BullishAligned,
            (AlignmentFilter::Bearish, Some(s)) => s == ContinuitySignal::BearishAligned,
            (AlignmentFilter::Aligned, Some(s)) => s != ContinuitySignal::Mixed,
        }
    }
}
