//! STRAT bar classification.
//!
//! Every bar is labelled relative to the bar before it:
//!
//! | label | code | rule                                                |
//! |-------|------|-----------------------------------------------------|
//! | Inside      | `1`  | range strictly contained in the previous range |
//! | Outside     | `3`  | breaks both the previous high and low          |
//! | Directional | `2U` | breaks only the previous high                  |
//! | Directional | `2D` | breaks only the previous low                   |
//! | Undefined   |      | breaks neither side without being contained    |

use std::{fmt, str::FromStr};

use crate::{OHLCExt, Result, StratError, OHLC};

// ============================================================
// LABELS
// ============================================================

/// Bar colour: green iff close > open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Color {
    Green,
    Red,
}

impl Color {
    #[inline]
    pub fn of<T: OHLC + ?Sized>(bar: &T) -> Self {
        if bar.close() > bar.open() {
            Color::Green
        } else {
            Color::Red
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Color::Green => "G",
            Color::Red => "R",
        }
    }
}

/// Label family without colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelKind {
    Inside,
    Outside,
    DirectionalUp,
    DirectionalDown,
    Undefined,
}

impl LabelKind {
    pub fn code(self) -> &'static str {
        match self {
            LabelKind::Inside => "1",
            LabelKind::Outside => "3",
            LabelKind::DirectionalUp => "2U",
            LabelKind::DirectionalDown => "2D",
            LabelKind::Undefined => "undefined",
        }
    }

    pub fn is_directional(self) -> bool {
        matches!(self, LabelKind::DirectionalUp | LabelKind::DirectionalDown)
    }
}

/// Classification of one bar against its predecessor.
///
/// Directional labels carry a colour only when colour-aware classification was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StratLabel {
    Inside,
    Outside,
    DirectionalUp(Option<Color>),
    DirectionalDown(Option<Color>),
    Undefined,
}

impl StratLabel {
    pub fn kind(self) -> LabelKind {
        match self {
            StratLabel::Inside => LabelKind::Inside,
            StratLabel::Outside => LabelKind::Outside,
            StratLabel::DirectionalUp(_) => LabelKind::DirectionalUp,
            StratLabel::DirectionalDown(_) => LabelKind::DirectionalDown,
            StratLabel::Undefined => LabelKind::Undefined,
        }
    }

    pub fn color(self) -> Option<Color> {
        match self {
            StratLabel::DirectionalUp(c) | StratLabel::DirectionalDown(c) => c,
            _ => None,
        }
    }

    #[inline]
    pub fn code(self) -> &'static str {
        self.kind().code()
    }
}

impl fmt::Display for StratLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.color() {
            Some(color) => write!(f, "{}-{}", self.code(), color.suffix()),
            None => f.write_str(self.code()),
        }
    }
}

impl serde::Serialize for StratLabel {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

// ============================================================
// FILTERS
// ============================================================

/// One accepted label: a kind plus an optional colour. No colour matches either colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelPattern {
    pub kind: LabelKind,
    pub color: Option<Color>,
}

impl LabelPattern {
    pub const fn new(kind: LabelKind) -> Self {
        Self { kind, color: None }
    }

    pub const fn colored(kind: LabelKind, color: Color) -> Self {
        Self {
            kind,
            color: Some(color),
        }
    }

    #[inline]
    pub fn matches(&self, label: StratLabel) -> bool {
        self.kind == label.kind()
            && match self.color {
                None => true,
                Some(c) => label.color() == Some(c),
            }
    }
}

impl fmt::Display for LabelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.color {
            Some(color) => write!(f, "{}-{}", self.kind.code(), color.suffix()),
            None => f.write_str(self.kind.code()),
        }
    }
}

impl FromStr for LabelPattern {
    type Err = StratError;

    /// Parses `1`, `inside`, `1 (Inside)`, `3`, `outside`, `2U`, `2D`, `undefined`,
    /// and coloured directionals such as `2U-G` or `2d-red`.
    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        let lower = raw.to_ascii_lowercase();
        let (head, color) = match lower.split_once('-') {
            Some((head, tail)) => {
                let color = match tail.trim() {
                    "g" | "green" => Color::Green,
                    "r" | "red" => Color::Red,
                    _ => return Err(invalid_label(raw)),
                };
                (head.trim(), Some(color))
            },
            None => (lower.as_str(), None),
        };

        let kind = match head {
            "1" | "inside" | "1 (inside)" => LabelKind::Inside,
            "3" | "outside" | "3 (outside)" => LabelKind::Outside,
            "2u" => LabelKind::DirectionalUp,
            "2d" => LabelKind::DirectionalDown,
            "undefined" | "unknown" => LabelKind::Undefined,
            _ => return Err(invalid_label(raw)),
        };

        if color.is_some() && !kind.is_directional() {
            return Err(StratError::InvalidConfig(format!(
                "label '{raw}' has a colour but only 2U/2D are coloured"
            )));
        }

        Ok(Self { kind, color })
    }
}

fn invalid_label(raw: &str) -> StratError {
    StratError::InvalidConfig(format!("unknown STRAT label '{raw}'"))
}

/// Set of accepted labels. An empty filter accepts every label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    patterns: Vec<LabelPattern>,
}

impl LabelFilter {
    /// Filter that accepts everything.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new(patterns: impl IntoIterator<Item = LabelPattern>) -> Self {
        let mut filter = Self::default();
        for p in patterns {
            if !filter.patterns.contains(&p) {
                filter.patterns.push(p);
            }
        }
        filter
    }

    /// Filter from label kinds, ignoring colour.
    pub fn kinds(kinds: impl IntoIterator<Item = LabelKind>) -> Self {
        Self::new(kinds.into_iter().map(LabelPattern::new))
    }

    /// Parse every entry with [`LabelPattern::from_str`].
    pub fn parse<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = entries
            .into_iter()
            .map(|s| s.as_ref().parse::<LabelPattern>())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(patterns))
    }

    #[inline]
    pub fn accepts(&self, label: StratLabel) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(label))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[LabelPattern] {
        &self.patterns
    }

    /// True if some pattern can only match a coloured label.
    pub fn requires_color(&self) -> bool {
        self.patterns.iter().any(|p| p.color.is_some())
    }

    /// True if the filter is non-empty and accepts only `Undefined`.
    pub fn only_undefined(&self) -> bool {
        !self.patterns.is_empty() && self.patterns.iter().all(|p| p.kind == LabelKind::Undefined)
    }
}

impl FromStr for LabelFilter {
    type Err = StratError;

    /// Comma separated list; an empty string is the accept-all filter.
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s.split(',').map(str::trim).filter(|p| !p.is_empty()))
    }
}

impl fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.patterns.is_empty() {
            return f.write_str("any");
        }
        for (i, p) in self.patterns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{p}")?;
        }
        Ok(())
    }
}

// ============================================================
// CLASSIFIER
// ============================================================

/// Range comparison used for the Inside test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// `high < prev.high && low > prev.low`
    #[default]
    Strict,
    /// `high <= prev.high && low >= prev.low`; an equal range is Inside.
    Inclusive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifyOptions {
    pub color_aware: bool,
    pub comparison: Comparison,
}

/// STRAT classifier for consecutive bar pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StratClassifier {
    pub options: ClassifyOptions,
}

impl_with_defaults!(StratClassifier);

impl StratClassifier {
    pub fn new(options: ClassifyOptions) -> Self {
        Self { options }
    }

    /// Number of bars needed for one label.
    #[inline]
    pub fn min_bars(&self) -> usize {
        2
    }

    /// Classify `curr` against `prev`, validating both bars first.
    pub fn classify<T: OHLC + ?Sized>(&self, prev: &T, curr: &T) -> Result<StratLabel> {
        prev.validate()?;
        curr.validate().map_err(|e| e.at_index(1))?;
        Ok(self.classify_unchecked(prev, curr))
    }

    /// Classify without validation. Callers must have validated both bars.
    #[inline]
    pub fn classify_unchecked<T: OHLC + ?Sized>(&self, prev: &T, curr: &T) -> StratLabel {
        let higher = curr.high() > prev.high();
        let lower = curr.low() < prev.low();

        let inside = match self.options.comparison {
            Comparison::Strict => curr.high() < prev.high() && curr.low() > prev.low(),
            Comparison::Inclusive => curr.high() <= prev.high() && curr.low() >= prev.low(),
        };

        let color = self.options.color_aware.then(|| Color::of(curr));

        if inside {
            StratLabel::Inside
        } else if higher && lower {
            StratLabel::Outside
        } else if higher {
            StratLabel::DirectionalUp(color)
        } else if lower {
            StratLabel::DirectionalDown(color)
        } else {
            StratLabel::Undefined
        }
    }

    /// Label bars `[i - 1, i]` of a slice; `i` must be at least 1.
    /// Malformed bars are reported with their slice index.
    pub fn classify_at<T: OHLC>(&self, bars: &[T], index: usize) -> Result<StratLabel> {
        let got = bars.len();
        let (prev, curr) = match index.checked_sub(1) {
            Some(p) => (bars.get(p), bars.get(index)),
            None => (None, None),
        };
        match (prev, curr) {
            (Some(prev), Some(curr)) => {
                prev.validate().map_err(|e| e.at_index(index - 1))?;
                curr.validate().map_err(|e| e.at_index(index))?;
                Ok(self.classify_unchecked(prev, curr))
            },
            _ => Err(StratError::InsufficientData {
                need: index.max(1) + 1,
                got,
            }),
        }
    }

    /// Label every bar against its predecessor. The first bar has no label.
    pub fn classify_series<T: OHLC>(&self, bars: &[T]) -> Result<Vec<Option<StratLabel>>> {
        for (i, bar) in bars.iter().enumerate() {
            bar.validate().map_err(|e| e.at_index(i))?;
        }
        let mut labels = Vec::with_capacity(bars.len());
        if !bars.is_empty() {
            labels.push(None);
        }
        labels.extend(
            bars.windows(2)
                .map(|pair| Some(self.classify_unchecked(&pair[0], &pair[1]))),
        );
        Ok(labels)
    }
}

/// Classify `curr` against `prev` with the given options.
pub fn classify<T: OHLC + ?Sized>(prev: &T, curr: &T, options: ClassifyOptions) -> Result<StratLabel> {
    StratClassifier::new(options).classify(prev, curr)
}

// ============================================================
// TESTS
// ============================================================
