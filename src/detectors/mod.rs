//! STRAT detectors
//!
//! - **strat**: bar-pair classification (1 / 2U / 2D / 3) and label filters.
//! - **continuity**: multi-timeframe continuity signal and the alignment filter.

/// Generate `with_defaults()` -> `Self::default()` for multiple detector types.
macro_rules! impl_with_defaults {
  ($($detector:ty),* $(,)?) => {
    $(impl $detector {
      pub fn with_defaults() -> Self { Self::default() }
    })*
  };
}

pub mod continuity;
pub mod strat;

pub use continuity::*;
pub use strat::*;
