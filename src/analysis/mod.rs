//! Analysis modules.
//!
//! Harmonic decomposition, thresholding, event detection and the grid-wide
//! statistics built from them.

pub mod aggregator;
pub mod events;
pub mod harmonic;
pub mod threshold;

pub use aggregator::{hottest_pixels, summarize, yearly_onsets};
pub use events::detect_grid;
pub use harmonic::HarmonicModel;
pub use threshold::{exceedance_mask, global_percentile};
