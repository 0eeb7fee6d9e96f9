//! Threshold-crossing spike detection with hoop-based unit classification.

pub mod detector;
pub mod hoops;

pub use detector::{Detection, SpikeDetector};
pub use hoops::{classify, intersects, unit_matches, HoopTable};
