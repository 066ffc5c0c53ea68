//! Foreground detection pipeline

pub mod background;
pub mod blobs;
pub mod detector;
pub mod tracker;

pub use background::{BackgroundModel, ForegroundMask};
pub use blobs::{find_blobs, ZoneMask};
pub use detector::Detector;
pub use tracker::ZoneTracker;
