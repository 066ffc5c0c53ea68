//! drishti-eye: camera access and foreground detection for drishti
//!
//! Turns frames from a fixed camera into per-zone tracked blobs. A running
//! background model separates foreground from the scene, connected components
//! are extracted inside each zone, and an IoU tracker counts how many
//! consecutive frames each blob has persisted.

pub mod camera;
pub mod config;
pub mod error;
pub mod frame;
pub mod processing;

pub use camera::{build_source, open_source, FrameSource, SnapshotSource};
pub use config::{CameraConfig, DetectorConfig, SourceKind};
pub use error::{Result, VisionError};
pub use frame::Frame;
pub use processing::Detector;
