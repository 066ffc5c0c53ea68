//! Configuration for drishti-eye

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Camera device opened through OpenCV (requires the `opencv` feature)
    Opencv,
    /// Image file refreshed by an external grabber
    Snapshot,
}

/// Camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Camera device index (0, 1, 2, etc.)
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Upper bound on a single frame grab
    pub capture_timeout_ms: u64,
    pub source: SourceKind,
    /// Image read by the snapshot source
    pub snapshot_path: PathBuf,
    /// Snapshots older than this count as a capture failure
    pub snapshot_max_age_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            fps: 30,
            capture_timeout_ms: 2000,
            source: SourceKind::Opencv,
            snapshot_path: PathBuf::from("./snapshot.png"),
            snapshot_max_age_ms: 5000,
        }
    }
}

impl CameraConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.fps == 0 || self.fps > 120 {
            return Err("Camera fps must be between 1 and 120".to_string());
        }

        if self.width == 0 || self.height == 0 {
            return Err("Resolution must be non-zero".to_string());
        }

        if self.width > 7680 || self.height > 4320 {
            return Err("Resolution too large (max 8K)".to_string());
        }

        if self.index > 100 {
            return Err("Camera index too large (max 100)".to_string());
        }

        if self.capture_timeout_ms == 0 {
            return Err("capture_timeout_ms must be > 0".to_string());
        }

        Ok(())
    }
}

/// Background subtraction and blob confirmation tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Connected components smaller than this (pixels) are discarded
    pub min_blob_area: u32,
    /// Consecutive frames before a blob counts as stable
    pub stability_frames: u32,
    /// Steady-state background learning rate; 0 means `1 / history`
    pub learning_rate: f32,
    /// Frames the background model averages over
    pub history: u32,
    /// Absolute intensity difference that marks a pixel as foreground
    pub var_threshold: f32,
    /// Learning rate multiplier applied to foreground pixels
    pub foreground_learning_factor: f32,
    /// IoU needed to continue a track on the next frame
    pub iou_threshold: f32,
    /// Cap on tracks kept per zone
    pub max_tracks_per_zone: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_blob_area: 500,
            stability_frames: 3,
            learning_rate: 0.0,
            history: 50,
            var_threshold: 25.0,
            foreground_learning_factor: 0.25,
            iou_threshold: 0.3,
            max_tracks_per_zone: 64,
        }
    }
}

impl DetectorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.stability_frames == 0 {
            return Err("stability_frames must be > 0".to_string());
        }

        if self.history == 0 {
            return Err("history must be > 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.learning_rate) {
            return Err("learning_rate must be between 0.0 and 1.0".to_string());
        }

        if !(0.0..=1.0).contains(&self.foreground_learning_factor) {
            return Err("foreground_learning_factor must be between 0.0 and 1.0".to_string());
        }

        if !(self.var_threshold > 0.0 && self.var_threshold < 255.0) {
            return Err("var_threshold must be between 0 and 255".to_string());
        }

        if !(self.iou_threshold > 0.0 && self.iou_threshold <= 1.0) {
            return Err("iou_threshold must be in (0.0, 1.0]".to_string());
        }

        if self.max_tracks_per_zone == 0 {
            return Err("max_tracks_per_zone must be > 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_config_default() {
        let config = CameraConfig::default();
        assert_eq!(config.index, 0);
        assert_eq!(config.fps, 30);
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.source, SourceKind::Opencv);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_camera_config_validation_fps() {
        let mut config = CameraConfig::default();
        config.fps = 0;
        assert!(config.validate().is_err());
        config.fps = 121;
        assert!(config.validate().is_err());
        config.fps = 120;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_camera_config_validation_resolution() {
        let mut config = CameraConfig::default();
        config.width = 0;
        assert!(config.validate().is_err());

        config.width = 7681;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_camera_config_validation_index_and_timeout() {
        let mut config = CameraConfig::default();
        config.index = 101;
        assert!(config.validate().is_err());

        let mut config = CameraConfig::default();
        config.capture_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detector_config_default_is_valid() {
        let config = DetectorConfig::default();
        assert_eq!(config.history, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_detector_config_validation() {
        let mut config = DetectorConfig::default();
        config.stability_frames = 0;
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.learning_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.var_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.iou_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_source_kind_wire_format() {
        let kind: SourceKind = serde_json::from_str("\"snapshot\"").unwrap();
        assert_eq!(kind, SourceKind::Snapshot);
    }
}
