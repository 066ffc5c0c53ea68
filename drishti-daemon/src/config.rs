//! Daemon configuration, read from a TOML file at startup.

use crate::error::{DaemonError, Result};
use drishti_eye::config::{CameraConfig, DetectorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Sampling rate while no trigger can fire or nothing is happening.
    pub idle_fps: f64,
    pub active_fps: f64,
    /// Hard ceiling on the sampling rate.
    pub max_fps: f64,
    /// Minimum time spent in active polling once entered.
    pub active_window_secs: f64,
    /// Inactivity after which active polling decays back to idle.
    pub activity_decay_secs: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            idle_fps: 1.0,
            active_fps: 5.0,
            max_fps: 10.0,
            active_window_secs: 10.0,
            activity_decay_secs: 30.0,
        }
    }
}

impl PerformanceConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (name, fps) in [
            ("idle_fps", self.idle_fps),
            ("active_fps", self.active_fps),
            ("max_fps", self.max_fps),
        ] {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(format!("{} must be > 0", name));
            }
        }
        if self.idle_fps > self.active_fps {
            return Err("idle_fps must not exceed active_fps".to_string());
        }
        if self.active_fps > self.max_fps {
            return Err("active_fps must not exceed max_fps".to_string());
        }
        if !(self.active_window_secs.is_finite() && self.active_window_secs >= 0.0) {
            return Err("active_window_secs must be >= 0".to_string());
        }
        if !(self.activity_decay_secs.is_finite() && self.activity_decay_secs >= 0.0) {
            return Err("activity_decay_secs must be >= 0".to_string());
        }
        Ok(())
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.idle_fps)
    }

    pub fn active_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.active_fps)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.max_fps)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Resident set size ceiling; exceeding it restarts the daemon.
    pub max_memory_mb: u64,
    /// Detections between forced cleanups.
    pub cleanup_interval: u64,
    /// Frames the capture worker may hold ahead of the loop.
    pub frame_buffer_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            cleanup_interval: 100,
            frame_buffer_size: 2,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_memory_mb == 0 {
            return Err("max_memory_mb must be > 0".to_string());
        }
        if self.cleanup_interval == 0 {
            return Err("cleanup_interval must be > 0".to_string());
        }
        if !(1..=3).contains(&self.frame_buffer_size) {
            return Err("frame_buffer_size must be between 1 and 3".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub ipc_dir: PathBuf,
    pub triggers_dir: PathBuf,
    pub max_capture_failures: u32,
    /// Refuse to start (or reload) when an enabled unit references a missing zone.
    pub strict_load: bool,
    /// Cycles between stats log lines; 0 disables them.
    pub stats_interval: u64,
    /// Re-exec the binary on restart instead of exiting for a supervisor.
    pub self_respawn: bool,
    pub backup_retention: usize,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            ipc_dir: PathBuf::from("./ipc"),
            triggers_dir: PathBuf::from("./triggers"),
            max_capture_failures: 5,
            strict_load: true,
            stats_interval: 60,
            self_respawn: true,
            backup_retention: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub camera: CameraConfig,
    pub detector: DetectorConfig,
    pub performance: PerformanceConfig,
    pub memory: MemoryConfig,
    pub daemon: DaemonSettings,
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        content.parse()
    }

    /// Load `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Overlay `DRISHTI_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("DRISHTI_IPC_DIR") {
            self.daemon.ipc_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("DRISHTI_TRIGGERS_DIR") {
            self.daemon.triggers_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("DRISHTI_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(index) = lookup("DRISHTI_CAMERA_INDEX").and_then(|v| v.parse().ok()) {
            self.camera.index = index;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.camera
            .validate()
            .and_then(|_| self.detector.validate())
            .and_then(|_| self.performance.validate())
            .and_then(|_| self.memory.validate())
            .map_err(DaemonError::Config)?;
        if self.daemon.max_capture_failures == 0 {
            return Err(DaemonError::Config(
                "max_capture_failures must be > 0".to_string(),
            ));
        }
        if self.daemon.backup_retention == 0 {
            return Err(DaemonError::Config("backup_retention must be > 0".to_string()));
        }
        Ok(())
    }

    /// Deadline for a single frame grab.
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.camera.capture_timeout_ms)
    }
}

impl std::str::FromStr for DaemonConfig {
    type Err = DaemonError;

    fn from_str(content: &str) -> Result<Self> {
        let config: DaemonConfig =
            toml::from_str(content).map_err(|e| DaemonError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.performance.idle_interval(), Duration::from_secs(1));
        assert_eq!(config.performance.active_interval(), Duration::from_millis(200));
        assert!(config.daemon.strict_load);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: DaemonConfig = "".parse().unwrap();
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config: DaemonConfig = r#"
            [camera]
            index = 2
            width = 320
            height = 240

            [detector]
            min_blob_area = 120
            stability_frames = 4

            [performance]
            idle_fps = 0.5
            active_fps = 4.0

            [memory]
            max_memory_mb = 256

            [daemon]
            ipc_dir = "/run/drishti"
            strict_load = false

            [logging]
            level = "debug"
            json = true
        "#
        .parse()
        .unwrap();

        assert_eq!(config.camera.index, 2);
        assert_eq!(config.camera.fps, 30);
        assert_eq!(config.detector.stability_frames, 4);
        assert_eq!(config.detector.history, 50);
        assert_eq!(config.performance.idle_interval(), Duration::from_secs(2));
        assert_eq!(config.memory.max_memory_mb, 256);
        assert_eq!(config.memory.cleanup_interval, 100);
        assert_eq!(config.daemon.ipc_dir, PathBuf::from("/run/drishti"));
        assert!(!config.daemon.strict_load);
        assert!(config.logging.json);
    }

    #[test]
    fn test_rejects_inverted_rates() {
        let err = "[performance]\nidle_fps = 8.0\nactive_fps = 4.0\n"
            .parse::<DaemonConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("idle_fps"));

        let err = "[performance]\nactive_fps = 20.0\n"
            .parse::<DaemonConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("max_fps"));
    }

    #[test]
    fn test_rejects_bad_memory_settings() {
        assert!("[memory]\nframe_buffer_size = 0\n".parse::<DaemonConfig>().is_err());
        assert!("[memory]\nframe_buffer_size = 4\n".parse::<DaemonConfig>().is_err());
        assert!("[memory]\ncleanup_interval = 0\n".parse::<DaemonConfig>().is_err());
    }

    #[test]
    fn test_rejects_unparsable_toml() {
        assert!(matches!(
            "[camera\nindex = 1".parse::<DaemonConfig>(),
            Err(DaemonError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DRISHTI_IPC_DIR", "/tmp/ipc"),
            ("DRISHTI_LOG_LEVEL", "trace"),
            ("DRISHTI_CAMERA_INDEX", "3"),
        ]
        .into_iter()
        .collect();
        let mut config = DaemonConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.daemon.ipc_dir, PathBuf::from("/tmp/ipc"));
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.camera.index, 3);
        assert_eq!(config.daemon.triggers_dir, PathBuf::from("./triggers"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
    }
}
