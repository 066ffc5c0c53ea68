//! Frame sources
//!
//! The daemon only sees the [`FrameSource`] trait. Device discovery and
//! backend selection stay outside; the config names one source and the
//! daemon owns it exclusively for its whole run.

use crate::config::{CameraConfig, SourceKind};
use crate::error::{Result, VisionError};
use crate::frame::Frame;
use chrono::Utc;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// A blocking producer of frames.
pub trait FrameSource: Send {
    /// Short human-readable label for logs.
    fn name(&self) -> &str;

    /// Acquire the underlying device. Called once before the first grab.
    fn open(&mut self) -> Result<()>;

    /// Grab the next frame. May block; callers bound it with a timeout.
    fn grab(&mut self) -> Result<Frame>;

    /// Release the underlying device. Must be idempotent.
    fn release(&mut self);
}

/// Build, without opening, the source described by `config`.
pub fn build_source(config: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    config.validate().map_err(VisionError::Config)?;
    let source: Box<dyn FrameSource> = match config.source {
        SourceKind::Snapshot => Box::new(SnapshotSource::new(
            config.snapshot_path.clone(),
            Duration::from_millis(config.snapshot_max_age_ms),
        )),
        #[cfg(feature = "opencv")]
        SourceKind::Opencv => Box::new(opencv_camera::OpenCvCamera::new(config.clone())),
        #[cfg(not(feature = "opencv"))]
        SourceKind::Opencv => {
            return Err(VisionError::Config(
                "camera source \"opencv\" requires building with the opencv feature".to_string(),
            ))
        }
    };
    Ok(source)
}

/// Build and open the source described by `config`.
pub fn open_source(config: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    let mut source = build_source(config)?;
    source.open()?;
    info!(source = source.name(), "frame source opened");
    Ok(source)
}

/// Reads the newest image an external grabber keeps writing to one path.
pub struct SnapshotSource {
    path: PathBuf,
    label: String,
    max_age: Duration,
    sequence: u64,
    opened: bool,
}

impl SnapshotSource {
    pub fn new(path: PathBuf, max_age: Duration) -> Self {
        let label = format!("snapshot:{}", path.display());
        Self {
            path,
            label,
            max_age,
            sequence: 0,
            opened: false,
        }
    }

    fn snapshot_age(&self) -> Result<Duration> {
        let modified = std::fs::metadata(&self.path)?.modified()?;
        Ok(SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO))
    }
}

impl FrameSource for SnapshotSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn open(&mut self) -> Result<()> {
        if !self.path.exists() {
            return Err(VisionError::Camera(format!(
                "snapshot {} does not exist",
                self.path.display()
            )));
        }
        self.opened = true;
        Ok(())
    }

    fn grab(&mut self) -> Result<Frame> {
        if !self.opened {
            return Err(VisionError::Camera("Snapshot source not opened".to_string()));
        }
        let age = self.snapshot_age()?;
        if age > self.max_age {
            return Err(VisionError::Camera(format!(
                "snapshot is stale ({} ms old)",
                age.as_millis()
            )));
        }
        let image = image::open(&self.path)?;
        self.sequence += 1;
        debug!(sequence = self.sequence, "snapshot frame read");
        Ok(Frame::from_dynamic(image, Utc::now(), self.sequence))
    }

    fn release(&mut self) {
        self.opened = false;
    }
}

#[cfg(feature = "opencv")]
mod opencv_camera {
    use super::*;
    use opencv::{
        core::Mat,
        imgproc,
        prelude::*,
        videoio::{VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH},
    };

    /// Camera device opened through OpenCV's videoio.
    pub struct OpenCvCamera {
        config: CameraConfig,
        label: String,
        capture: Option<VideoCapture>,
        sequence: u64,
    }

    impl OpenCvCamera {
        pub fn new(config: CameraConfig) -> Self {
            let label = format!("camera:{}", config.index);
            Self {
                config,
                label,
                capture: None,
                sequence: 0,
            }
        }
    }

    impl FrameSource for OpenCvCamera {
        fn name(&self) -> &str {
            &self.label
        }

        fn open(&mut self) -> Result<()> {
            self.capture = None;

            let mut capture = VideoCapture::new(self.config.index as i32, CAP_ANY).map_err(|e| {
                VisionError::Camera(format!("Failed to open camera {}: {}", self.config.index, e))
            })?;

            if !capture.is_opened()? {
                return Err(VisionError::Camera(format!(
                    "Camera {} failed to open",
                    self.config.index
                )));
            }

            capture
                .set(CAP_PROP_FRAME_WIDTH, self.config.width as f64)
                .map_err(|e| VisionError::Camera(format!("Failed to set width: {}", e)))?;
            capture
                .set(CAP_PROP_FRAME_HEIGHT, self.config.height as f64)
                .map_err(|e| VisionError::Camera(format!("Failed to set height: {}", e)))?;
            capture
                .set(CAP_PROP_FPS, self.config.fps as f64)
                .map_err(|e| VisionError::Camera(format!("Failed to set FPS: {}", e)))?;

            info!(
                "Camera {} initialized at {}x{} @ {}fps",
                self.config.index, self.config.width, self.config.height, self.config.fps
            );
            self.capture = Some(capture);
            Ok(())
        }

        fn grab(&mut self) -> Result<Frame> {
            let capture = self
                .capture
                .as_mut()
                .ok_or_else(|| VisionError::Camera("Camera not initialized".to_string()))?;

            let mut frame = Mat::default();
            if !capture.read(&mut frame)? || frame.empty() {
                return Err(VisionError::Camera("Camera returned no frame".to_string()));
            }

            let mut gray = Mat::default();
            imgproc::cvt_color(&frame, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
            let gray = if gray.is_continuous() { gray } else { gray.try_clone()? };

            let (width, height) = (gray.cols() as u32, gray.rows() as u32);
            let bytes = gray.data_bytes()?.to_vec();
            let image = image::GrayImage::from_raw(width, height, bytes)
                .ok_or_else(|| VisionError::Processing("Frame buffer size mismatch".to_string()))?;

            self.sequence += 1;
            Ok(Frame::new(image, Utc::now(), self.sequence))
        }

        fn release(&mut self) {
            if let Some(mut capture) = self.capture.take() {
                let _ = capture.release();
                info!("Camera {} released", self.config.index);
            }
        }
    }

    impl Drop for OpenCvCamera {
        fn drop(&mut self) {
            self.release();
        }
    }
}

#[cfg(feature = "opencv")]
pub use opencv_camera::OpenCvCamera;
