//! Error types for drishti-eye

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Capture timed out after {0} ms")]
    CaptureTimeout(u64),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("OpenCV error: {0}")]
    OpenCv(String),
}

impl VisionError {
    /// Errors a later grab may recover from.
    pub fn is_capture_failure(&self) -> bool {
        matches!(
            self,
            VisionError::Camera(_)
                | VisionError::CaptureTimeout(_)
                | VisionError::Io(_)
                | VisionError::Image(_)
                | VisionError::OpenCv(_)
        )
    }
}

#[cfg(feature = "opencv")]
impl From<opencv::Error> for VisionError {
    fn from(err: opencv::Error) -> Self {
        VisionError::OpenCv(err.message)
    }
}

pub type Result<T> = std::result::Result<T, VisionError>;
