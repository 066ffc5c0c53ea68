//! Grayscale frames as consumed by the detector.

use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage};

/// One captured frame, already converted to 8-bit luma.
#[derive(Debug, Clone)]
pub struct Frame {
    image: GrayImage,
    captured_at: DateTime<Utc>,
    sequence: u64,
}

impl Frame {
    pub fn new(image: GrayImage, captured_at: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            image,
            captured_at,
            sequence,
        }
    }

    /// Convert any decoded image to a grayscale frame.
    pub fn from_dynamic(image: DynamicImage, captured_at: DateTime<Utc>, sequence: u64) -> Self {
        Self::new(image.to_luma8(), captured_at, sequence)
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Raw luma bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }
}
