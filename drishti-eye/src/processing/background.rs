//! Running-average background model with asymmetric learning.
//!
//! Pixels classified as background learn at the full rate; foreground pixels
//! learn at `steady_rate * foreground_learning_factor`. A permanent scene
//! change is still absorbed eventually, but a freshly placed object stays
//! foreground long enough to be confirmed. During warm-up background pixels
//! learn at `1 / frames_seen` so the model converges to the mean of the first
//! `history` frames; foreground pixels never use the warm-up rate, otherwise
//! a briefly present object would leave a ghost behind.

use crate::config::DetectorConfig;
use image::GrayImage;

/// Per-pixel foreground flags for one frame.
#[derive(Debug, Clone, Default)]
pub struct ForegroundMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl ForegroundMask {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> bool {
        self.bits[(y * self.width + x) as usize]
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    fn reset(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.bits.clear();
        self.bits.resize((width * height) as usize, false);
    }
}

pub struct BackgroundModel {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    frames_seen: u32,
    history: u32,
    learning_rate: f32,
    foreground_factor: f32,
    threshold: f32,
    mask: ForegroundMask,
}

impl BackgroundModel {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            width: 0,
            height: 0,
            mean: Vec::new(),
            frames_seen: 0,
            history: config.history.max(1),
            learning_rate: config.learning_rate,
            foreground_factor: config.foreground_learning_factor,
            threshold: config.var_threshold,
            mask: ForegroundMask::default(),
        }
    }

    pub fn frames_seen(&self) -> u32 {
        self.frames_seen
    }

    /// True once the model has been seeded with a frame of the current size.
    pub fn is_initialized(&self) -> bool {
        self.frames_seen > 0
    }

    fn steady_rate(&self) -> f32 {
        if self.learning_rate > 0.0 {
            self.learning_rate
        } else {
            1.0 / self.history as f32
        }
    }

    /// Classify `frame` against the model, then fold it into the model.
    ///
    /// The first frame (or the first after a resolution change) seeds the
    /// model and yields an empty mask.
    pub fn apply(&mut self, frame: &GrayImage) -> &ForegroundMask {
        let (width, height) = frame.dimensions();
        let pixels = frame.as_raw();
        self.mask.reset(width, height);

        if width != self.width || height != self.height || self.frames_seen == 0 {
            self.width = width;
            self.height = height;
            self.mean.clear();
            self.mean.extend(pixels.iter().map(|&p| p as f32));
            self.frames_seen = 1;
            return &self.mask;
        }

        self.frames_seen = self.frames_seen.saturating_add(1);
        let rate = if self.frames_seen < self.history {
            1.0 / self.frames_seen as f32
        } else {
            self.steady_rate()
        };
        let fg_rate = self.steady_rate() * self.foreground_factor;

        for ((mean, &pixel), fg) in self
            .mean
            .iter_mut()
            .zip(pixels.iter())
            .zip(self.mask.bits.iter_mut())
        {
            let value = pixel as f32;
            let diff = value - *mean;
            let is_fg = diff.abs() > self.threshold;
            *fg = is_fg;
            let a = if is_fg { fg_rate } else { rate };
            *mean += a * diff;
        }
        &self.mask
    }

    /// Drop the model; the next frame reseeds it.
    pub fn reset(&mut self) {
        self.mean = Vec::new();
        self.mask = ForegroundMask::default();
        self.frames_seen = 0;
        self.width = 0;
        self.height = 0;
    }

    /// Release spare capacity held by the scratch buffers.
    pub fn shrink(&mut self) {
        self.mean.shrink_to_fit();
        self.mask.bits.shrink_to_fit();
    }
}
