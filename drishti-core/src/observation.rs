//! Per-frame detection results handed from the detector to the evaluator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pixel rectangle `x, y, w, h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl PixelBox {
    pub fn to_array(self) -> [u32; 4] {
        [self.x, self.y, self.w, self.h]
    }
}

/// Connected foreground component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    pub bbox: PixelBox,
    pub area: u32,
    pub centroid: (f64, f64),
}

/// A blob with an identity carried across frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedBlob {
    pub track_id: u64,
    pub blob: Blob,
    /// Consecutive frames this track has been observed; the stability counter.
    pub hits: u32,
}

/// What the detector saw inside one zone on one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneObservation {
    /// Number of frame pixels inside the zone polygon.
    pub zone_pixels: u64,
    pub tracks: Vec<TrackedBlob>,
}

impl ZoneObservation {
    pub fn empty(zone_pixels: u64) -> Self {
        Self {
            zone_pixels,
            tracks: Vec::new(),
        }
    }

    /// Tracks seen for at least `stability_frames` consecutive frames.
    pub fn stable(&self, stability_frames: u32) -> impl Iterator<Item = &TrackedBlob> {
        let needed = stability_frames.max(1);
        self.tracks.iter().filter(move |t| t.hits >= needed)
    }

    pub fn stable_count(&self, stability_frames: u32) -> u32 {
        self.stable(stability_frames).count() as u32
    }

    /// Tracks whose stability counter reached the threshold on this frame.
    pub fn newly_confirmed(&self, stability_frames: u32) -> u32 {
        let needed = stability_frames.max(1);
        self.tracks.iter().filter(|t| t.hits == needed).count() as u32
    }

    pub fn stable_area(&self, stability_frames: u32) -> u64 {
        self.stable(stability_frames).map(|t| t.blob.area as u64).sum()
    }

    pub fn stable_boxes(&self, stability_frames: u32) -> Vec<[u32; 4]> {
        self.stable(stability_frames).map(|t| t.blob.bbox.to_array()).collect()
    }
}

/// Zones are owned by trigger units, so they are addressed per trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneKey {
    pub trigger_id: String,
    pub zone_id: String,
}

impl ZoneKey {
    pub fn new(trigger_id: impl Into<String>, zone_id: impl Into<String>) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            zone_id: zone_id.into(),
        }
    }
}

impl std::fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.trigger_id, self.zone_id)
    }
}

/// Ephemeral result of one detection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionFrame {
    pub captured_at: DateTime<Utc>,
    pub sequence: u64,
    pub zones: HashMap<ZoneKey, ZoneObservation>,
}

impl DetectionFrame {
    pub fn new(captured_at: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            captured_at,
            sequence,
            zones: HashMap::new(),
        }
    }

    pub fn observation(&self, trigger_id: &str, zone_id: &str) -> Option<&ZoneObservation> {
        self.zones.get(&ZoneKey::new(trigger_id, zone_id))
    }

    pub fn insert(&mut self, key: ZoneKey, observation: ZoneObservation) {
        self.zones.insert(key, observation);
    }
}
