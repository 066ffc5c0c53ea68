//! Frame to per-zone stable blobs.

use super::background::BackgroundModel;
use super::blobs::{find_blobs, ZoneMask};
use super::tracker::ZoneTracker;
use crate::config::DetectorConfig;
use crate::error::{Result, VisionError};
use crate::frame::Frame;
use drishti_core::{DetectionFrame, Zone, ZoneKey, ZoneObservation};
use std::collections::BTreeMap;
use tracing::{debug, trace};

struct ZoneState {
    zone: Zone,
    mask: Option<ZoneMask>,
    tracker: ZoneTracker,
}

impl ZoneState {
    fn new(zone: Zone, config: &DetectorConfig) -> Self {
        Self {
            zone,
            mask: None,
            tracker: ZoneTracker::new(config.iou_threshold, config.max_tracks_per_zone),
        }
    }
}

fn zone_mask<'a>(slot: &'a mut Option<ZoneMask>, zone: &Zone, width: u32, height: u32) -> &'a ZoneMask {
    if slot.as_ref().map_or(false, |m| !m.matches_frame(width, height)) {
        *slot = None;
    }
    slot.get_or_insert_with(|| ZoneMask::build(zone, width, height))
}

/// Owns the background model and one tracker per zone.
///
/// Zones whose trigger is gated are neither observed nor updated on a frame;
/// their trackers keep the state from the last frame they were observed.
pub struct Detector {
    config: DetectorConfig,
    background: BackgroundModel,
    zones: BTreeMap<ZoneKey, ZoneState>,
    detections: u64,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate().map_err(VisionError::Config)?;
        Ok(Self {
            background: BackgroundModel::new(&config),
            config,
            zones: BTreeMap::new(),
            detections: 0,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Replace the zone set. Zones whose key and geometry are unchanged keep
    /// their tracker state.
    pub fn set_zones<I>(&mut self, zones: I)
    where
        I: IntoIterator<Item = (ZoneKey, Zone)>,
    {
        let mut previous = std::mem::take(&mut self.zones);
        for (key, zone) in zones {
            let state = match previous.remove(&key) {
                Some(state) if state.zone == zone => state,
                _ => ZoneState::new(zone, &self.config),
            };
            self.zones.insert(key, state);
        }
        if !previous.is_empty() {
            debug!("Dropped detector state for {} zones", previous.len());
        }
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Number of frames processed since construction.
    pub fn detections(&self) -> u64 {
        self.detections
    }

    /// Run one detection pass. Only zones for which `is_active` returns true
    /// appear in the result.
    pub fn process<F>(&mut self, frame: &Frame, is_active: F) -> DetectionFrame
    where
        F: Fn(&ZoneKey) -> bool,
    {
        let mut result = DetectionFrame::new(frame.captured_at(), frame.sequence());
        let (width, height) = (frame.width(), frame.height());
        let min_area = self.config.min_blob_area;
        let foreground = self.background.apply(frame.image());
        self.detections += 1;

        for (key, state) in self.zones.iter_mut() {
            if !is_active(key) {
                continue;
            }
            let ZoneState { zone, mask, tracker } = state;
            let mask = zone_mask(mask, zone, width, height);
            let zone_pixels = mask.pixel_count();
            if !zone.is_enabled() || zone_pixels == 0 {
                tracker.clear();
                result.insert(key.clone(), ZoneObservation::empty(zone_pixels));
                continue;
            }
            let blobs = find_blobs(foreground, mask, min_area);
            let tracks = tracker.update(blobs).to_vec();
            trace!("Zone {}: {} tracks", key, tracks.len());
            result.insert(key.clone(), ZoneObservation { zone_pixels, tracks });
        }
        result
    }

    /// Forget the background model and every track.
    pub fn reset(&mut self) {
        self.background.reset();
        for state in self.zones.values_mut() {
            state.tracker.clear();
        }
    }

    /// Release spare buffer capacity and cached zone masks.
    pub fn compact(&mut self) {
        self.background.shrink();
        for state in self.zones.values_mut() {
            state.mask = None;
            state.tracker.shrink();
        }
        debug!("Detector compacted after {} detections", self.detections);
    }
}
