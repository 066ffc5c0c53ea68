//! Per-zone blob tracking
//!
//! Associates blobs across consecutive frames by bounding-box IoU. A track's
//! `hits` counts the consecutive frames it has been matched; a track that
//! misses a single frame is dropped, so its counter restarts if the object
//! reappears.

use drishti_core::{Blob, PixelBox, TrackedBlob};
use tracing::{debug, warn};

pub struct ZoneTracker {
    next_id: u64,
    tracks: Vec<TrackedBlob>,
    iou_threshold: f32,
    max_tracks: usize,
}

impl ZoneTracker {
    pub fn new(iou_threshold: f32, max_tracks: usize) -> Self {
        Self {
            next_id: 1,
            tracks: Vec::new(),
            iou_threshold,
            max_tracks: max_tracks.max(1),
        }
    }

    /// Fold one frame's blobs into the track set and return the live tracks.
    pub fn update(&mut self, blobs: Vec<Blob>) -> &[TrackedBlob] {
        let previous = std::mem::take(&mut self.tracks);
        let mut claimed = vec![false; previous.len()];
        let mut next = Vec::with_capacity(blobs.len().min(self.max_tracks));

        // Largest blobs pick first so a split object keeps its history on the
        // dominant fragment.
        let mut order: Vec<usize> = (0..blobs.len()).collect();
        order.sort_by(|a, b| blobs[*b].area.cmp(&blobs[*a].area));

        let mut blobs: Vec<Option<Blob>> = blobs.into_iter().map(Some).collect();
        for idx in order {
            let Some(blob) = blobs[idx].take() else { continue };

            let mut best_match: Option<(usize, f32)> = None;
            for (track_idx, track) in previous.iter().enumerate() {
                if claimed[track_idx] {
                    continue;
                }
                let iou = compute_iou(&blob.bbox, &track.blob.bbox);
                if iou > self.iou_threshold && best_match.map_or(true, |(_, best)| iou > best) {
                    best_match = Some((track_idx, iou));
                }
            }

            if next.len() >= self.max_tracks {
                warn!(
                    "Track limit {} reached, ignoring blob at ({}, {})",
                    self.max_tracks, blob.bbox.x, blob.bbox.y
                );
                continue;
            }

            match best_match {
                Some((track_idx, _)) => {
                    claimed[track_idx] = true;
                    let track = &previous[track_idx];
                    next.push(TrackedBlob {
                        track_id: track.track_id,
                        blob,
                        hits: track.hits.saturating_add(1),
                    });
                }
                None => {
                    let track_id = self.next_id;
                    self.next_id = self.next_id.wrapping_add(1).max(1);
                    next.push(TrackedBlob {
                        track_id,
                        blob,
                        hits: 1,
                    });
                }
            }
        }

        let dropped = claimed.iter().filter(|c| !**c).count();
        if dropped > 0 {
            debug!("Dropped {} unmatched tracks", dropped);
        }
        self.tracks = next;
        &self.tracks
    }

    pub fn tracks(&self) -> &[TrackedBlob] {
        &self.tracks
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn shrink(&mut self) {
        self.tracks.shrink_to_fit();
    }
}

/// Intersection over union of two pixel boxes.
pub fn compute_iou(a: &PixelBox, b: &PixelBox) -> f32 {
    if a.w == 0 || a.h == 0 || b.w == 0 || b.h == 0 {
        return 0.0;
    }
    let inter_x_min = a.x.max(b.x) as f64;
    let inter_y_min = a.y.max(b.y) as f64;
    let inter_x_max = (a.x as f64 + a.w as f64).min(b.x as f64 + b.w as f64);
    let inter_y_max = (a.y as f64 + a.h as f64).min(b.y as f64 + b.h as f64);

    if inter_x_max <= inter_x_min || inter_y_max <= inter_y_min {
        return 0.0;
    }

    let inter_area = (inter_x_max - inter_x_min) * (inter_y_max - inter_y_min);
    let union_area = a.w as f64 * a.h as f64 + b.w as f64 * b.h as f64 - inter_area;
    if union_area <= 0.0 || !union_area.is_finite() {
        return 0.0;
    }

    let iou = (inter_area / union_area) as f32;
    if iou.is_finite() && (0.0..=1.0).contains(&iou) {
        iou
    } else {
        0.0
    }
}
