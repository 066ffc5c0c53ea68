//! Polygon zones of interest.
//!
//! Points lying exactly on an edge or a vertex are treated as inside the
//! zone. Everything else follows the even-odd rule, so self-intersecting
//! polygons behave predictably even though authoring tools never emit them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Relative tolerance used by the on-edge test.
const EDGE_EPSILON: f64 = 1e-9;

/// What a zone is used for by the sequencer's operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneKind {
    #[default]
    Trigger,
    Count,
    QualityCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<[f64; 2]> for Point {
    fn from(p: [f64; 2]) -> Self {
        Self { x: p[0], y: p[1] }
    }
}

impl From<Point> for [f64; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Axis-aligned bounds of a zone, in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Integer pixel range `(x0, y0, x1, y1)` (inclusive) clipped to a frame,
    /// or `None` when the zone lies entirely outside it.
    pub fn pixel_bounds(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if width == 0 || height == 0 {
            return None;
        }
        let max_x = (width - 1) as f64;
        let max_y = (height - 1) as f64;
        if self.max_x < 0.0 || self.max_y < 0.0 || self.min_x > max_x || self.min_y > max_y {
            return None;
        }
        let x0 = self.min_x.max(0.0).ceil() as u32;
        let y0 = self.min_y.max(0.0).ceil() as u32;
        let x1 = self.max_x.min(max_x).floor() as u32;
        let y1 = self.max_y.min(max_y).floor() as u32;
        if x0 > x1 || y0 > y1 {
            return None;
        }
        Some((x0, y0, x1, y1))
    }
}

/// Immutable polygon region of the camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawZone", into = "RawZone")]
pub struct Zone {
    id: String,
    name: String,
    kind: ZoneKind,
    points: Vec<Point>,
    enabled: bool,
}

/// Wire form of a zone; validated into [`Zone`] on deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawZone {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    kind: ZoneKind,
    points: Vec<Point>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TryFrom<RawZone> for Zone {
    type Error = Error;

    fn try_from(raw: RawZone) -> Result<Self> {
        let name = if raw.name.is_empty() { raw.id.clone() } else { raw.name };
        Zone::new(raw.id, name, raw.kind, raw.points, raw.enabled)
    }
}

impl From<Zone> for RawZone {
    fn from(zone: Zone) -> Self {
        RawZone {
            id: zone.id,
            name: zone.name,
            kind: zone.kind,
            points: zone.points,
            enabled: zone.enabled,
        }
    }
}

impl Zone {
    /// Build a zone, rejecting polygons with fewer than three or non-finite vertices.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: ZoneKind,
        points: Vec<Point>,
        enabled: bool,
    ) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::MalformedZone("zone id must not be empty".to_string()));
        }
        if points.len() < 3 {
            return Err(Error::MalformedZone(format!(
                "zone {} has {} points, need at least 3",
                id,
                points.len()
            )));
        }
        if let Some(p) = points.iter().find(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(Error::MalformedZone(format!(
                "zone {} has non-finite vertex ({}, {})",
                id, p.x, p.y
            )));
        }
        Ok(Self {
            id,
            name: name.into(),
            kind,
            points,
            enabled,
        })
    }

    /// Axis-aligned rectangle covering `[x, x + w] x [y, y + h]`.
    pub fn rectangle(id: impl Into<String>, x: f64, y: f64, w: f64, h: f64) -> Result<Self> {
        let id = id.into();
        let points = vec![
            Point::new(x, y),
            Point::new(x + w, y),
            Point::new(x + w, y + h),
            Point::new(x, y + h),
        ];
        Zone::new(id.clone(), id, ZoneKind::Trigger, points, true)
    }

    /// Parse a single zone document, mapping every failure to `MalformedZone`.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::MalformedZone(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::MalformedZone(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Point-in-polygon test; boundary points are inside.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.points.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[j];
            if on_segment(a, b, x, y) {
                return true;
            }
            if (a.y > y) != (b.y > y) {
                let cross_x = (b.x - a.x) * (y - a.y) / (b.y - a.y) + a.x;
                if x < cross_x {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let mut bb = BoundingBox {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for p in &self.points {
            bb.min_x = bb.min_x.min(p.x);
            bb.min_y = bb.min_y.min(p.y);
            bb.max_x = bb.max_x.max(p.x);
            bb.max_y = bb.max_y.max(p.y);
        }
        bb
    }

    /// Polygon area (shoelace formula).
    pub fn area(&self) -> f64 {
        let n = self.points.len();
        let mut twice = 0.0;
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            twice += a.x * b.y - b.x * a.y;
        }
        twice.abs() / 2.0
    }
}

fn on_segment(a: Point, b: Point, x: f64, y: f64) -> bool {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let cross = dx * (y - a.y) - dy * (x - a.x);
    let scale = (dx.abs() + dy.abs()).max(1.0);
    if cross.abs() > EDGE_EPSILON * scale {
        return false;
    }
    x >= a.x.min(b.x) - EDGE_EPSILON
        && x <= a.x.max(b.x) + EDGE_EPSILON
        && y >= a.y.min(b.y) - EDGE_EPSILON
        && y <= a.y.max(b.y) + EDGE_EPSILON
}
