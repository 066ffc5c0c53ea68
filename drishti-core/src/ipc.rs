//! Documents exchanged with the task sequencer through the filesystem.
//!
//! The sequencer publishes [`RobotState`]; the daemon publishes
//! [`VisionEvents`] and a [`Liveness`] marker. Timestamps are float seconds
//! since the Unix epoch.

use crate::trigger::TriggerAction;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Convert a UTC instant to float epoch seconds.
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Convert float epoch seconds back to a UTC instant.
pub fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotPhase {
    Home,
    Moving,
    Working,
    Error,
}

/// State published by the sequencer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    pub state: RobotPhase,
    #[serde(default)]
    pub moving: bool,
    #[serde(default)]
    pub current_sequence: Option<String>,
    #[serde(default)]
    pub accepting_triggers: bool,
    #[serde(default)]
    pub timestamp: f64,
}

impl RobotState {
    /// Stationary at home and accepting triggers.
    pub fn home() -> Self {
        Self {
            state: RobotPhase::Home,
            moving: false,
            current_sequence: None,
            accepting_triggers: true,
            timestamp: 0.0,
        }
    }

    /// True when the fields a gate can observe differ.
    pub fn gate_inputs_differ(&self, other: &RobotState) -> bool {
        self.state != other.state
            || self.moving != other.moving
            || self.accepting_triggers != other.accepting_triggers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisionStatus {
    Idle,
    Detecting,
    Triggered,
    Error,
}

/// Details of a fired trigger (or of a daemon error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub timestamp: f64,
    pub result: String,
    pub zone: String,
    pub confidence: f64,
    #[serde(default)]
    pub area: u64,
    /// `[x, y, w, h]` pixel boxes of the objects that satisfied the rule.
    #[serde(default)]
    pub boxes: Vec<[u32; 4]>,
    pub action: Option<TriggerAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The `vision_events` document. At most one unconsumed event at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionEvents {
    pub last_check: f64,
    pub status: VisionStatus,
    pub trigger_id: Option<String>,
    pub event: Option<EventPayload>,
}

impl VisionEvents {
    pub fn status_only(status: VisionStatus, at: DateTime<Utc>) -> Self {
        Self {
            last_check: epoch_seconds(at),
            status,
            trigger_id: None,
            event: None,
        }
    }

    pub fn error(message: impl Into<String>, at: DateTime<Utc>) -> Self {
        let ts = epoch_seconds(at);
        Self {
            last_check: ts,
            status: VisionStatus::Error,
            trigger_id: None,
            event: Some(EventPayload {
                timestamp: ts,
                result: "error".to_string(),
                zone: String::new(),
                confidence: 0.0,
                area: 0,
                boxes: Vec::new(),
                action: None,
                message: Some(message.into()),
            }),
        }
    }

    /// True when a trigger event is waiting for the sequencer to consume it.
    /// Error documents describe the daemon, not a firing, and never count.
    pub fn has_pending_event(&self) -> bool {
        self.status == VisionStatus::Triggered && self.event.is_some()
    }
}

/// Liveness marker for external supervision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liveness {
    pub pid: u32,
    pub heartbeat: f64,
    pub started_at: f64,
    pub mode: String,
    #[serde(default)]
    pub cycles: u64,
    #[serde(default)]
    pub restarts: u32,
}

impl Liveness {
    /// Seconds since the last heartbeat, as seen at `now`.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> f64 {
        epoch_seconds(now) - self.heartbeat
    }
}
