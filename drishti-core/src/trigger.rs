//! Trigger definitions: condition, gate, action and cadence.

use crate::error::{Error, Result};
use crate::ipc::{RobotPhase, RobotState};
use crate::zone::Zone;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Presence,
    Count,
    MultiZone,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerKind::Presence => "presence",
            TriggerKind::Count => "count",
            TriggerKind::MultiZone => "multi_zone",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompareOp {
    #[default]
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
}

impl CompareOp {
    pub fn apply(self, value: u64, target: u64) -> bool {
        match self {
            CompareOp::Ge => value >= target,
            CompareOp::Le => value <= target,
            CompareOp::Eq => value == target,
            CompareOp::Gt => value > target,
            CompareOp::Lt => value < target,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ZoneLogic {
    #[default]
    And,
    Or,
}

fn default_min_objects() -> u32 {
    1
}

/// Condition payload, tagged with the trigger type it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Presence {
        zone_id: String,
        #[serde(default = "default_min_objects")]
        min_objects: u32,
        /// Falls back to the detector default when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stability_frames: Option<u32>,
    },
    Count {
        zone_id: String,
        target_count: u64,
        #[serde(default)]
        operator: CompareOp,
        #[serde(default)]
        cumulative: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stability_frames: Option<u32>,
    },
    MultiZone {
        zone_ids: Vec<String>,
        #[serde(default)]
        logic: ZoneLogic,
        /// Per-zone minimum; zones not listed need one object.
        #[serde(default)]
        min_objects: BTreeMap<String, u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stability_frames: Option<u32>,
    },
}

impl Condition {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Condition::Presence { .. } => TriggerKind::Presence,
            Condition::Count { .. } => TriggerKind::Count,
            Condition::MultiZone { .. } => TriggerKind::MultiZone,
        }
    }

    /// Zone ids this condition reads, in declaration order.
    pub fn zone_ids(&self) -> Vec<&str> {
        match self {
            Condition::Presence { zone_id, .. } | Condition::Count { zone_id, .. } => {
                vec![zone_id.as_str()]
            }
            Condition::MultiZone { zone_ids, .. } => zone_ids.iter().map(String::as_str).collect(),
        }
    }

    pub fn stability_frames(&self) -> Option<u32> {
        match self {
            Condition::Presence { stability_frames, .. }
            | Condition::Count { stability_frames, .. }
            | Condition::MultiZone { stability_frames, .. } => *stability_frames,
        }
    }

    pub fn is_cumulative(&self) -> bool {
        matches!(self, Condition::Count { cumulative: true, .. })
    }
}

/// What the sequencer should do when a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerAction {
    AdvanceSequence {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_id: Option<String>,
    },
    StartSequence {
        sequence_id: String,
    },
    Stop,
    Alert {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Default for TriggerAction {
    fn default() -> Self {
        TriggerAction::AdvanceSequence { sequence_id: None }
    }
}

fn default_gate_phase() -> Option<RobotPhase> {
    Some(RobotPhase::Home)
}

fn default_gate_accepting() -> Option<bool> {
    Some(true)
}

fn default_gate_moving() -> Option<bool> {
    Some(false)
}

/// Precondition on the sequencer's published state (`active_when`).
///
/// Each `Some` field must match; `None` ignores the field. The default is
/// the home-gated policy: at home, stationary, accepting triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    #[serde(default = "default_gate_phase")]
    pub robot_state: Option<RobotPhase>,
    #[serde(default = "default_gate_accepting")]
    pub accepting_triggers: Option<bool>,
    #[serde(default = "default_gate_moving")]
    pub moving: Option<bool>,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            robot_state: default_gate_phase(),
            accepting_triggers: default_gate_accepting(),
            moving: default_gate_moving(),
        }
    }
}

impl Gate {
    /// Gate that never closes, even without a published robot state.
    pub fn always() -> Self {
        Self {
            robot_state: None,
            accepting_triggers: None,
            moving: None,
        }
    }

    fn is_unconditional(&self) -> bool {
        self.robot_state.is_none() && self.accepting_triggers.is_none() && self.moving.is_none()
    }

    /// An unknown robot state closes every conditional gate.
    pub fn is_open(&self, robot: Option<&RobotState>) -> bool {
        if self.is_unconditional() {
            return true;
        }
        let Some(robot) = robot else {
            return false;
        };
        self.robot_state.map_or(true, |p| p == robot.state)
            && self.accepting_triggers.map_or(true, |a| a == robot.accepting_triggers)
            && self.moving.map_or(true, |m| m == robot.moving)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_check_interval() -> f64 {
    5.0
}

/// A named rule evaluated against zones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: f64,
    #[serde(default)]
    pub active_when: Gate,
    #[serde(default)]
    pub action: TriggerAction,
    pub condition: Condition,
}

/// A trigger together with the zones it owns; stored and loaded as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerUnit {
    pub trigger: Trigger,
    pub zones: Vec<Zone>,
}

impl TriggerUnit {
    pub fn new(trigger: Trigger, zones: Vec<Zone>) -> Result<Self> {
        let unit = Self { trigger, zones };
        unit.validate()?;
        Ok(unit)
    }

    pub fn zone(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id() == id)
    }

    /// Check internal consistency and referential integrity.
    pub fn validate(&self) -> Result<()> {
        let t = &self.trigger;
        if t.id.trim().is_empty() {
            return Err(Error::MalformedTrigger("trigger id must not be empty".to_string()));
        }
        if t.kind != t.condition.kind() {
            return Err(Error::MalformedTrigger(format!(
                "trigger {} is declared {} but its condition is {}",
                t.id,
                t.kind,
                t.condition.kind()
            )));
        }
        if !t.check_interval_seconds.is_finite() || t.check_interval_seconds < 0.0 {
            return Err(Error::MalformedTrigger(format!(
                "trigger {} has invalid check_interval_seconds {}",
                t.id, t.check_interval_seconds
            )));
        }
        if t.condition.stability_frames() == Some(0) {
            return Err(Error::MalformedTrigger(format!(
                "trigger {} has stability_frames = 0",
                t.id
            )));
        }
        if let TriggerAction::StartSequence { sequence_id } = &t.action {
            if sequence_id.trim().is_empty() {
                return Err(Error::MalformedTrigger(format!(
                    "trigger {} starts a sequence without a sequence_id",
                    t.id
                )));
            }
        }

        let mut seen = HashSet::new();
        for zone in &self.zones {
            if !seen.insert(zone.id()) {
                return Err(Error::DuplicateZone {
                    trigger: t.id.clone(),
                    zone: zone.id().to_string(),
                });
            }
        }

        let referenced = t.condition.zone_ids();
        if referenced.is_empty() {
            return Err(Error::MalformedTrigger(format!(
                "trigger {} references no zones",
                t.id
            )));
        }
        for zone_id in &referenced {
            if !seen.contains(zone_id) {
                return Err(Error::DanglingZone {
                    trigger: t.id.clone(),
                    zone: zone_id.to_string(),
                });
            }
        }
        if let Condition::MultiZone { min_objects, .. } = &t.condition {
            if let Some(extra) = min_objects.keys().find(|k| !referenced.contains(&k.as_str())) {
                return Err(Error::DanglingZone {
                    trigger: t.id.clone(),
                    zone: extra.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(zone: &str) -> Trigger {
        Trigger {
            id: "t1".to_string(),
            name: "Part present".to_string(),
            kind: TriggerKind::Presence,
            enabled: true,
            check_interval_seconds: 2.0,
            active_when: Gate::default(),
            action: TriggerAction::default(),
            condition: Condition::Presence {
                zone_id: zone.to_string(),
                min_objects: 1,
                stability_frames: Some(2),
            },
        }
    }

    #[test]
    fn test_unit_validates_references() {
        let zone = Zone::rectangle("a", 0.0, 0.0, 10.0, 10.0).unwrap();
        assert!(TriggerUnit::new(presence("a"), vec![zone.clone()]).is_ok());
        let err = TriggerUnit::new(presence("missing"), vec![zone]).unwrap_err();
        assert!(matches!(err, Error::DanglingZone { ref zone, .. } if zone == "missing"));
    }

    #[test]
    fn test_duplicate_zone_rejected() {
        let zone = Zone::rectangle("a", 0.0, 0.0, 10.0, 10.0).unwrap();
        let err = TriggerUnit::new(presence("a"), vec![zone.clone(), zone]).unwrap_err();
        assert!(matches!(err, Error::DuplicateZone { .. }));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let zone = Zone::rectangle("a", 0.0, 0.0, 10.0, 10.0).unwrap();
        let mut trigger = presence("a");
        trigger.kind = TriggerKind::Count;
        assert!(matches!(
            TriggerUnit::new(trigger, vec![zone]),
            Err(Error::MalformedTrigger(_))
        ));
    }

    #[test]
    fn test_multi_zone_min_objects_must_reference_listed_zone() {
        let a = Zone::rectangle("a", 0.0, 0.0, 10.0, 10.0).unwrap();
        let b = Zone::rectangle("b", 10.0, 0.0, 10.0, 10.0).unwrap();
        let mut min_objects = BTreeMap::new();
        min_objects.insert("c".to_string(), 2);
        let mut trigger = presence("a");
        trigger.kind = TriggerKind::MultiZone;
        trigger.condition = Condition::MultiZone {
            zone_ids: vec!["a".to_string(), "b".to_string()],
            logic: ZoneLogic::And,
            min_objects,
            stability_frames: None,
        };
        assert!(matches!(
            TriggerUnit::new(trigger, vec![a, b]),
            Err(Error::DanglingZone { .. })
        ));
    }

    #[test]
    fn test_condition_wire_format() {
        let json = r#"{"type":"count","zone_id":"bin","target_count":3,"operator":">=","cumulative":true}"#;
        let cond: Condition = serde_json::from_str(json).unwrap();
        assert_eq!(cond.kind(), TriggerKind::Count);
        assert!(cond.is_cumulative());
        assert_eq!(cond.stability_frames(), None);

        let json = r#"{"type":"multi_zone","zone_ids":["a","b"],"logic":"OR"}"#;
        let cond: Condition = serde_json::from_str(json).unwrap();
        assert!(matches!(cond, Condition::MultiZone { logic: ZoneLogic::Or, .. }));
    }

    #[test]
    fn test_action_is_tagged_union() {
        let action = TriggerAction::StartSequence {
            sequence_id: "pick_and_place".to_string(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "start_sequence");
        assert_eq!(json["sequence_id"], "pick_and_place");

        let stop: TriggerAction = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(stop, TriggerAction::Stop);
    }

    #[test]
    fn test_gate_defaults_to_home() {
        let gate: Gate = serde_json::from_str("{}").unwrap();
        assert_eq!(gate, Gate::default());

        let home = RobotState::home();
        assert!(gate.is_open(Some(&home)));

        let mut moving = RobotState::home();
        moving.state = RobotPhase::Moving;
        moving.moving = true;
        assert!(!gate.is_open(Some(&moving)));

        let mut busy = RobotState::home();
        busy.accepting_triggers = false;
        assert!(!gate.is_open(Some(&busy)));

        assert!(!gate.is_open(None));
        assert!(Gate::always().is_open(None));
    }

    #[test]
    fn test_compare_ops() {
        assert!(CompareOp::Ge.apply(3, 3));
        assert!(!CompareOp::Gt.apply(3, 3));
        assert!(CompareOp::Le.apply(2, 3));
        assert!(CompareOp::Lt.apply(2, 3));
        assert!(CompareOp::Eq.apply(3, 3));
        assert!(!CompareOp::Eq.apply(4, 3));
    }
}
