//! Trigger rule evaluation.
//!
//! [`evaluate`] decides, for one trigger and one detection frame, whether the
//! trigger fires. Everything that persists between frames (cooldown, re-arm
//! flag, cumulative counter) lives in an explicit [`TriggerRuntime`] owned by
//! the caller, so the decision itself depends only on its arguments.
//!
//! A gated trigger is *not evaluated*: its runtime is left untouched, which
//! is different from evaluating to "condition false".

use crate::error::{Error, Result};
use crate::ipc::{epoch_seconds, EventPayload, RobotState, VisionEvents, VisionStatus};
use crate::observation::{DetectionFrame, ZoneObservation};
use crate::trigger::{Condition, Trigger, TriggerAction, TriggerUnit, ZoneLogic};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Inputs shared by every trigger evaluated on one frame.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub frame: &'a DetectionFrame,
    pub robot: Option<&'a RobotState>,
    pub now: DateTime<Utc>,
    /// Stability used by conditions that do not set their own.
    pub default_stability: u32,
}

/// Per-trigger state carried between frames.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRuntime {
    pub last_fired: Option<DateTime<Utc>>,
    /// Cleared on fire; set again once the condition is observed false.
    pub armed: bool,
    /// Confirmed objects seen so far (cumulative count triggers only).
    pub cumulative: u64,
    pub count_at_last_fire: u64,
    pub fire_count: u64,
}

impl Default for TriggerRuntime {
    fn default() -> Self {
        Self {
            last_fired: None,
            armed: true,
            cumulative: 0,
            count_at_last_fire: 0,
            fire_count: 0,
        }
    }
}

/// Payload of a fired trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    pub trigger_id: String,
    pub zone: String,
    pub result: String,
    pub confidence: f64,
    pub area: u64,
    pub boxes: Vec<[u32; 4]>,
    pub action: TriggerAction,
    /// Object count that satisfied the rule.
    pub value: u64,
    pub at: DateTime<Utc>,
}

impl Firing {
    pub fn to_event(&self) -> VisionEvents {
        let ts = epoch_seconds(self.at);
        VisionEvents {
            last_check: ts,
            status: VisionStatus::Triggered,
            trigger_id: Some(self.trigger_id.clone()),
            event: Some(EventPayload {
                timestamp: ts,
                result: self.result.clone(),
                zone: self.zone.clone(),
                confidence: self.confidence,
                area: self.area,
                boxes: self.boxes.clone(),
                action: Some(self.action.clone()),
                message: None,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// `active_when` was false (or the trigger is disabled); nothing changed.
    Gated,
    /// Condition false.
    Clear,
    /// Condition true but still cooling down or not re-armed.
    Suppressed,
    Fired(Firing),
}

impl Evaluation {
    pub fn is_gated(&self) -> bool {
        matches!(self, Evaluation::Gated)
    }

    pub fn fired(&self) -> Option<&Firing> {
        match self {
            Evaluation::Fired(f) => Some(f),
            _ => None,
        }
    }
}

/// What the condition's zones show on the current frame.
struct Observed {
    satisfied: bool,
    /// Instantaneous stable count (presence/count) or satisfied zones (multi-zone).
    value: u64,
    newly_confirmed: u64,
    zone: String,
    area: u64,
    zone_pixels: u64,
    boxes: Vec<[u32; 4]>,
}

fn zone_observation<'f>(
    frame: &'f DetectionFrame,
    trigger: &Trigger,
    zone_id: &str,
) -> Result<&'f ZoneObservation> {
    frame
        .observation(&trigger.id, zone_id)
        .ok_or_else(|| Error::MissingObservation {
            trigger: trigger.id.clone(),
            zone: zone_id.to_string(),
        })
}

fn observe(trigger: &Trigger, frame: &DetectionFrame, stability: u32) -> Result<Observed> {
    match &trigger.condition {
        Condition::Presence {
            zone_id,
            min_objects,
            ..
        } => {
            let obs = zone_observation(frame, trigger, zone_id)?;
            let count = obs.stable_count(stability);
            Ok(Observed {
                satisfied: count >= *min_objects,
                value: count as u64,
                newly_confirmed: obs.newly_confirmed(stability) as u64,
                zone: zone_id.clone(),
                area: obs.stable_area(stability),
                zone_pixels: obs.zone_pixels,
                boxes: obs.stable_boxes(stability),
            })
        }
        Condition::Count { zone_id, .. } => {
            let obs = zone_observation(frame, trigger, zone_id)?;
            Ok(Observed {
                satisfied: false,
                value: obs.stable_count(stability) as u64,
                newly_confirmed: obs.newly_confirmed(stability) as u64,
                zone: zone_id.clone(),
                area: obs.stable_area(stability),
                zone_pixels: obs.zone_pixels,
                boxes: obs.stable_boxes(stability),
            })
        }
        Condition::MultiZone {
            zone_ids,
            logic,
            min_objects,
            ..
        } => {
            let mut satisfied_zones = Vec::new();
            let mut area = 0;
            let mut zone_pixels = 0;
            let mut boxes = Vec::new();
            let mut newly_confirmed = 0;
            for zone_id in zone_ids {
                let obs = zone_observation(frame, trigger, zone_id)?;
                let needed = min_objects.get(zone_id).copied().unwrap_or(1);
                newly_confirmed += obs.newly_confirmed(stability) as u64;
                if obs.stable_count(stability) >= needed {
                    satisfied_zones.push(zone_id.as_str());
                    area += obs.stable_area(stability);
                    zone_pixels += obs.zone_pixels;
                    boxes.extend(obs.stable_boxes(stability));
                }
            }
            let satisfied = match logic {
                ZoneLogic::And => satisfied_zones.len() == zone_ids.len(),
                ZoneLogic::Or => !satisfied_zones.is_empty(),
            };
            Ok(Observed {
                satisfied,
                value: satisfied_zones.len() as u64,
                newly_confirmed,
                zone: satisfied_zones.join(","),
                area,
                zone_pixels,
                boxes,
            })
        }
    }
}

fn result_label(condition: &Condition) -> &'static str {
    match condition {
        Condition::Presence { .. } => "object_present",
        Condition::Count { .. } => "count_reached",
        Condition::MultiZone { .. } => "zones_satisfied",
    }
}

fn cooldown_elapsed(trigger: &Trigger, runtime: &TriggerRuntime, now: DateTime<Utc>) -> bool {
    match runtime.last_fired {
        None => true,
        Some(last) => {
            let elapsed = (now - last).num_milliseconds() as f64 / 1000.0;
            elapsed >= trigger.check_interval_seconds
        }
    }
}

/// Evaluate one trigger against the current frame.
///
/// On error the runtime is left unchanged.
pub fn evaluate(
    trigger: &Trigger,
    runtime: &mut TriggerRuntime,
    ctx: &EvalContext<'_>,
) -> Result<Evaluation> {
    if !trigger.enabled || !trigger.active_when.is_open(ctx.robot) {
        return Ok(Evaluation::Gated);
    }

    let stability = trigger
        .condition
        .stability_frames()
        .unwrap_or(ctx.default_stability)
        .max(1);
    let observed = observe(trigger, ctx.frame, stability)?;

    let cumulative = trigger.condition.is_cumulative();
    if cumulative {
        runtime.cumulative += observed.newly_confirmed;
    }

    let (satisfied, value) = match &trigger.condition {
        Condition::Count {
            target_count,
            operator,
            ..
        } => {
            let value = if cumulative {
                runtime.cumulative
            } else {
                observed.value
            };
            (operator.apply(value, *target_count), value)
        }
        _ => (observed.satisfied, observed.value),
    };

    if !satisfied {
        if !cumulative {
            runtime.armed = true;
        }
        return Ok(Evaluation::Clear);
    }

    let rearmed = if cumulative {
        runtime.last_fired.is_none() || runtime.cumulative > runtime.count_at_last_fire
    } else {
        runtime.armed
    };
    if !rearmed || !cooldown_elapsed(trigger, runtime, ctx.now) {
        debug!(trigger_id = %trigger.id, "condition holds but trigger is cooling down");
        return Ok(Evaluation::Suppressed);
    }

    runtime.last_fired = Some(ctx.now);
    runtime.armed = false;
    runtime.count_at_last_fire = runtime.cumulative;
    runtime.fire_count += 1;

    let confidence = if observed.zone_pixels == 0 {
        0.0
    } else {
        (observed.area as f64 / observed.zone_pixels as f64).clamp(0.0, 1.0)
    };

    info!(
        trigger_id = %trigger.id,
        zone = %observed.zone,
        value,
        "trigger fired"
    );

    Ok(Evaluation::Fired(Firing {
        trigger_id: trigger.id.clone(),
        zone: observed.zone,
        result: result_label(&trigger.condition).to_string(),
        confidence,
        area: observed.area,
        boxes: observed.boxes,
        action: trigger.action.clone(),
        value,
        at: ctx.now,
    }))
}

/// A loaded trigger unit paired with its runtime state.
#[derive(Debug, Clone)]
pub struct ActiveTrigger {
    pub unit: Arc<TriggerUnit>,
    pub runtime: TriggerRuntime,
}

/// Ordered set of enabled triggers; evaluation follows load order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    triggers: Vec<ActiveTrigger>,
}

impl RuleSet {
    pub fn new(units: Vec<TriggerUnit>) -> Self {
        Self {
            triggers: units
                .into_iter()
                .map(|unit| ActiveTrigger {
                    unit: Arc::new(unit),
                    runtime: TriggerRuntime::default(),
                })
                .collect(),
        }
    }

    /// Build the replacement for a reload: units identical to a current one
    /// keep their runtime, everything else starts fresh.
    pub fn reloaded(&self, units: Vec<TriggerUnit>) -> Self {
        let triggers = units
            .into_iter()
            .map(|unit| {
                let runtime = self
                    .triggers
                    .iter()
                    .find(|t| *t.unit == unit)
                    .map(|t| t.runtime.clone())
                    .unwrap_or_default();
                ActiveTrigger {
                    unit: Arc::new(unit),
                    runtime,
                }
            })
            .collect();
        Self { triggers }
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActiveTrigger> {
        self.triggers.iter()
    }

    pub fn units(&self) -> impl Iterator<Item = &Arc<TriggerUnit>> {
        self.triggers.iter().map(|t| &t.unit)
    }

    pub fn runtime(&self, trigger_id: &str) -> Option<&TriggerRuntime> {
        self.triggers
            .iter()
            .find(|t| t.unit.trigger.id == trigger_id)
            .map(|t| &t.runtime)
    }

    /// True when any trigger would be evaluated under `robot`.
    pub fn any_gate_open(&self, robot: Option<&RobotState>) -> bool {
        self.triggers
            .iter()
            .any(|t| t.unit.trigger.enabled && t.unit.trigger.active_when.is_open(robot))
    }

    /// Evaluate every trigger in load order. Errors are reported per trigger.
    pub fn evaluate_all(&mut self, ctx: &EvalContext<'_>) -> Vec<(String, Result<Evaluation>)> {
        self.triggers
            .iter_mut()
            .map(|t| {
                let outcome = evaluate(&t.unit.trigger, &mut t.runtime, ctx);
                (t.unit.trigger.id.clone(), outcome)
            })
            .collect()
    }
}
