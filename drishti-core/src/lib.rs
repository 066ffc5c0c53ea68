//! drishti-core: zones, trigger definitions and rule evaluation
//!
//! The pure half of the vision trigger daemon. Zones are immutable polygon
//! regions, triggers are named rules over those zones, and the evaluator
//! turns a detection frame plus the sequencer's published state into
//! discrete firings. Nothing in this crate touches the camera or the
//! filesystem.

pub mod error;
pub mod evaluator;
pub mod ipc;
pub mod observation;
pub mod trigger;
pub mod zone;

pub use error::{Error, Result};
pub use evaluator::{evaluate, ActiveTrigger, EvalContext, Evaluation, Firing, RuleSet, TriggerRuntime};
pub use ipc::{EventPayload, Liveness, RobotPhase, RobotState, VisionEvents, VisionStatus};
pub use observation::{Blob, DetectionFrame, PixelBox, TrackedBlob, ZoneKey, ZoneObservation};
pub use trigger::{CompareOp, Condition, Gate, Trigger, TriggerAction, TriggerKind, TriggerUnit, ZoneLogic};
pub use zone::{BoundingBox, Point, Zone, ZoneKind};
