//! Shared fixtures for daemon integration tests

#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use drishti_core::{RobotPhase, RobotState, Trigger, TriggerUnit, Zone};
use drishti_daemon::{Daemon, DaemonConfig, IpcChannel, TriggerStore};
use drishti_eye::{Frame, FrameSource, VisionError};
use image::{GrayImage, Luma};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;
pub const OBJECT: u32 = 16;

/// 64x48 scene, background 20, one bright 16x16 square per origin.
pub fn scene(objects: &[(u32, u32)]) -> GrayImage {
    let mut img = GrayImage::from_pixel(WIDTH, HEIGHT, Luma([20]));
    for &(ox, oy) in objects {
        for y in oy..(oy + OBJECT).min(HEIGHT) {
            for x in ox..(ox + OBJECT).min(WIDTH) {
                img.put_pixel(x, y, Luma([220]));
            }
        }
    }
    img
}

/// `None` entries simulate a failed grab.
pub type Script = Arc<Mutex<VecDeque<Option<GrayImage>>>>;

pub struct ScriptedSource {
    script: Script,
    sequence: u64,
    released: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Option<GrayImage>>) -> (Self, Script, Arc<AtomicBool>) {
        let script: Script = Arc::new(Mutex::new(frames.into_iter().collect()));
        let released = Arc::new(AtomicBool::new(false));
        (
            Self {
                script: script.clone(),
                sequence: 0,
                released: released.clone(),
            },
            script,
            released,
        )
    }

    pub fn from_scenes(scenes: Vec<GrayImage>) -> (Self, Script, Arc<AtomicBool>) {
        Self::new(scenes.into_iter().map(Some).collect())
    }
}

impl FrameSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&mut self) -> drishti_eye::Result<()> {
        Ok(())
    }

    fn grab(&mut self) -> drishti_eye::Result<Frame> {
        match self.script.lock().pop_front() {
            Some(Some(image)) => {
                self.sequence += 1;
                Ok(Frame::new(image, Utc::now(), self.sequence))
            }
            Some(None) => Err(VisionError::Camera("scripted failure".to_string())),
            None => Err(VisionError::Camera("script exhausted".to_string())),
        }
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: DaemonConfig,
    pub store: TriggerStore,
    pub ipc: IpcChannel,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.daemon.ipc_dir = dir.path().join("ipc");
        config.daemon.triggers_dir = dir.path().join("triggers");
        config.daemon.stats_interval = 0;
        config.detector.min_blob_area = 50;
        config.detector.stability_frames = 2;
        config.camera.capture_timeout_ms = 1000;
        let store = TriggerStore::open(&config.daemon.triggers_dir, 10).unwrap();
        let ipc = IpcChannel::new(&config.daemon.ipc_dir);
        std::fs::create_dir_all(ipc.dir()).unwrap();
        Self {
            dir,
            config,
            store,
            ipc,
        }
    }

    pub fn add(&self, unit: &TriggerUnit) {
        self.store.save(&unit.trigger.id, unit).unwrap();
    }

    pub fn robot(&self, phase: RobotPhase) {
        let mut state = RobotState::home();
        state.state = phase;
        state.moving = phase == RobotPhase::Moving;
        self.ipc.write_robot_state(&state).unwrap();
    }

    pub async fn daemon(&self, source: ScriptedSource) -> Daemon {
        Daemon::init(self.config.clone(), Box::new(source)).await.unwrap()
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
}

/// Cycle `i` happens `i * 200ms` after [`t0`].
pub fn at(i: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::milliseconds(200 * i)
}

pub fn full_zone(id: &str) -> Zone {
    Zone::rectangle(id, 0.0, 0.0, (WIDTH - 1) as f64, (HEIGHT - 1) as f64).unwrap()
}

pub fn unit(trigger: serde_json::Value, zones: Vec<Zone>) -> TriggerUnit {
    let trigger: Trigger = serde_json::from_value(trigger).unwrap();
    TriggerUnit::new(trigger, zones).unwrap()
}

pub fn presence_unit(id: &str, min_objects: u32, stability: u32) -> TriggerUnit {
    unit(
        serde_json::json!({
            "id": id,
            "name": id,
            "type": "presence",
            "condition": {
                "type": "presence",
                "zone_id": "full",
                "min_objects": min_objects,
                "stability_frames": stability
            }
        }),
        vec![full_zone("full")],
    )
}
