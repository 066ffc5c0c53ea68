//! File-based IPC with the task sequencer.
//!
//! Three JSON documents live in the IPC directory:
//! - `robot_state.json`, written by the sequencer and read every cycle
//! - `vision_events.json`, written by the daemon and consumed by the sequencer
//! - `daemon.pid`, the liveness marker for external supervision
//!
//! Every write goes to a temp file in the same directory, is synced, then
//! renamed over the target, so a reader sees either the old or the new
//! document and never a partial one.

use crate::error::{DaemonError, Result};
use chrono::{DateTime, Utc};
use drishti_core::{Liveness, RobotState, VisionEvents, VisionStatus};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const ROBOT_STATE_FILE: &str = "robot_state.json";
pub const VISION_EVENTS_FILE: &str = "vision_events.json";
pub const LIVENESS_FILE: &str = "daemon.pid";

const READ_ATTEMPTS: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Serialize `value` and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| DaemonError::Ipc(format!("Failed to serialize {}: {}", path.display(), e)))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".drishti-")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| DaemonError::Ipc(format!("Failed to create temp file in {}: {}", parent.display(), e)))?;
    temp.write_all(&bytes)
        .map_err(|e| DaemonError::Ipc(format!("Failed to write {}: {}", path.display(), e)))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| DaemonError::Ipc(format!("Failed to sync {}: {}", path.display(), e)))?;
    temp.persist(path)
        .map_err(|e| DaemonError::Ipc(format!("Failed to rename into {}: {}", path.display(), e.error)))?;
    Ok(())
}

enum ReadAttempt<T> {
    Missing,
    Parsed(T),
    Unparsable(String),
}

fn read_json_once<T: DeserializeOwned>(path: &Path) -> Result<ReadAttempt<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ReadAttempt::Missing),
        Err(e) => return Err(DaemonError::Ipc(format!("Failed to read {}: {}", path.display(), e))),
    };
    Ok(match serde_json::from_slice(&bytes) {
        Ok(value) => ReadAttempt::Parsed(value),
        Err(e) => ReadAttempt::Unparsable(e.to_string()),
    })
}

fn unparsable(path: &Path, last_error: &str) -> DaemonError {
    DaemonError::Ipc(format!(
        "{} did not parse after {} attempts: {}",
        path.display(),
        READ_ATTEMPTS,
        last_error
    ))
}

/// Read a JSON document, retrying when it does not parse.
///
/// Returns `Ok(None)` when the file does not exist. Blocks the calling
/// thread between attempts; async callers use [`read_json_retrying_async`].
pub fn read_json_retrying<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let mut last_error = String::new();
    for attempt in 0..READ_ATTEMPTS {
        match read_json_once(path)? {
            ReadAttempt::Missing => return Ok(None),
            ReadAttempt::Parsed(value) => return Ok(Some(value)),
            ReadAttempt::Unparsable(e) => {
                debug!(attempt, path = %path.display(), "unparsable IPC document, retrying");
                last_error = e;
                std::thread::sleep(READ_RETRY_DELAY);
            }
        }
    }
    Err(unparsable(path, &last_error))
}

/// Same as [`read_json_retrying`], yielding to the runtime between attempts.
pub async fn read_json_retrying_async<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let mut last_error = String::new();
    for attempt in 0..READ_ATTEMPTS {
        match read_json_once(path)? {
            ReadAttempt::Missing => return Ok(None),
            ReadAttempt::Parsed(value) => return Ok(Some(value)),
            ReadAttempt::Unparsable(e) => {
                debug!(attempt, path = %path.display(), "unparsable IPC document, retrying");
                last_error = e;
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
        }
    }
    Err(unparsable(path, &last_error))
}

/// Handle on the IPC directory.
#[derive(Debug, Clone)]
pub struct IpcChannel {
    dir: PathBuf,
}

impl IpcChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn robot_state_path(&self) -> PathBuf {
        self.dir.join(ROBOT_STATE_FILE)
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join(VISION_EVENTS_FILE)
    }

    pub fn liveness_path(&self) -> PathBuf {
        self.dir.join(LIVENESS_FILE)
    }

    /// Create the directory and make sure the events document is valid.
    ///
    /// An unconsumed trigger event is left alone so it survives a daemon
    /// restart. Anything else, including the error document a previous run
    /// published before restarting, is replaced with `idle`.
    pub fn init(&self, now: DateTime<Utc>) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            DaemonError::Ipc(format!("Failed to create IPC directory {}: {}", self.dir.display(), e))
        })?;
        match self.read_events() {
            Ok(Some(current)) if current.has_pending_event() => Ok(()),
            Ok(_) => self.write_events(&VisionEvents::status_only(VisionStatus::Idle, now)),
            Err(e) => {
                warn!("Replacing unreadable events file: {}", e);
                self.write_events(&VisionEvents::status_only(VisionStatus::Idle, now))
            }
        }
    }

    /// Current sequencer state, or `None` when it has never been written.
    pub fn read_robot_state(&self) -> Result<Option<RobotState>> {
        read_json_retrying(&self.robot_state_path())
    }

    /// Used by tests and the CLI to stand in for the sequencer.
    pub fn write_robot_state(&self, state: &RobotState) -> Result<()> {
        write_json_atomic(&self.robot_state_path(), state)
    }

    /// [`read_robot_state`](Self::read_robot_state) for the daemon loop.
    pub async fn poll_robot_state(&self) -> Result<Option<RobotState>> {
        read_json_retrying_async(&self.robot_state_path()).await
    }

    pub fn read_events(&self) -> Result<Option<VisionEvents>> {
        read_json_retrying(&self.events_path())
    }

    fn write_events(&self, events: &VisionEvents) -> Result<()> {
        write_json_atomic(&self.events_path(), events)
    }

    /// Publish a trigger event, replacing whatever was there.
    pub fn publish_event(&self, events: &VisionEvents) -> Result<()> {
        self.write_events(events)
    }

    /// Publish a plain status. Skipped while an unconsumed event is pending,
    /// since acknowledging events belongs to the sequencer.
    ///
    /// Returns whether the file was written.
    pub fn publish_status(&self, status: VisionStatus, now: DateTime<Utc>) -> Result<bool> {
        let current = self.read_events();
        self.replace_status(current, status, now)
    }

    /// [`publish_status`](Self::publish_status) for the daemon loop.
    pub async fn publish_status_async(&self, status: VisionStatus, now: DateTime<Utc>) -> Result<bool> {
        let current = read_json_retrying_async(&self.events_path()).await;
        self.replace_status(current, status, now)
    }

    fn replace_status(
        &self,
        current: Result<Option<VisionEvents>>,
        status: VisionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match current {
            Ok(Some(current)) if current.has_pending_event() => return Ok(false),
            Ok(_) => {}
            Err(e) => warn!("Overwriting unreadable events file: {}", e),
        }
        self.write_events(&VisionEvents::status_only(status, now))?;
        Ok(true)
    }

    /// Publish a daemon-level error. Always written.
    pub fn publish_error(&self, message: &str, now: DateTime<Utc>) -> Result<()> {
        self.write_events(&VisionEvents::error(message, now))
    }

    /// Consumer side: clear a pending event.
    pub fn acknowledge(&self, now: DateTime<Utc>) -> Result<()> {
        self.write_events(&VisionEvents::status_only(VisionStatus::Idle, now))
    }

    pub fn write_liveness(&self, liveness: &Liveness) -> Result<()> {
        write_json_atomic(&self.liveness_path(), liveness)
    }

    pub fn read_liveness(&self) -> Result<Option<Liveness>> {
        read_json_retrying(&self.liveness_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drishti_core::{RobotPhase, TriggerAction};

    fn channel() -> (tempfile::TempDir, IpcChannel) {
        let dir = tempfile::tempdir().unwrap();
        let ipc = IpcChannel::new(dir.path().join("ipc"));
        ipc.init(Utc::now()).unwrap();
        (dir, ipc)
    }

    fn fired_event() -> VisionEvents {
        let mut events = VisionEvents::status_only(VisionStatus::Triggered, Utc::now());
        events.trigger_id = Some("pick".to_string());
        events.event = Some(drishti_core::EventPayload {
            timestamp: events.last_check,
            result: "object_present".to_string(),
            zone: "tray".to_string(),
            confidence: 0.5,
            area: 256,
            boxes: vec![[1, 2, 3, 4]],
            action: Some(TriggerAction::Stop),
            message: None,
        });
        events
    }

    #[test]
    fn test_init_writes_idle() {
        let (_dir, ipc) = channel();
        let events = ipc.read_events().unwrap().unwrap();
        assert_eq!(events.status, VisionStatus::Idle);
        assert!(events.event.is_none());
    }

    #[test]
    fn test_init_keeps_pending_event() {
        let (_dir, ipc) = channel();
        ipc.publish_event(&fired_event()).unwrap();
        ipc.init(Utc::now()).unwrap();
        assert!(ipc.read_events().unwrap().unwrap().has_pending_event());
    }

    #[test]
    fn test_init_replaces_garbage() {
        let (_dir, ipc) = channel();
        std::fs::write(ipc.events_path(), b"{\"last_check\": 1").unwrap();
        ipc.init(Utc::now()).unwrap();
        assert_eq!(ipc.read_events().unwrap().unwrap().status, VisionStatus::Idle);
    }

    #[test]
    fn test_init_replaces_previous_error() {
        let (_dir, ipc) = channel();
        ipc.publish_error("5 consecutive capture failures", Utc::now()).unwrap();
        ipc.init(Utc::now()).unwrap();
        let events = ipc.read_events().unwrap().unwrap();
        assert_eq!(events.status, VisionStatus::Idle);
        assert!(events.event.is_none());
    }

    #[test]
    fn test_status_replaces_error_document() {
        let (_dir, ipc) = channel();
        ipc.publish_error("camera lost", Utc::now()).unwrap();
        assert!(ipc.publish_status(VisionStatus::Detecting, Utc::now()).unwrap());
        assert_eq!(ipc.read_events().unwrap().unwrap().status, VisionStatus::Detecting);
    }

    #[tokio::test]
    async fn test_async_reads_match_blocking_reads() {
        let (_dir, ipc) = channel();
        assert!(ipc.poll_robot_state().await.unwrap().is_none());
        ipc.write_robot_state(&RobotState::home()).unwrap();
        assert_eq!(ipc.poll_robot_state().await.unwrap(), ipc.read_robot_state().unwrap());

        ipc.publish_event(&fired_event()).unwrap();
        assert!(!ipc.publish_status_async(VisionStatus::Detecting, Utc::now()).await.unwrap());
        ipc.acknowledge(Utc::now()).unwrap();
        assert!(ipc.publish_status_async(VisionStatus::Detecting, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_async_read_gives_up_on_garbage() {
        let (_dir, ipc) = channel();
        std::fs::write(ipc.robot_state_path(), b"{\"state\": ").unwrap();
        assert!(matches!(ipc.poll_robot_state().await, Err(DaemonError::Ipc(_))));
    }

    #[test]
    fn test_status_does_not_clobber_pending_event() {
        let (_dir, ipc) = channel();
        ipc.publish_event(&fired_event()).unwrap();
        assert!(!ipc.publish_status(VisionStatus::Detecting, Utc::now()).unwrap());
        let events = ipc.read_events().unwrap().unwrap();
        assert_eq!(events.status, VisionStatus::Triggered);

        ipc.acknowledge(Utc::now()).unwrap();
        assert!(ipc.publish_status(VisionStatus::Detecting, Utc::now()).unwrap());
        assert_eq!(ipc.read_events().unwrap().unwrap().status, VisionStatus::Detecting);
    }

    #[test]
    fn test_error_always_written() {
        let (_dir, ipc) = channel();
        ipc.publish_event(&fired_event()).unwrap();
        ipc.publish_error("camera lost", Utc::now()).unwrap();
        let events = ipc.read_events().unwrap().unwrap();
        assert_eq!(events.status, VisionStatus::Error);
        assert_eq!(events.event.unwrap().message.as_deref(), Some("camera lost"));
    }

    #[test]
    fn test_robot_state_missing_and_present() {
        let (_dir, ipc) = channel();
        assert!(ipc.read_robot_state().unwrap().is_none());
        let mut state = RobotState::home();
        state.state = RobotPhase::Moving;
        state.moving = true;
        ipc.write_robot_state(&state).unwrap();
        assert_eq!(ipc.read_robot_state().unwrap(), Some(state));
    }

    #[test]
    fn test_robot_state_garbage_is_error() {
        let (_dir, ipc) = channel();
        std::fs::write(ipc.robot_state_path(), b"not json").unwrap();
        assert!(matches!(ipc.read_robot_state(), Err(DaemonError::Ipc(_))));
    }

    #[test]
    fn test_liveness_roundtrip() {
        let (_dir, ipc) = channel();
        let liveness = Liveness {
            pid: 42,
            heartbeat: 1_700_000_000.5,
            started_at: 1_700_000_000.0,
            mode: "idle".to_string(),
            cycles: 3,
            restarts: 1,
        };
        ipc.write_liveness(&liveness).unwrap();
        assert_eq!(ipc.read_liveness().unwrap(), Some(liveness));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let (_dir, ipc) = channel();
        for _ in 0..5 {
            ipc.publish_status(VisionStatus::Detecting, Utc::now()).unwrap();
        }
        let leftovers = std::fs::read_dir(ipc.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
