//! The daemon loop.
//!
//! ```text
//! INIT -> IDLE_POLL <-> ACTIVE_POLL -> SHUTTING_DOWN
//!              \            /
//!               RESTARTING
//! ```
//!
//! One cycle reads the sequencer's state, captures a frame if any trigger's
//! gate is open, runs detection for the zones of open triggers, evaluates
//! every trigger in load order and publishes at most one event per firing.
//! Everything happens sequentially; the only suspension point between
//! cycles is the adaptive sleep, which a shutdown request interrupts.

use crate::capture::CaptureWorker;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};
use crate::ipc::IpcChannel;
use crate::memory::MemoryGovernor;
use crate::store::TriggerStore;
use chrono::{DateTime, Utc};
use drishti_core::ipc::epoch_seconds;
use drishti_core::{
    EvalContext, Evaluation, Liveness, RobotState, RuleSet, VisionEvents, VisionStatus, Zone, ZoneKey,
};
use drishti_eye::{Detector, FrameSource};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const RELEASE_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Init,
    IdlePoll,
    ActivePoll,
    Restarting,
    ShuttingDown,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Init => "init",
            DaemonState::IdlePoll => "idle",
            DaemonState::ActivePoll => "active",
            DaemonState::Restarting => "restarting",
            DaemonState::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative shutdown flag, observable both by polling and by awaiting.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
        }
    }

    pub fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Request flag for reloading trigger definitions between cycles.
#[derive(Debug, Clone, Default)]
pub struct ReloadSignal {
    flag: Arc<AtomicBool>,
}

impl ReloadSignal {
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

/// Why [`Daemon::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    /// The process should be replaced by a fresh one.
    Restart(String),
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub state: DaemonState,
    /// A frame was grabbed and run through detection.
    pub captured: bool,
    pub capture_failed: bool,
    /// Triggers that fired, in evaluation order.
    pub fired: Vec<String>,
    pub gated: usize,
    pub errors: usize,
}

impl CycleReport {
    fn new(state: DaemonState) -> Self {
        Self {
            state,
            captured: false,
            capture_failed: false,
            fired: Vec::new(),
            gated: 0,
            errors: 0,
        }
    }
}

fn zone_keys(rules: &RuleSet) -> Vec<(ZoneKey, Zone)> {
    rules
        .units()
        .flat_map(|unit| {
            unit.zones
                .iter()
                .map(move |zone| (ZoneKey::new(unit.trigger.id.clone(), zone.id()), zone.clone()))
        })
        .collect()
}

pub struct Daemon {
    config: DaemonConfig,
    ipc: IpcChannel,
    store: TriggerStore,
    rules: RuleSet,
    detector: Detector,
    capture: CaptureWorker,
    memory: MemoryGovernor,
    state: DaemonState,
    shutdown: ShutdownSignal,
    reload: ReloadSignal,
    started_at: DateTime<Utc>,
    restarts: u32,
    cycles: u64,
    events: u64,
    /// A fired event whose write failed. Retried before anything else is
    /// published so a later status cannot take its place.
    pending_event: Option<VisionEvents>,
    consecutive_failures: u32,
    last_robot: Option<RobotState>,
    active_since: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
}

impl Daemon {
    /// INIT: load triggers, prepare IPC, open the capture device and publish
    /// the first liveness record.
    pub async fn init(config: DaemonConfig, source: Box<dyn FrameSource>) -> Result<Self> {
        Self::init_after_restarts(config, source, 0).await
    }

    /// Same as [`init`](Self::init) for a process that replaced an earlier one.
    pub async fn init_after_restarts(
        config: DaemonConfig,
        source: Box<dyn FrameSource>,
        restarts: u32,
    ) -> Result<Self> {
        config.validate()?;
        let now = Utc::now();

        let store = TriggerStore::open(&config.daemon.triggers_dir, config.daemon.backup_retention)?;
        let rules = RuleSet::new(store.load_enabled(config.daemon.strict_load)?);
        if rules.is_empty() {
            warn!("No enabled triggers in {}", store.root().display());
        }

        let ipc = IpcChannel::new(&config.daemon.ipc_dir);
        ipc.init(now)?;

        let mut detector = Detector::new(config.detector.clone())?;
        detector.set_zones(zone_keys(&rules));

        let capture = CaptureWorker::spawn(
            source,
            config.capture_timeout(),
            config.memory.frame_buffer_size,
        )
        .await?;

        let memory = MemoryGovernor::new(&config.memory);
        let mut daemon = Self {
            config,
            ipc,
            store,
            rules,
            detector,
            capture,
            memory,
            state: DaemonState::Init,
            shutdown: ShutdownSignal::new(),
            reload: ReloadSignal::default(),
            started_at: now,
            restarts,
            cycles: 0,
            events: 0,
            pending_event: None,
            consecutive_failures: 0,
            last_robot: None,
            active_since: None,
            last_activity: None,
        };
        daemon.heartbeat(now);
        daemon.state = DaemonState::IdlePoll;
        info!(
            triggers = daemon.rules.len(),
            zones = daemon.detector.zone_count(),
            source = %daemon.capture.name(),
            restarts,
            "Daemon initialized"
        );
        Ok(daemon)
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn reload_signal(&self) -> ReloadSignal {
        self.reload.clone()
    }

    /// Replace the memory governor, e.g. with one using a custom probe.
    pub fn set_memory_governor(&mut self, memory: MemoryGovernor) {
        self.memory = memory;
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn ipc(&self) -> &IpcChannel {
        &self.ipc
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn events_published(&self) -> u64 {
        self.events
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// A fired event is still waiting to be written.
    pub fn has_unpublished_event(&self) -> bool {
        self.pending_event.is_some()
    }

    /// Reload every trigger unit and swap the set in one step. On failure
    /// the current set stays in place.
    pub fn reload_rules(&mut self) -> Result<usize> {
        let units = self.store.load_enabled(self.config.daemon.strict_load)?;
        let rules = self.rules.reloaded(units);
        self.detector.set_zones(zone_keys(&rules));
        self.rules = rules;
        info!(triggers = self.rules.len(), "Trigger definitions reloaded");
        Ok(self.rules.len())
    }

    /// Sleep before the next cycle in the current state.
    pub fn next_interval(&self) -> Duration {
        let perf = &self.config.performance;
        let interval = match self.state {
            DaemonState::ActivePoll => perf.active_interval(),
            _ => perf.idle_interval(),
        };
        interval.max(perf.min_interval())
    }

    pub async fn cycle(&mut self) -> Result<CycleReport> {
        self.cycle_at(Utc::now()).await
    }

    /// Run one cycle as if the clock read `now`. Only restart-class errors
    /// are returned; everything else is logged and absorbed.
    pub async fn cycle_at(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let outcome = self.step(now).await;
        self.cycles += 1;
        self.heartbeat(now);
        if self.config.daemon.stats_interval > 0 && self.cycles % self.config.daemon.stats_interval == 0 {
            info!(
                cycles = self.cycles,
                detections = self.detector.detections(),
                events = self.events,
                rss_mb = ?self.memory.last_rss_mb(),
                mode = %self.state,
                "daemon stats"
            );
        }
        outcome
    }

    async fn step(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        if self.reload.take() {
            if let Err(e) = self.reload_rules() {
                error!("Reload rejected, keeping current triggers: {}", e);
            }
        }
        self.memory.check()?;
        self.flush_pending_event();

        let robot = match self.ipc.poll_robot_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Robot state unreadable, treating every gate as closed: {}", e);
                None
            }
        };
        let robot_changed = match (&self.last_robot, &robot) {
            (Some(prev), Some(cur)) => prev.gate_inputs_differ(cur),
            (None, None) => false,
            _ => true,
        };
        self.last_robot = robot.clone();

        let open: HashSet<String> = self
            .rules
            .iter()
            .filter(|t| t.unit.trigger.enabled && t.unit.trigger.active_when.is_open(robot.as_ref()))
            .map(|t| t.unit.trigger.id.clone())
            .collect();

        if open.is_empty() {
            self.enter_idle();
            let mut report = CycleReport::new(self.state);
            report.gated = self.rules.len();
            self.publish_status(VisionStatus::Idle, now).await;
            return Ok(report);
        }

        let frame = match self.capture.grab().await {
            Ok(frame) => {
                self.consecutive_failures = 0;
                frame
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    failures = self.consecutive_failures,
                    "Capture failed, skipping cycle: {}", e
                );
                if self.consecutive_failures >= self.config.daemon.max_capture_failures {
                    return Err(DaemonError::CaptureEscalation {
                        failures: self.consecutive_failures,
                    });
                }
                let mut report = CycleReport::new(self.state);
                report.capture_failed = true;
                return Ok(report);
            }
        };

        let detection = self.detector.process(&frame, |key| open.contains(&key.trigger_id));
        drop(frame);

        if self.memory.note_detection() {
            self.detector.compact();
        }

        let default_stability = self.config.detector.stability_frames;
        let ctx = EvalContext {
            frame: &detection,
            robot: robot.as_ref(),
            now,
            default_stability,
        };
        let outcomes = self.rules.evaluate_all(&ctx);

        let mut report = CycleReport::new(self.state);
        report.captured = true;
        for (trigger_id, outcome) in outcomes {
            match outcome {
                Ok(Evaluation::Fired(firing)) => {
                    info!(
                        trigger_id = %trigger_id,
                        zone = %firing.zone,
                        result = %firing.result,
                        confidence = firing.confidence,
                        "Trigger fired"
                    );
                    let event = firing.to_event();
                    match self.ipc.publish_event(&event) {
                        Ok(()) => {
                            self.events += 1;
                            self.pending_event = None;
                        }
                        Err(e) => {
                            warn!(trigger_id = %trigger_id, "Failed to publish event, will retry: {}", e);
                            self.pending_event = Some(event);
                        }
                    }
                    report.fired.push(trigger_id);
                }
                Ok(Evaluation::Gated) => report.gated += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(trigger_id = %trigger_id, "Evaluation failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        let newly_confirmed = detection
            .zones
            .values()
            .any(|obs| obs.newly_confirmed(default_stability) > 0);
        if report.fired.is_empty() {
            self.publish_status(VisionStatus::Detecting, now).await;
        }
        self.update_mode(now, robot_changed || newly_confirmed || !report.fired.is_empty());
        report.state = self.state;
        debug!(
            sequence = detection.sequence,
            fired = report.fired.len(),
            mode = %self.state,
            "Cycle complete"
        );
        Ok(report)
    }

    fn enter_idle(&mut self) {
        if self.state == DaemonState::ActivePoll {
            info!("Leaving active polling");
        }
        self.state = DaemonState::IdlePoll;
        self.active_since = None;
    }

    fn update_mode(&mut self, now: DateTime<Utc>, activity: bool) {
        if activity {
            self.last_activity = Some(now);
            if self.state != DaemonState::ActivePoll {
                info!("Entering active polling");
                self.state = DaemonState::ActivePoll;
                self.active_since = Some(now);
            }
            return;
        }
        if self.state != DaemonState::ActivePoll {
            return;
        }
        let perf = &self.config.performance;
        let since = |t: Option<DateTime<Utc>>| {
            t.map_or(f64::INFINITY, |t| (now - t).num_milliseconds() as f64 / 1000.0)
        };
        let window_over = since(self.active_since) >= perf.active_window_secs;
        let decayed = since(self.last_activity) >= perf.activity_decay_secs;
        if window_over && decayed {
            self.enter_idle();
        }
    }

    /// Write the event that failed to publish earlier, if any.
    fn flush_pending_event(&mut self) {
        let Some(event) = &self.pending_event else {
            return;
        };
        match self.ipc.publish_event(event) {
            Ok(()) => {
                info!(trigger_id = ?event.trigger_id, "Published delayed event");
                self.events += 1;
                self.pending_event = None;
            }
            Err(e) => warn!(trigger_id = ?event.trigger_id, "Event still unpublished: {}", e),
        }
    }

    async fn publish_status(&self, status: VisionStatus, now: DateTime<Utc>) {
        if self.pending_event.is_some() {
            return;
        }
        if let Err(e) = self.ipc.publish_status_async(status, now).await {
            warn!("Failed to publish status: {}", e);
        }
    }

    fn heartbeat(&self, now: DateTime<Utc>) {
        let liveness = Liveness {
            pid: std::process::id(),
            heartbeat: epoch_seconds(now),
            started_at: epoch_seconds(self.started_at),
            mode: self.state.as_str().to_string(),
            cycles: self.cycles,
            restarts: self.restarts,
        };
        if let Err(e) = self.ipc.write_liveness(&liveness) {
            warn!("Failed to write liveness: {}", e);
        }
    }

    /// Poll until shutdown or a restart-class failure.
    pub async fn run(&mut self) -> Result<ExitReason> {
        let shutdown = self.shutdown.clone();
        while !shutdown.is_triggered() {
            let started = Instant::now();
            match self.cycle().await {
                Ok(_) => {}
                Err(e) if e.requires_restart() => {
                    let reason = e.to_string();
                    self.prepare_restart(&reason).await;
                    return Ok(ExitReason::Restart(reason));
                }
                Err(e) => error!("Cycle failed: {}", e),
            }

            let pause = self.next_interval().saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.wait() => {}
            }
        }
        self.shutdown_gracefully().await;
        Ok(ExitReason::Shutdown)
    }

    /// RESTARTING: make the failure visible, then let go of the camera.
    pub async fn prepare_restart(&mut self, reason: &str) {
        error!("Restarting daemon: {}", reason);
        self.state = DaemonState::Restarting;
        let now = Utc::now();
        if let Some(event) = self.pending_event.take() {
            warn!(trigger_id = ?event.trigger_id, "Dropping unpublished event");
        }
        if let Err(e) = self.ipc.publish_error(reason, now) {
            warn!("Failed to publish error status: {}", e);
        }
        self.heartbeat(now);
        self.capture.shutdown(RELEASE_WAIT).await;
    }

    /// SHUTTING_DOWN: flush IPC state and release the camera.
    pub async fn shutdown_gracefully(&mut self) {
        self.state = DaemonState::ShuttingDown;
        let now = Utc::now();
        self.flush_pending_event();
        self.publish_status(VisionStatus::Idle, now).await;
        self.heartbeat(now);
        self.capture.shutdown(RELEASE_WAIT).await;
        info!(cycles = self.cycles, events = self.events, "Daemon stopped");
    }
}
