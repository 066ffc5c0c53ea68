//! drishti-daemon: the long-running vision trigger service
//!
//! Watches a fixed camera, evaluates zone triggers while the attached robot
//! is idle, and hands discrete events to the task sequencer through JSON
//! files in a shared directory.

pub mod capture;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod memory;
pub mod store;

pub use config::DaemonConfig;
pub use daemon::{CycleReport, Daemon, DaemonState, ExitReason, ReloadSignal, ShutdownSignal};
pub use error::{DaemonError, Result};
pub use ipc::IpcChannel;
pub use store::TriggerStore;

/// Exit status asking a supervisor to start a fresh process.
pub const EXIT_RESTART: i32 = 75;
