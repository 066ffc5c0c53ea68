//! Error types for the daemon

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Trigger store error: {0}")]
    Store(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("{failures} consecutive capture failures")]
    CaptureEscalation { failures: u32 },

    #[error("Memory limit exceeded: {rss_mb} MB resident, limit {limit_mb} MB")]
    MemoryLimitExceeded { rss_mb: u64, limit_mb: u64 },

    #[error(transparent)]
    Core(#[from] drishti_core::Error),

    #[error(transparent)]
    Vision(#[from] drishti_eye::VisionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    /// Errors that end the current process and call for a clean restart.
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            DaemonError::CaptureEscalation { .. } | DaemonError::MemoryLimitExceeded { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
