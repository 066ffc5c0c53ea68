//! Resident memory governance.

use crate::config::MemoryConfig;
use crate::error::{DaemonError, Result};
use tracing::{debug, error};

/// Resident set size of this process in MB, when the platform exposes it.
pub fn read_rss_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss_mb(&status)
}

fn parse_vm_rss_mb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

type RssProbe = Box<dyn Fn() -> Option<u64> + Send + Sync>;

/// Schedules forced cleanups and enforces the memory ceiling.
pub struct MemoryGovernor {
    limit_mb: u64,
    cleanup_interval: u64,
    since_cleanup: u64,
    last_rss_mb: Option<u64>,
    probe: RssProbe,
}

impl MemoryGovernor {
    pub fn new(config: &MemoryConfig) -> Self {
        Self::with_probe(config, Box::new(read_rss_mb))
    }

    pub fn with_probe(config: &MemoryConfig, probe: RssProbe) -> Self {
        Self {
            limit_mb: config.max_memory_mb,
            cleanup_interval: config.cleanup_interval.max(1),
            since_cleanup: 0,
            last_rss_mb: None,
            probe,
        }
    }

    /// Count one detection; returns true when a forced cleanup is due.
    pub fn note_detection(&mut self) -> bool {
        self.since_cleanup += 1;
        if self.since_cleanup >= self.cleanup_interval {
            self.since_cleanup = 0;
            debug!("Forced cleanup due after {} detections", self.cleanup_interval);
            true
        } else {
            false
        }
    }

    /// Sample resident memory and fail when it is above the ceiling.
    pub fn check(&mut self) -> Result<Option<u64>> {
        let rss = (self.probe)();
        self.last_rss_mb = rss;
        match rss {
            Some(rss_mb) if rss_mb > self.limit_mb => {
                error!("Resident memory {} MB exceeds limit {} MB", rss_mb, self.limit_mb);
                Err(DaemonError::MemoryLimitExceeded {
                    rss_mb,
                    limit_mb: self.limit_mb,
                })
            }
            other => Ok(other),
        }
    }

    pub fn last_rss_mb(&self) -> Option<u64> {
        self.last_rss_mb
    }

    pub fn limit_mb(&self) -> u64 {
        self.limit_mb
    }
}
