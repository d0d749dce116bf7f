//! Class-specific health checks evaluated on every supervisor tick

use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Kill(String),
}

pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, pid: u32) -> HealthVerdict;
}

/// Kills a listener that holds more open sockets than `max`.
///
/// Long-running listeners can leak descriptors for sessions that never
/// closed cleanly; a restart releases all of them.
#[derive(Debug, Clone)]
pub struct OpenConnectionLimit {
    max: usize,
    proc_root: PathBuf,
}

impl OpenConnectionLimit {
    pub fn new(max: usize) -> Self {
        Self::with_proc_root(max, "/proc")
    }

    pub fn with_proc_root(max: usize, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            max,
            proc_root: proc_root.into(),
        }
    }

    /// Sockets among the descriptors of `pid`, or `None` if they cannot be
    /// listed (process gone, no procfs).
    pub fn open_sockets(&self, pid: u32) -> Option<usize> {
        let fd_dir = self.proc_root.join(pid.to_string()).join("fd");
        let entries = std::fs::read_dir(fd_dir).ok()?;

        let count = entries
            .filter_map(Result::ok)
            .filter_map(|entry| std::fs::read_link(entry.path()).ok())
            .filter(|target| target.to_string_lossy().starts_with("socket:"))
            .count();
        Some(count)
    }
}

impl HealthCheck for OpenConnectionLimit {
    fn name(&self) -> &str {
        "open-connection-limit"
    }

    fn check(&self, pid: u32) -> HealthVerdict {
        match self.open_sockets(pid) {
            Some(open) if open > self.max => {
                HealthVerdict::Kill(format!("{open} open sockets exceed the limit of {}", self.max))
            },
            Some(open) => {
                debug!(pid, open, "Open socket count");
                HealthVerdict::Healthy
            },
            None => HealthVerdict::Healthy,
        }
    }
}
