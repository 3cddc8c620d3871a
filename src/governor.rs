//! Memory governor: admission check plus interval-gated reclamation.
//!
//! ## Why interval-gated?
//!
//! Walking the process table is not free. The governor piggybacks on
//! incoming requests and performs the full check at most once per
//! `interval`; between checks [`MemoryGovernor::maybe_reclaim`] is a single
//! mutex-guarded timestamp comparison.
//!
//! Reclamation is advisory. It never touches queued or running work: it
//! drops `completed` task records older than the configured TTL together
//! with their output files, then releases the renderer's shared font
//! database. Submissions are refused separately by [`MemoryGovernor::admit`]
//! while usage is above the ceiling.

use crate::error::ScriptDeckError;
use crate::pipeline::draw;
use crate::queue::{JobQueue, TaskStatus};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

const MIB: f64 = 1024.0 * 1024.0;

/// Source of resident-memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Resident bytes of this process plus its child processes.
    fn resident_bytes(&self) -> u64;
}

/// [`MemoryProbe`] backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes();
        system
            .processes()
            .values()
            .filter(|p| p.pid() == pid || p.parent() == Some(pid))
            .map(|p| p.memory())
            .sum()
    }
}

/// Result of one reclamation pass.
#[derive(Debug, Clone, Default)]
pub struct Reclaimed {
    pub usage_mb: f64,
    /// Task records removed, with their artifacts.
    pub purged: Vec<TaskStatus>,
    pub fonts_released: bool,
}

pub struct MemoryGovernor {
    ceiling_bytes: u64,
    interval: Duration,
    completed_ttl: Duration,
    last_check: Mutex<Option<Instant>>,
    probe: Arc<dyn MemoryProbe>,
}

impl fmt::Debug for MemoryGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGovernor")
            .field("ceiling_bytes", &self.ceiling_bytes)
            .field("interval", &self.interval)
            .field("completed_ttl", &self.completed_ttl)
            .finish()
    }
}

impl MemoryGovernor {
    pub fn new(
        ceiling_bytes: u64,
        interval: Duration,
        completed_ttl: Duration,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            ceiling_bytes,
            interval,
            completed_ttl,
            last_check: Mutex::new(None),
            probe,
        }
    }

    /// Current resident usage in MiB, rounded to two decimals.
    pub fn usage_mb(&self) -> f64 {
        (self.probe.resident_bytes() as f64 / MIB * 100.0).round() / 100.0
    }

    fn over_ceiling(&self) -> Option<f64> {
        let bytes = self.probe.resident_bytes();
        (bytes > self.ceiling_bytes).then(|| bytes as f64 / MIB)
    }

    /// Refuse new work while usage is above the ceiling.
    pub fn admit(&self) -> Result<(), ScriptDeckError> {
        match self.over_ceiling() {
            Some(usage_mb) => {
                warn!("Rejecting submission: {:.1}MB in use", usage_mb);
                Err(ScriptDeckError::MemoryPressure {
                    usage_mb,
                    ceiling_mb: self.ceiling_bytes / (1024 * 1024),
                })
            }
            None => Ok(()),
        }
    }

    /// Run a reclamation pass if the interval has elapsed and usage is over
    /// the ceiling. Returns `None` when no pass ran.
    pub fn maybe_reclaim(&self, queue: &JobQueue) -> Option<Reclaimed> {
        {
            let mut last = self.last_check.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if last.is_some_and(|t| now.duration_since(t) < self.interval) {
                return None;
            }
            *last = Some(now);
        }

        let usage_mb = self.over_ceiling()?;
        info!(
            "Memory usage {:.1}MB over ceiling, reclaiming",
            usage_mb
        );
        Some(self.reclaim(queue, usage_mb))
    }

    fn reclaim(&self, queue: &JobQueue, usage_mb: f64) -> Reclaimed {
        let purged = queue.purge_completed_older_than(self.completed_ttl);
        for task in &purged {
            remove_artifacts(task);
        }
        let fonts_released = draw::release_fonts();
        info!(
            "Reclaimed {} completed tasks{}",
            purged.len(),
            if fonts_released { ", released font database" } else { "" }
        );
        Reclaimed {
            usage_mb,
            purged,
            fonts_released,
        }
    }
}

/// Delete a task's output directory. Missing directories are fine.
pub(crate) fn remove_artifacts(task: &TaskStatus) {
    match std::fs::remove_dir_all(&task.artifacts_dir) {
        Ok(()) => debug!("Removed artifacts {}", task.artifacts_dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Could not remove artifacts {}: {}",
            task.artifacts_dir.display(),
            e
        ),
    }
}
