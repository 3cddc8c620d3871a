//! Job log sink: the append-only progress channel threaded through a job.
//!
//! The pipeline and the conversion body report human-readable progress lines
//! ("batch 1-40 rasterised", "slide 3: placeholder used") through a
//! [`JobLog`]. The sink decides where lines go: the queue's implementation
//! appends them to the task's status record for polling clients, the CLI
//! prints them, tests collect them.
//!
//! Every line is also mirrored to `tracing` at INFO by [`emit`], so server
//! logs carry the same story as the status endpoint.
//!
//! # Example
//!
//! ```rust
//! use notes2script::{JobLog, MemoryLog};
//!
//! let log = MemoryLog::default();
//! log.line("cache: 3/3 hits".to_string());
//! assert_eq!(log.lines(), vec!["cache: 3/3 hits".to_string()]);
//! ```

use std::sync::{Arc, Mutex};
use tracing::info;

/// Receives progress lines for one job, in order.
///
/// Implementations must be `Send + Sync`: a job runs on the blocking pool
/// while status readers look at the same sink from request handlers.
pub trait JobLog: Send + Sync {
    /// Append one line. Lines are never retracted.
    fn line(&self, message: String);
}

/// Log `message` to `tracing` and append it to `sink`.
pub fn emit(sink: &dyn JobLog, message: impl Into<String>) {
    let message = message.into();
    info!("{}", message);
    sink.line(message);
}

/// A sink that drops every line (tracing output from [`emit`] remains).
pub struct NoopLog;

impl JobLog for NoopLog {
    fn line(&self, _message: String) {}
}

/// A sink that keeps every line in memory.
#[derive(Default, Clone)]
pub struct MemoryLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryLog {
    /// Snapshot of all lines so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl JobLog for MemoryLog {
    fn line(&self, message: String) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(message);
        }
    }
}
