//! Error types for the notes2script library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ScriptDeckError`] — **Fatal** to the caller: the request cannot
//!   proceed at all (unreadable deck, no notes to convert, server out of
//!   memory, queue full, unknown task). Returned as `Err(ScriptDeckError)`
//!   from the service and conversion entry points. Inside the job queue a
//!   fatal error only fails that one job.
//!
//! * [`ToolError`] — **Non-fatal**: one thumbnail tier could not deliver
//!   (renderer missing, tool exited non-zero, wrong image count). The
//!   pipeline logs it and falls through to the next tier; it never reaches
//!   the caller.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the notes2script library.
///
/// Tier-level failures use [`ToolError`] and are absorbed by
/// [`crate::pipeline::ThumbnailPipeline`].
#[derive(Debug, Error)]
pub enum ScriptDeckError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Presentation not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file name does not carry an extension the deck reader accepts.
    #[error("Unsupported file '{name}': only {accepted} files are supported")]
    UnsupportedFile { name: String, accepted: String },

    /// The deck reader could not parse the document.
    #[error("Could not read presentation '{path}': {detail}")]
    DeckUnreadable { path: PathBuf, detail: String },

    /// Every slide had empty notes; there is nothing to turn into a script.
    #[error("No script slides could be generated from the notes of '{path}'")]
    NoScriptSlides { path: PathBuf },

    // ── Thumbnail errors ──────────────────────────────────────────────────
    /// Even the placeholder image for a slide could not be written.
    #[error("Could not produce any thumbnail for slide {slide}: {detail}")]
    ThumbnailUnavailable { slide: usize, detail: String },

    // ── Queue / service errors ────────────────────────────────────────────
    /// Resident memory is above the configured ceiling; new work is refused.
    #[error("Server memory usage too high ({usage_mb:.1}MB > {ceiling_mb}MB). Please try again later.")]
    MemoryPressure { usage_mb: f64, ceiling_mb: u64 },

    /// Admission control: too many jobs are already waiting.
    #[error("Conversion queue is full ({depth} jobs waiting). Please try again later.")]
    QueueFull { depth: usize },

    /// No task with this id is known (never existed, or already cleaned up).
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// The task exists but has not produced a downloadable result.
    #[error("Conversion not completed for task {task_id} (status: {status})")]
    NotCompleted { task_id: String, status: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScriptDeckError {
    /// Whether a client may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScriptDeckError::MemoryPressure { .. } | ScriptDeckError::QueueFull { .. }
        )
    }
}

/// A non-fatal failure of a single thumbnail tier.
///
/// Every variant causes tier fallthrough; none is shown to the caller except
/// as a line in the job log.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    /// The render tool is not installed or cannot be loaded.
    #[error("{tool} is not available: {detail}")]
    Unavailable { tool: String, detail: String },

    /// The tool ran but exited non-zero or returned an error.
    #[error("{tool} failed: {detail}")]
    InvocationFailed { tool: String, detail: String },

    /// The tool produced a different number of images than expected.
    #[error("{tool} produced {produced} images, expected {expected}")]
    CountMismatch {
        tool: String,
        expected: usize,
        produced: usize,
    },

    /// Scratch-directory I/O around the tool failed.
    #[error("I/O error around {tool}: {detail}")]
    Io { tool: String, detail: String },
}

impl ToolError {
    pub(crate) fn io(tool: &str, err: std::io::Error) -> Self {
        ToolError::Io {
            tool: tool.to_string(),
            detail: err.to_string(),
        }
    }
}
