//! The conversion service: one object owning the queue, its worker, the
//! thumbnail cache and the memory governor.
//!
//! Front ends (the CLI, an HTTP layer) talk only to [`ScriptService`]:
//!
//! ```text
//! submit ──▶ governor.admit ──▶ upload → temp dir ──▶ queue.enqueue
//! status ──▶ queue.status
//! download ─▶ open output; artifacts + record removed when dropped
//! cleanup ──▶ queue.remove + artifacts
//! health ──▶ governor.usage_mb, queue counts, cache stats
//! ```
//!
//! Every method returns promptly. Conversion happens on the single worker
//! spawned by [`ScriptService::new`].

use crate::cache::{CacheStats, ThumbnailCache};
use crate::config::ServiceConfig;
use crate::convert::Converter;
use crate::deck::DeckReader;
use crate::error::ScriptDeckError;
use crate::governor::{remove_artifacts, MemoryGovernor, MemoryProbe, SysinfoProbe};
use crate::input::sanitize_upload_name;
use crate::pipeline::RenderTools;
use crate::queue::{ConversionJob, JobEvent, JobQueue, TaskState, TaskStatus};
use crate::script::ScriptWriter;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Uploads are copied to disk in chunks of this size.
const UPLOAD_CHUNK: usize = 4 * 1024 * 1024;

pub const SERVICE_NAME: &str = "notes2script";

/// Returned by [`ScriptService::submit`].
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub task_id: Uuid,
    pub status: TaskState,
    pub queue_position: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: &'static str,
    pub memory_usage_mb: f64,
    pub active_tasks: usize,
    pub tracked_tasks: usize,
    pub cache: Option<CacheStats>,
}

/// An open result document.
///
/// Reads like a file. When dropped, the task's status record and output
/// directory are removed: a result can be downloaded once.
#[derive(Debug)]
pub struct Download {
    file: tokio::fs::File,
    pub file_name: String,
    pub len: u64,
    _guard: DownloadGuard,
}

impl AsyncRead for Download {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

#[derive(Debug)]
struct DownloadGuard {
    queue: Arc<JobQueue>,
    task_id: Uuid,
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        if let Ok(task) = self.queue.remove(&self.task_id) {
            remove_artifacts(&task);
            debug!("Task {} cleaned up after download", self.task_id);
        }
    }
}

pub struct ScriptService {
    config: ServiceConfig,
    converter: Converter,
    queue: Arc<JobQueue>,
    governor: MemoryGovernor,
    worker: JoinHandle<()>,
}

impl std::fmt::Debug for ScriptService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptService")
            .field("queue", &self.queue)
            .field("governor", &self.governor)
            .finish()
    }
}

impl ScriptService {
    /// Build the service and spawn its worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: ServiceConfig,
        tools: RenderTools,
        reader: Arc<dyn DeckReader>,
        writer: Arc<dyn ScriptWriter>,
    ) -> Self {
        Self::with_probe(config, tools, reader, writer, Arc::new(SysinfoProbe::default()))
    }

    /// Like [`Self::new`] with a custom memory probe.
    pub fn with_probe(
        config: ServiceConfig,
        tools: RenderTools,
        reader: Arc<dyn DeckReader>,
        writer: Arc<dyn ScriptWriter>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let converter = Converter::from_config(&config, tools, reader, writer);
        let queue = Arc::new(JobQueue::new(config.max_queue_depth));
        let worker = queue.spawn_worker(Arc::new(converter.clone()));
        let governor = MemoryGovernor::new(
            config.memory_ceiling_bytes,
            config.governor_interval,
            config.completed_ttl,
            probe,
        );
        info!(
            "Service ready: queue depth {}, memory ceiling {}MB",
            config.max_queue_depth,
            config.memory_ceiling_mb()
        );
        Self {
            config,
            converter,
            queue,
            governor,
            worker,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn governor(&self) -> &MemoryGovernor {
        &self.governor
    }

    pub fn cache(&self) -> Option<&Arc<ThumbnailCache>> {
        self.converter.pipeline.cache()
    }

    /// Store an uploaded presentation and queue it for conversion.
    ///
    /// The stored copy is stamped with the upload time, so its thumbnails
    /// are only reused if the same copy is converted again. Use
    /// [`Self::submit_with_modified`] when the source modification time is
    /// known.
    ///
    /// # Errors
    /// `MemoryPressure` while over the ceiling, `UnsupportedFile` for a
    /// rejected name, `QueueFull`, or an I/O failure storing the upload.
    pub async fn submit<R>(&self, file_name: &str, upload: R) -> Result<SubmitReceipt, ScriptDeckError>
    where
        R: AsyncRead + Unpin,
    {
        self.submit_with_modified(file_name, upload, None).await
    }

    /// [`Self::submit`], keeping `modified` as the stored copy's
    /// modification time. The cache fingerprint then matches across
    /// submissions of the same unchanged file.
    pub async fn submit_with_modified<R>(
        &self,
        file_name: &str,
        mut upload: R,
        modified: Option<SystemTime>,
    ) -> Result<SubmitReceipt, ScriptDeckError>
    where
        R: AsyncRead + Unpin,
    {
        self.governor.maybe_reclaim(&self.queue);
        self.governor.admit()?;
        let name = sanitize_upload_name(file_name, self.converter.reader.as_ref())?;

        let work_root = &self.config.work_root;
        let store_err = |e: io::Error| ScriptDeckError::OutputWriteFailed {
            path: work_root.clone(),
            source: e,
        };
        tokio::fs::create_dir_all(work_root).await.map_err(store_err)?;
        let temp_dir = tempfile::Builder::new()
            .prefix("notes2script_")
            .tempdir_in(work_root)
            .map_err(store_err)?;

        let input_path = temp_dir.path().join(&name);
        let written = store_upload(&mut upload, &input_path, modified).await?;

        let mut job = ConversionJob::new(input_path, PathBuf::new(), temp_dir);
        job.output_dir = self.config.artifacts_root.join(job.task_id.to_string());
        let task_id = job.task_id;
        debug!("Task {}: stored {} ({} bytes)", task_id, name, written);

        let queue_position = self.queue.enqueue(job)?;
        Ok(SubmitReceipt {
            task_id,
            status: TaskState::Queued,
            queue_position,
        })
    }

    pub fn status(&self, task_id: &Uuid) -> Result<TaskStatus, ScriptDeckError> {
        self.queue
            .status(task_id)
            .ok_or_else(|| ScriptDeckError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Open the result of a completed task.
    ///
    /// # Errors
    /// `TaskNotFound`, or `NotCompleted` while the task is not `completed`.
    pub async fn download(&self, task_id: &Uuid) -> Result<Download, ScriptDeckError> {
        let status = self.status(task_id)?;
        let path = match (&status.status, &status.output_path) {
            (TaskState::Completed, Some(path)) => path.clone(),
            _ => {
                return Err(ScriptDeckError::NotCompleted {
                    task_id: task_id.to_string(),
                    status: status.status.to_string(),
                })
            }
        };
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| ScriptDeckError::FileNotFound { path: path.clone() })?;
        let len = file
            .metadata()
            .await
            .map(|m| m.len())
            .unwrap_or_default();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.output_file_name.clone());
        Ok(Download {
            file,
            file_name,
            len,
            _guard: DownloadGuard {
                queue: Arc::clone(&self.queue),
                task_id: *task_id,
            },
        })
    }

    /// Delete a finished task's record and output.
    pub fn cleanup(&self, task_id: &Uuid) -> Result<(), ScriptDeckError> {
        let task = self.queue.remove(task_id)?;
        remove_artifacts(&task);
        info!("Task {} cleaned up", task_id);
        Ok(())
    }

    pub fn health(&self) -> HealthReport {
        self.governor.maybe_reclaim(&self.queue);
        HealthReport {
            status: "healthy",
            service: SERVICE_NAME,
            memory_usage_mb: self.governor.usage_mb(),
            active_tasks: self.queue.active_count(),
            tracked_tasks: self.queue.task_count(),
            cache: self.cache().map(|c| c.stats()),
        }
    }

    /// Receive job events from now on. Subscribe before submitting to see
    /// a task's first event.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.queue.subscribe()
    }
}

impl Drop for ScriptService {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn store_upload<R>(
    upload: &mut R,
    dest: &std::path::Path,
    modified: Option<SystemTime>,
) -> Result<u64, ScriptDeckError>
where
    R: AsyncRead + Unpin,
{
    let write_err = |e: io::Error| ScriptDeckError::OutputWriteFailed {
        path: dest.to_path_buf(),
        source: e,
    };
    let mut file = tokio::fs::File::create(dest).await.map_err(write_err)?;
    let mut buf = vec![0u8; UPLOAD_CHUNK];
    let mut total = 0u64;
    loop {
        let n = upload.read(&mut buf).await.map_err(write_err)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await.map_err(write_err)?;
        total += n as u64;
    }
    file.flush().await.map_err(write_err)?;

    if let Some(modified) = modified {
        let file = file.into_std().await;
        tokio::task::spawn_blocking(move || file.set_modified(modified))
            .await
            .map_err(|e| write_err(io::Error::other(e)))?
            .map_err(write_err)?;
    }
    Ok(total)
}
