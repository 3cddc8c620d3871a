//! Sequential conversion job queue with per-task status records.
//!
//! ## Why a single consumer?
//!
//! A job holds a whole deck in memory plus one raster image per slide and
//! drives external converters that are memory-hungry themselves. Running
//! jobs one at a time bounds peak memory to one job's footprint and
//! serialises every external-process invocation. Request handling stays
//! concurrent: submitting and polling only touch the shared state under a
//! short lock and return immediately.
//!
//! ## Status lifecycle
//!
//! ```text
//! queued ──▶ processing ──▶ completed
//!    │            └───────▶ failed
//!    └─────────────────────▶ failed
//! ```
//!
//! [`TaskStatus::transition`] refuses every other move, so a terminal status
//! never regresses. `queue_position` is the zero-based rank among waiting
//! jobs and is `None` for any task that is not waiting. Queue and status
//! mutations share one mutex, so positions are always contiguous.

use crate::convert::Converter;
use crate::error::ScriptDeckError;
use crate::progress::JobLog;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

// ── Task status ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    fn can_become(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Processing) | (Queued, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The pollable record of one submitted conversion.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task_id: Uuid,
    pub status: TaskState,
    /// Latest progress line or outcome.
    pub message: String,
    /// Every progress line, oldest first.
    pub logs: Vec<String>,
    /// Where the result can be fetched once completed.
    pub download_url: Option<String>,
    pub queue_position: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub output_path: Option<PathBuf>,
    /// Directory holding this task's output; removed on cleanup.
    #[serde(skip)]
    pub artifacts_dir: PathBuf,
}

impl TaskStatus {
    fn queued(job: &ConversionJob) -> Self {
        Self {
            task_id: job.task_id,
            status: TaskState::Queued,
            message: "Waiting in queue...".to_string(),
            logs: Vec::new(),
            download_url: None,
            queue_position: None,
            created_at: job.created_at,
            finished_at: None,
            output_path: None,
            artifacts_dir: job.output_dir.clone(),
        }
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn transition(&mut self, next: TaskState) -> bool {
        if !self.status.can_become(next) {
            warn!(
                "Task {}: refusing transition {} -> {}",
                self.task_id, self.status, next
            );
            return false;
        }
        self.status = next;
        self.queue_position = None;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    fn push_log(&mut self, line: String) {
        self.message = line.clone();
        self.logs.push(line);
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────

/// A unit of queued work. Owns its scratch directory, which is deleted when
/// the job is dropped, whatever the outcome.
#[derive(Debug)]
pub struct ConversionJob {
    pub task_id: Uuid,
    pub input_path: PathBuf,
    /// Where the result document is written; outlives the job.
    pub output_dir: PathBuf,
    pub temp_dir: TempDir,
    pub created_at: DateTime<Utc>,
}

impl ConversionJob {
    pub fn new(input_path: PathBuf, output_dir: PathBuf, temp_dir: TempDir) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            input_path,
            output_dir,
            temp_dir,
            created_at: Utc::now(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// Executes one job body. Runs on the blocking pool.
pub trait JobRunner: Send + Sync + 'static {
    /// Run `job`, reporting through `log`; returns the output file.
    fn run(&self, job: &ConversionJob, log: &dyn JobLog) -> Result<PathBuf, ScriptDeckError>;
}

impl JobRunner for Converter {
    fn run(&self, job: &ConversionJob, log: &dyn JobLog) -> Result<PathBuf, ScriptDeckError> {
        self.convert(&job.input_path, job.work_dir(), &job.output_dir, log)
            .map(|out| out.output_path)
    }
}

// ── Events ───────────────────────────────────────────────────────────────

/// Broadcast to subscribers as tasks progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Queued { task_id: Uuid, position: usize },
    Started { task_id: Uuid },
    Log { task_id: Uuid, line: String },
    Finished { task_id: Uuid, state: TaskState, message: String },
}

impl JobEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            JobEvent::Queued { task_id, .. }
            | JobEvent::Started { task_id }
            | JobEvent::Log { task_id, .. }
            | JobEvent::Finished { task_id, .. } => *task_id,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobEvent::Finished { .. })
    }
}

// ── Queue ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<ConversionJob>,
    tasks: HashMap<Uuid, TaskStatus>,
}

impl QueueState {
    fn renumber(&mut self) {
        for (position, job) in self.waiting.iter().enumerate() {
            if let Some(task) = self.tasks.get_mut(&job.task_id) {
                task.queue_position = Some(position);
            }
        }
    }
}

/// FIFO job queue drained by a single worker task.
pub struct JobQueue {
    state: Mutex<QueueState>,
    wake: Notify,
    events: broadcast::Sender<JobEvent>,
    max_depth: usize,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("waiting", &self.waiting_len())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

impl JobQueue {
    /// A queue that accepts at most `max_depth` waiting jobs.
    pub fn new(max_depth: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            events,
            max_depth: max_depth.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Append `job` and return its queue position.
    ///
    /// # Errors
    /// [`ScriptDeckError::QueueFull`] when `max_depth` jobs are already
    /// waiting; the rejected job is dropped and its scratch directory removed.
    pub fn enqueue(&self, job: ConversionJob) -> Result<usize, ScriptDeckError> {
        let task_id = job.task_id;
        let position = {
            let mut state = self.lock();
            if state.waiting.len() >= self.max_depth {
                return Err(ScriptDeckError::QueueFull {
                    depth: state.waiting.len(),
                });
            }
            state.tasks.insert(task_id, TaskStatus::queued(&job));
            state.waiting.push_back(job);
            state.renumber();
            state.waiting.len() - 1
        };
        info!("Task {} queued at position {}", task_id, position);
        self.wake.notify_one();
        self.publish(JobEvent::Queued { task_id, position });
        Ok(position)
    }

    /// Pop the head job and mark it `processing`.
    fn dequeue(&self) -> Option<ConversionJob> {
        let job = {
            let mut state = self.lock();
            let job = state.waiting.pop_front()?;
            if let Some(task) = state.tasks.get_mut(&job.task_id) {
                task.transition(TaskState::Processing);
                task.push_log("Processing slides...".to_string());
            }
            state.renumber();
            job
        };
        self.publish(JobEvent::Started {
            task_id: job.task_id,
        });
        Some(job)
    }

    /// Snapshot of one task's status.
    pub fn status(&self, task_id: &Uuid) -> Option<TaskStatus> {
        self.lock().tasks.get(task_id).cloned()
    }

    /// Forget a finished task and return its record.
    ///
    /// # Errors
    /// `TaskNotFound` for unknown ids; `NotCompleted` for tasks still queued
    /// or processing (a submitted job cannot be withdrawn).
    pub fn remove(&self, task_id: &Uuid) -> Result<TaskStatus, ScriptDeckError> {
        let mut state = self.lock();
        match state.tasks.get(task_id).map(|t| t.status) {
            None => Err(ScriptDeckError::TaskNotFound {
                task_id: task_id.to_string(),
            }),
            Some(s) if !s.is_terminal() => Err(ScriptDeckError::NotCompleted {
                task_id: task_id.to_string(),
                status: s.to_string(),
            }),
            Some(_) => state.tasks.remove(task_id).ok_or_else(|| ScriptDeckError::TaskNotFound {
                task_id: task_id.to_string(),
            }),
        }
    }

    /// Remove `completed` tasks created at least `age` ago; returns them so
    /// the caller can delete their artifacts.
    pub fn purge_completed_older_than(&self, age: Duration) -> Vec<TaskStatus> {
        let now = Utc::now();
        let mut state = self.lock();
        let expired: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskState::Completed)
            .filter(|t| (now - t.created_at).to_std().map_or(false, |a| a >= age))
            .map(|t| t.task_id)
            .collect();
        expired
            .iter()
            .filter_map(|id| state.tasks.remove(id))
            .collect()
    }

    /// Tasks that are queued or processing.
    pub fn active_count(&self) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    /// All task records, including finished ones not yet cleaned up.
    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Receive every [`JobEvent`] published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn append_log(&self, task_id: Uuid, line: String) {
        if let Some(task) = self.lock().tasks.get_mut(&task_id) {
            task.push_log(line.clone());
        }
        self.publish(JobEvent::Log { task_id, line });
    }

    fn finish(&self, task_id: Uuid, outcome: Result<PathBuf, String>) {
        let event = {
            let mut state = self.lock();
            let Some(task) = state.tasks.get_mut(&task_id) else {
                return;
            };
            match outcome {
                Ok(path) => {
                    if task.transition(TaskState::Completed) {
                        task.message = "Conversion completed successfully!".to_string();
                        task.download_url = Some(format!("/download/{task_id}"));
                        task.output_path = Some(path);
                    }
                }
                Err(detail) => {
                    if task.transition(TaskState::Failed) {
                        task.push_log(format!("Conversion failed: {detail}"));
                    }
                }
            }
            JobEvent::Finished {
                task_id,
                state: task.status,
                message: task.message.clone(),
            }
        };
        self.publish(event);
    }

    /// Start the single worker. It runs until the runtime shuts down.
    pub fn spawn_worker(self: &Arc<Self>, runner: Arc<dyn JobRunner>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            debug!("Conversion worker started");
            loop {
                while let Some(job) = queue.dequeue() {
                    queue.run_job(job, Arc::clone(&runner)).await;
                }
                queue.wake.notified().await;
            }
        })
    }

    async fn run_job(self: &Arc<Self>, job: ConversionJob, runner: Arc<dyn JobRunner>) {
        let task_id = job.task_id;
        let log = TaskLog {
            queue: Arc::clone(self),
            task_id,
        };
        info!("Task {} started", task_id);

        let handle = tokio::task::spawn_blocking(move || {
            let result = runner.run(&job, &log);
            // Scratch space goes first, before the status turns terminal.
            let dir = job.temp_dir.path().to_path_buf();
            if let Err(e) = job.temp_dir.close() {
                warn!("Could not remove work dir {}: {}", dir.display(), e);
            }
            result
        });

        let outcome = match handle.await {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(e)) => Err(e.to_string()),
            Err(join_err) => {
                error!("Task {} panicked: {}", task_id, join_err);
                Err(panic_detail(join_err))
            }
        };
        match &outcome {
            Ok(path) => info!("Task {} completed: {}", task_id, path.display()),
            Err(detail) => warn!("Task {} failed: {}", task_id, detail),
        }
        self.finish(task_id, outcome);
    }
}

fn panic_detail(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("job was cancelled: {err}");
    }
    let payload = err.into_panic();
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("internal error: {msg}")
}

/// Job log sink writing into the task's status record.
struct TaskLog {
    queue: Arc<JobQueue>,
    task_id: Uuid,
}

impl JobLog for TaskLog {
    fn line(&self, message: String) {
        self.queue.append_log(self.task_id, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ConversionJob {
        let tmp = tempfile::tempdir().unwrap();
        ConversionJob::new(tmp.path().join("in.json"), tmp.path().join("out"), tmp)
    }

    #[test]
    fn positions_are_contiguous_and_renumbered() {
        let queue = JobQueue::new(10);
        let ids: Vec<Uuid> = (0..5)
            .map(|i| {
                let j = job();
                let id = j.task_id;
                assert_eq!(queue.enqueue(j).unwrap(), i);
                id
            })
            .collect();

        let first = queue.dequeue().unwrap();
        assert_eq!(first.task_id, ids[0]);
        let head = queue.status(&ids[0]).unwrap();
        assert_eq!(head.status, TaskState::Processing);
        assert_eq!(head.queue_position, None);
        for (expected, id) in ids[1..].iter().enumerate() {
            assert_eq!(queue.status(id).unwrap().queue_position, Some(expected));
        }
    }

    #[test]
    fn full_queue_rejects() {
        let queue = JobQueue::new(2);
        queue.enqueue(job()).unwrap();
        queue.enqueue(job()).unwrap();
        let err = queue.enqueue(job()).unwrap_err();
        assert!(matches!(err, ScriptDeckError::QueueFull { depth: 2 }));
        assert!(err.is_retryable());
    }

    #[test]
    fn terminal_states_never_regress() {
        let j = job();
        let mut status = TaskStatus::queued(&j);
        status.queue_position = Some(3);
        assert!(status.transition(TaskState::Processing));
        assert!(status.transition(TaskState::Completed));
        assert!(!status.transition(TaskState::Processing));
        assert!(!status.transition(TaskState::Failed));
        assert_eq!(status.status, TaskState::Completed);
        assert_eq!(status.queue_position, None);
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn active_tasks_cannot_be_removed() {
        let queue = JobQueue::new(4);
        let j = job();
        let id = j.task_id;
        queue.enqueue(j).unwrap();
        assert!(matches!(
            queue.remove(&id),
            Err(ScriptDeckError::NotCompleted { .. })
        ));
        assert!(matches!(
            queue.remove(&Uuid::new_v4()),
            Err(ScriptDeckError::TaskNotFound { .. })
        ));
    }

    #[test]
    fn purge_takes_only_old_completed_tasks() {
        let queue = JobQueue::new(4);
        let (a, b) = (job(), job());
        let (ida, idb) = (a.task_id, b.task_id);
        queue.enqueue(a).unwrap();
        queue.enqueue(b).unwrap();
        queue.dequeue().unwrap();
        queue.finish(ida, Ok(PathBuf::from("/x/out.json")));

        assert!(queue.purge_completed_older_than(Duration::from_secs(3600)).is_empty());
        let purged = queue.purge_completed_older_than(Duration::ZERO);
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].task_id, ida);
        assert!(queue.status(&idb).is_some());
    }

    #[test]
    fn failure_is_appended_to_logs() {
        let queue = JobQueue::new(4);
        let j = job();
        let id = j.task_id;
        queue.enqueue(j).unwrap();
        queue.dequeue().unwrap();
        queue.finish(id, Err("boom".into()));
        let status = queue.status(&id).unwrap();
        assert_eq!(status.status, TaskState::Failed);
        assert_eq!(status.logs.last().unwrap(), "Conversion failed: boom");
        assert!(status.download_url.is_none());
    }
}
