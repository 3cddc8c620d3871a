//! Job events as a `Stream`.
//!
//! ## Why stream?
//!
//! Polling `status` works for HTTP clients, but in-process front ends (the
//! CLI spinner, a websocket bridge) want to react to each progress line as
//! it happens. The queue already broadcasts a [`JobEvent`] for every state
//! change and log line; this module adapts that broadcast into a `Stream`.
//!
//! A slow consumer can fall behind the broadcast buffer. Missed events are
//! skipped with a warning; the authoritative state stays available through
//! [`crate::queue::JobQueue::status`]. A per-task stream consults it after
//! a lag so a lost `Finished` event still ends the stream.

use crate::queue::{JobEvent, JobQueue};
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::Stream;
use tracing::warn;
use uuid::Uuid;

/// A boxed stream of job events.
pub type JobEventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

/// Every event published by `queue` from now on.
pub fn job_events(queue: &JobQueue) -> JobEventStream {
    from_receiver(queue.subscribe())
}

/// Adapt an existing subscription, e.g. one taken before submitting.
pub fn from_receiver(rx: broadcast::Receiver<JobEvent>) -> JobEventStream {
    let s = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                warn!("Event stream lagged, skipped {} events", n);
                None
            }
        }
    });
    Box::pin(s)
}

/// Events of one task, ending after its `Finished` event.
///
/// Pass a receiver obtained before the task was submitted, or early events
/// are missed. If the receiver lags and the task has meanwhile reached a
/// terminal state, the stream ends with a `Finished` event built from the
/// task's status. The stream also ends when the task is no longer tracked
/// or `queue` is dropped.
pub fn task_events(
    queue: &Arc<JobQueue>,
    rx: broadcast::Receiver<JobEvent>,
    task_id: Uuid,
) -> JobEventStream {
    let queue = Arc::downgrade(queue);
    let s = stream::unfold(Some(rx), move |rx| {
        let queue = queue.clone();
        async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(event) if event.task_id() == task_id => {
                        let next = (!event.is_finished()).then_some(rx);
                        return Some((event, next));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!("Event stream of task {} lagged, skipped {} events", task_id, n);
                        let status = queue.upgrade()?.status(&task_id)?;
                        if status.status.is_terminal() {
                            let event = JobEvent::Finished {
                                task_id,
                                state: status.status,
                                message: status.message,
                            };
                            return Some((event, None));
                        }
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        }
    });
    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ConversionJob;

    #[tokio::test]
    async fn task_stream_filters_by_id() {
        let queue = Arc::new(JobQueue::new(4));
        let rx = queue.subscribe();

        let tmp = tempfile::tempdir().unwrap();
        let other = ConversionJob::new(tmp.path().join("a.json"), tmp.path().join("a"), tempfile::tempdir().unwrap());
        let mine = ConversionJob::new(tmp.path().join("b.json"), tmp.path().join("b"), tempfile::tempdir().unwrap());
        let id = mine.task_id;
        queue.enqueue(other).unwrap();
        queue.enqueue(mine).unwrap();
        let events = task_events(&queue, rx, id);
        drop(queue);

        let events: Vec<JobEvent> = events.collect().await;
        assert_eq!(events, vec![JobEvent::Queued { task_id: id, position: 1 }]);
    }
}
