//! In-process FIFO job queue.
//!
//! The queue is the only state shared between the submission path and the
//! workers. It owns pending jobs and remembers which jobs are claimed, so a
//! cancellation can reach a job wherever it currently is.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use mconv_models::{Job, JobId, JobStatus};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};

const DEFAULT_CAPACITY: usize = 64;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of pending jobs
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl QueueConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("QUEUE_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CAPACITY),
        )
    }
}

/// A job handed to a worker, together with its cancellation signal.
///
/// The queue keeps the claim until [`JobQueue::finish`] is called.
#[derive(Debug)]
pub struct ClaimedJob {
    pub job: Job,
    cancel: watch::Receiver<bool>,
}

impl ClaimedJob {
    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    /// Receiver that flips to `true` when the job is cancelled.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn into_parts(self) -> (Job, watch::Receiver<bool>) {
        (self.job, self.cancel)
    }
}

/// Result of [`JobQueue::cancel`].
#[derive(Debug)]
pub enum Cancellation {
    /// The job was still pending; it has been removed and marked cancelled.
    Removed(Job),
    /// The job is claimed by a worker, which has been told to stop.
    Signalled,
    NotFound,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Job>,
    active: HashMap<JobId, watch::Sender<bool>>,
    closed: bool,
}

/// Bounded FIFO job queue.
#[derive(Debug)]
pub struct JobQueue {
    state: Mutex<State>,
    available: Notify,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Notify::new(),
            config: QueueConfig::new(config.capacity),
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> Self {
        Self::new(QueueConfig::from_env())
    }

    // No operation leaves the state half-updated, so a poisoned lock is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a job to the back of the queue.
    ///
    /// Fails immediately with [`QueueError::CapacityExceeded`] when full.
    pub fn enqueue(&self, job: Job) -> QueueResult<()> {
        {
            let mut state = self.lock();

            if state.closed {
                return Err(QueueError::Closed);
            }
            if job.status() != JobStatus::Pending {
                return Err(QueueError::NotPending {
                    id: job.id.clone(),
                    status: job.status(),
                });
            }
            if state.active.contains_key(&job.id) || state.pending.iter().any(|j| j.id == job.id)
            {
                return Err(QueueError::Duplicate(job.id));
            }
            if state.pending.len() >= self.config.capacity {
                warn!(
                    job_id = %job.id,
                    "Queue full ({} jobs), rejecting", self.config.capacity
                );
                return Err(QueueError::CapacityExceeded {
                    capacity: self.config.capacity,
                });
            }

            debug!(job_id = %job.id, "Enqueued {} job", job.operation.name());
            state.pending.push_back(job);
        }

        self.available.notify_one();
        Ok(())
    }

    /// Wait for the next job.
    ///
    /// Returns [`QueueError::Closed`] once the queue has been closed; jobs
    /// still pending at that point are left for [`JobQueue::drain`].
    pub async fn dequeue(&self) -> QueueResult<ClaimedJob> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a notify between check and await is not lost
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if let Some(job) = state.pending.pop_front() {
                    let (tx, rx) = watch::channel(false);
                    state.active.insert(job.id.clone(), tx);
                    let more = !state.pending.is_empty();
                    drop(state);

                    if more {
                        self.available.notify_one();
                    }
                    return Ok(ClaimedJob { job, cancel: rx });
                }
            }

            notified.await;
        }
    }

    /// Release the claim on a job once its outcome has been produced.
    pub fn finish(&self, id: &JobId) -> bool {
        self.lock().active.remove(id).is_some()
    }

    /// Cancel a pending or claimed job.
    pub fn cancel(&self, id: &JobId) -> Cancellation {
        let mut state = self.lock();

        if let Some(pos) = state.pending.iter().position(|j| &j.id == id) {
            if let Some(mut job) = state.pending.remove(pos) {
                if let Err(e) = job.transition(JobStatus::Cancelled) {
                    warn!(job_id = %id, "Unexpected state for pending job: {}", e);
                }
                info!(job_id = %id, "Removed pending job");
                return Cancellation::Removed(job);
            }
        }

        if let Some(signal) = state.active.get(id) {
            signal.send_replace(true);
            info!(job_id = %id, "Signalled running job to stop");
            return Cancellation::Signalled;
        }

        Cancellation::NotFound
    }

    /// Signal every claimed job to stop. Returns how many were signalled.
    pub fn cancel_all_active(&self) -> usize {
        let state = self.lock();
        for signal in state.active.values() {
            signal.send_replace(true);
        }
        state.active.len()
    }

    /// Stop accepting jobs and release every blocked dequeue.
    pub fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            info!(pending = state.pending.len(), "Job queue closed");
        }
        drop(state);
        self.available.notify_waiters();
    }

    /// Remove every pending job, marked cancelled. Meant to follow [`JobQueue::close`].
    pub fn drain(&self) -> Vec<Job> {
        let drained: Vec<Job> = self.lock().pending.drain(..).collect();
        drained
            .into_iter()
            .map(|mut job| {
                if let Err(e) = job.transition(JobStatus::Cancelled) {
                    warn!(job_id = %job.id, "Unexpected state for drained job: {}", e);
                }
                job
            })
            .collect()
    }

    /// Number of pending jobs.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of claimed jobs.
    pub fn active_len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mconv_models::{MediaSource, Operation, TargetFormat};
    use tokio_test::{assert_pending, assert_ready, task};

    fn job(n: u8) -> Job {
        Job::new(
            MediaSource::bytes(vec![n]),
            Operation::Transcode {
                format: TargetFormat::container("mp4"),
            },
        )
    }

    fn queue(capacity: usize) -> JobQueue {
        JobQueue::new(QueueConfig::new(capacity))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = queue(8);
        let jobs: Vec<Job> = (0..5).map(job).collect();
        for j in &jobs {
            queue.enqueue(j.clone()).unwrap();
        }

        for expected in &jobs {
            let claimed = queue.dequeue().await.unwrap();
            assert_eq!(claimed.id(), &expected.id);
        }
        assert!(queue.is_empty());
        assert_eq!(queue.active_len(), 5);
    }

    #[test]
    fn test_capacity_exceeded() {
        let queue = queue(2);
        queue.enqueue(job(1)).unwrap();
        queue.enqueue(job(2)).unwrap();

        let err = queue.enqueue(job(3)).unwrap_err();
        assert_eq!(err, QueueError::CapacityExceeded { capacity: 2 });
        assert!(err.is_backpressure());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(queue(0).capacity(), 1);
    }

    #[test]
    fn test_rejects_duplicates_and_non_pending() {
        let queue = queue(4);
        let first = job(1);
        queue.enqueue(first.clone()).unwrap();
        assert_eq!(
            queue.enqueue(first.clone()),
            Err(QueueError::Duplicate(first.id.clone()))
        );

        let mut running = job(2);
        running.transition(JobStatus::Running).unwrap();
        assert!(matches!(
            queue.enqueue(running),
            Err(QueueError::NotPending { status: JobStatus::Running, .. })
        ));
    }

    #[test]
    fn test_dequeue_waits_for_enqueue() {
        let queue = queue(4);
        let mut dequeue = task::spawn(queue.dequeue());
        assert_pending!(dequeue.poll());

        let submitted = job(1);
        queue.enqueue(submitted.clone()).unwrap();
        assert!(dequeue.is_woken());

        let claimed = assert_ready!(dequeue.poll()).unwrap();
        assert_eq!(claimed.job.id, submitted.id);
    }

    #[test]
    fn test_close_releases_waiters() {
        let queue = queue(4);
        let mut first = task::spawn(queue.dequeue());
        let mut second = task::spawn(queue.dequeue());
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        queue.close();

        assert!(matches!(assert_ready!(first.poll()), Err(QueueError::Closed)));
        assert!(matches!(assert_ready!(second.poll()), Err(QueueError::Closed)));
        assert_eq!(queue.enqueue(job(1)), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_cancel_pending_and_active() {
        let queue = queue(4);
        let running = job(1);
        let waiting = job(2);
        queue.enqueue(running.clone()).unwrap();
        queue.enqueue(waiting.clone()).unwrap();

        let claimed = queue.dequeue().await.unwrap();
        assert!(!claimed.is_cancelled());

        match queue.cancel(&waiting.id) {
            Cancellation::Removed(job) => assert_eq!(job.status(), JobStatus::Cancelled),
            other => panic!("expected removal, got {other:?}"),
        }
        assert!(queue.is_empty());

        assert!(matches!(queue.cancel(&running.id), Cancellation::Signalled));
        assert!(claimed.is_cancelled());

        assert!(queue.finish(&running.id));
        assert!(matches!(queue.cancel(&running.id), Cancellation::NotFound));
    }

    #[tokio::test]
    async fn test_drain_after_close() {
        let queue = queue(4);
        queue.enqueue(job(1)).unwrap();
        queue.enqueue(job(2)).unwrap();
        queue.enqueue(job(3)).unwrap();
        let claimed = queue.dequeue().await.unwrap();

        queue.close();
        assert!(matches!(queue.dequeue().await, Err(QueueError::Closed)));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|j| j.status() == JobStatus::Cancelled));

        assert_eq!(queue.cancel_all_active(), 1);
        assert!(claimed.is_cancelled());
    }
}
