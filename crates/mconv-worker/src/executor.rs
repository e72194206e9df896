//! Worker pool.
//!
//! A fixed number of executor tasks pull jobs from the shared [`JobQueue`]
//! and drive each through planning and the [`ProcessRunner`]. Outcomes go to
//! a dispatcher task that hands them to the [`ResultSink`], so delivery
//! retries never hold up an executor.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use mconv_media::{probe_duration, InvocationPlanner, MediaError, ProcessRunner, RunReport};
use mconv_models::{Artifact, FailureDetail, FailureKind, Job, JobId, JobStatus, Outcome};
use mconv_queue::{Cancellation, ClaimedJob, JobQueue, QueueError};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::sink::ResultSink;

/// What [`WorkerPool::shutdown`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Pending jobs turned into cancelled outcomes
    pub drained: usize,
    /// Running jobs cancelled at the grace deadline
    pub forced: usize,
}

/// Everything an executor needs, shared by all of them.
struct WorkerContext {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    planner: Arc<dyn InvocationPlanner>,
    runner: ProcessRunner,
    outcomes: mpsc::UnboundedSender<Outcome>,
}

/// Fixed-size pool of job executors.
pub struct WorkerPool {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    sink: Arc<ResultSink>,
    outcomes: mpsc::UnboundedSender<Outcome>,
    workers: JoinSet<()>,
    dispatcher: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawn the executors and the outcome dispatcher.
    pub async fn start(
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        planner: Arc<dyn InvocationPlanner>,
        sink: Arc<ResultSink>,
    ) -> WorkerResult<Self> {
        tokio::fs::create_dir_all(&config.output_dir).await?;

        let worker_count = config.max_concurrent_jobs.max(1);
        let (outcomes, outcome_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_outcomes(outcome_rx, Arc::clone(&sink)));

        let ctx = Arc::new(WorkerContext {
            config: config.clone(),
            queue: Arc::clone(&queue),
            planner,
            runner: ProcessRunner::new(),
            outcomes: outcomes.clone(),
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(worker_loop(worker_id, Arc::clone(&ctx)));
        }

        info!(
            "Started worker pool with {} executors (timeout {:?})",
            worker_count, config.job_timeout
        );

        Ok(Self {
            config,
            queue,
            sink,
            outcomes,
            workers,
            dispatcher,
        })
    }

    /// Queue a job. Fails immediately when the queue is full or closed.
    ///
    /// An id the sink still remembers is refused as a duplicate, since its
    /// outcome could never be delivered.
    pub fn submit(&self, job: Job) -> WorkerResult<JobId> {
        let id = job.id.clone();
        let operation = job.operation.name();

        if !self.sink.reserve(&id) {
            metrics::record_job_rejected("invalid");
            return Err(WorkerError::Queue(QueueError::Duplicate(id)));
        }

        match self.queue.enqueue(job) {
            Ok(()) => {
                metrics::record_job_enqueued(operation);
                metrics::set_queue_length(self.queue.len());
                Ok(id)
            }
            Err(e) => {
                self.sink.release(&id);
                let reason = match &e {
                    QueueError::CapacityExceeded { .. } => "capacity",
                    QueueError::Closed => "closed",
                    _ => "invalid",
                };
                metrics::record_job_rejected(reason);
                Err(WorkerError::Queue(e))
            }
        }
    }

    /// Cancel a pending or running job.
    ///
    /// A pending job gets its cancelled outcome right away. A running job
    /// gets it from its executor once the engine has been torn down.
    pub fn cancel(&self, job_id: &JobId) -> Cancellation {
        let cancellation = self.queue.cancel(job_id);
        if let Cancellation::Removed(job) = &cancellation {
            let waited = elapsed_since_submit(job);
            self.emit(Outcome::cancelled(
                job.id.clone(),
                "cancelled before start",
                waited,
            ));
            metrics::set_queue_length(self.queue.len());
        }
        cancellation
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn pending_jobs(&self) -> usize {
        self.queue.len()
    }

    pub fn active_jobs(&self) -> usize {
        self.queue.active_len()
    }

    fn emit(&self, outcome: Outcome) {
        metrics::record_job_completed(outcome.status().as_str());
        if self.outcomes.send(outcome).is_err() {
            error!("Outcome dispatcher stopped, dropping outcome");
        }
    }

    /// Stop the pool.
    ///
    /// Pending jobs are cancelled, running jobs get `shutdown_timeout` to
    /// finish before they are cancelled too. Returns once every outcome has
    /// been through the sink.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!("Shutting down worker pool");
        self.queue.close();

        let drained = self.queue.drain();
        let mut report = ShutdownReport {
            drained: drained.len(),
            forced: 0,
        };
        for job in drained {
            let waited = elapsed_since_submit(&job);
            self.emit(Outcome::cancelled(job.id, "worker shutting down", waited));
        }
        metrics::set_queue_length(0);

        let grace = self.config.shutdown_timeout;
        let workers = &mut self.workers;
        let finished = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !finished {
            report.forced = self.queue.cancel_all_active();
            warn!(
                "Grace period of {:?} elapsed, cancelled {} running jobs",
                grace, report.forced
            );
            while let Some(result) = self.workers.join_next().await {
                if let Err(e) = result {
                    error!("Executor task failed: {}", e);
                }
            }
        }

        // Executors are gone; dropping the last sender lets the dispatcher finish
        let WorkerPool {
            outcomes,
            dispatcher,
            ..
        } = self;
        drop(outcomes);
        if let Err(e) = dispatcher.await {
            error!("Outcome dispatcher failed: {}", e);
        }

        info!(
            drained = report.drained,
            forced = report.forced,
            "Worker pool stopped"
        );
        report
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("pending", &self.queue.len())
            .field("active", &self.queue.active_len())
            .finish_non_exhaustive()
    }
}

/// Executor loop: runs until the queue is closed.
async fn worker_loop(worker_id: usize, ctx: Arc<WorkerContext>) {
    debug!(worker_id, "Executor started");

    while let Ok(claimed) = ctx.queue.dequeue().await {
        metrics::set_queue_length(ctx.queue.len());
        metrics::set_active_jobs(ctx.queue.active_len());

        let job_id = claimed.id().clone();
        let started = Instant::now();

        let outcome = match AssertUnwindSafe(execute_job(&ctx, claimed))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker_id, job_id = %job_id, "Executor panicked: {}", message);
                Outcome::failed(
                    job_id.clone(),
                    FailureDetail::new(FailureKind::Internal, format!("internal error: {}", message)),
                    started.elapsed(),
                )
            }
        };

        ctx.queue.finish(&job_id);
        metrics::set_active_jobs(ctx.queue.active_len());
        metrics::record_job_completed(outcome.status().as_str());

        if ctx.outcomes.send(outcome).is_err() {
            error!(job_id = %job_id, "Outcome dispatcher stopped, dropping outcome");
        }
    }

    debug!(worker_id, "Executor stopped");
}

/// Run one job to its outcome.
async fn execute_job(ctx: &WorkerContext, claimed: ClaimedJob) -> Outcome {
    let (mut job, cancel) = claimed.into_parts();
    let operation = job.operation.name();
    let logger = JobLogger::new(&job.id, operation);
    let span = logger.create_span();

    async move {
        let started = Instant::now();

        if let Err(e) = job.transition(JobStatus::Running) {
            logger.log_error(&e.to_string());
            return Outcome::failed(
                job.id.clone(),
                FailureDetail::new(FailureKind::Internal, e.to_string()),
                started.elapsed(),
            );
        }

        let invocation = match ctx.planner.plan(&job) {
            Ok(invocation) => invocation,
            Err(e) => {
                logger.log_error(&format!("rejected: {}", e));
                mark(&mut job, JobStatus::Failed, &logger);
                let outcome = Outcome::failed(
                    job.id.clone(),
                    FailureDetail::new(FailureKind::InvalidRequest, e.to_string()),
                    started.elapsed(),
                );
                logger.log_outcome(&outcome);
                return outcome;
            }
        };

        logger.log_start(&invocation.display());
        let timeout = ctx.config.job_timeout;
        let result = ctx.runner.run_cancellable(invocation, timeout, cancel).await;

        let engine_time = started.elapsed();
        metrics::record_engine_duration(operation, engine_time.as_secs_f64());
        logger.log_slow(engine_time, timeout);

        let outcome = match result {
            Ok(report) => {
                let outcome = succeeded(ctx, &job.id, report, &logger, started).await;
                mark(&mut job, JobStatus::Succeeded, &logger);
                outcome
            }
            Err(MediaError::Cancelled) => {
                mark(&mut job, JobStatus::Cancelled, &logger);
                Outcome::cancelled(job.id.clone(), "cancelled while running", started.elapsed())
            }
            Err(e) => {
                mark(&mut job, JobStatus::Failed, &logger);
                Outcome::failed(job.id.clone(), failure_detail(e), started.elapsed())
            }
        };

        logger.log_outcome(&outcome);
        outcome
    }
    .instrument(span)
    .await
}

async fn succeeded(
    ctx: &WorkerContext,
    job_id: &JobId,
    report: RunReport,
    logger: &JobLogger,
    started: Instant,
) -> Outcome {
    let Some(path) = report.output else {
        return Outcome::completed(job_id.clone(), started.elapsed());
    };

    let duration_secs = if ctx.config.probe_output {
        match probe_duration(&ctx.config.ffprobe_path, &path).await {
            Ok(duration) => duration,
            Err(e) => {
                logger.log_warning(&format!("could not probe artifact: {}", e));
                None
            }
        }
    } else {
        None
    };

    let artifact = Artifact {
        path,
        size_bytes: report.output_bytes.unwrap_or_default(),
        duration_secs,
    };
    Outcome::succeeded(job_id.clone(), artifact, started.elapsed())
}

fn mark(job: &mut Job, status: JobStatus, logger: &JobLogger) {
    if let Err(e) = job.transition(status) {
        logger.log_warning(&e.to_string());
    }
}

/// Map an engine error onto the outcome taxonomy.
fn failure_detail(error: MediaError) -> FailureDetail {
    let kind = match &error {
        MediaError::TimedOut(_) => FailureKind::TimedOut,
        MediaError::ProcessingFailed { .. } => FailureKind::ProcessingFailed,
        MediaError::ResourceLimit(_) => FailureKind::ResourceLimit,
        MediaError::EngineNotFound(_) => FailureKind::EngineNotFound,
        MediaError::Cancelled => FailureKind::Cancelled,
        e if e.is_rejection() => FailureKind::InvalidRequest,
        _ => FailureKind::Internal,
    };

    match error {
        MediaError::ProcessingFailed {
            message,
            diagnostics,
            ..
        } => FailureDetail::new(kind, message).with_diagnostics(diagnostics),
        other => FailureDetail::new(kind, other.to_string()),
    }
}

fn elapsed_since_submit(job: &Job) -> Duration {
    (chrono::Utc::now() - job.submitted_at)
        .to_std()
        .unwrap_or_default()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Hand outcomes to the sink until every sender is gone.
async fn dispatch_outcomes(mut rx: mpsc::UnboundedReceiver<Outcome>, sink: Arc<ResultSink>) {
    let mut deliveries = JoinSet::new();

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(outcome) => {
                    let sink = Arc::clone(&sink);
                    deliveries.spawn(async move { sink.deliver(outcome).await });
                }
                None => break,
            },
            Some(result) = deliveries.join_next(), if !deliveries.is_empty() => {
                if let Err(e) = result {
                    error!("Delivery task failed: {}", e);
                }
            }
        }
    }

    while let Some(result) = deliveries.join_next().await {
        if let Err(e) = result {
            error!("Delivery task failed: {}", e);
        }
    }
    debug!("Outcome dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_detail_mapping() {
        let detail = failure_detail(MediaError::processing_failed(
            "engine exited with exit status: 1",
            "moov atom not found",
            Some(1),
        ));
        assert_eq!(detail.kind, FailureKind::ProcessingFailed);
        assert_eq!(detail.diagnostics.as_deref(), Some("moov atom not found"));

        let detail = failure_detail(MediaError::TimedOut(Duration::from_secs(1)));
        assert_eq!(detail.kind, FailureKind::TimedOut);

        let detail = failure_detail(MediaError::UnsupportedFormat("exe".into()));
        assert_eq!(detail.kind, FailureKind::InvalidRequest);

        let detail = failure_detail(MediaError::Io(std::io::Error::other("broken pipe")));
        assert_eq!(detail.kind, FailureKind::Internal);
    }

    #[test]
    fn test_panic_message() {
        let panic: Box<dyn Any + Send> = Box::new("planner exploded");
        assert_eq!(panic_message(panic.as_ref()), "planner exploded");

        let panic: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(panic.as_ref()), "owned");
    }
}
