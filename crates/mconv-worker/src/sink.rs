//! Outcome delivery to the bot layer.
//!
//! Delivery is idempotent per job id: the first `deliver` for a job claims it
//! in the ledger, and every later call for the same id is reported as a
//! duplicate without touching the handler. The pool reserves an id at submit
//! time so a reused id is refused up front instead of losing its outcome.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use mconv_models::{JobId, Outcome};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::retry::{retry_async, RetryConfig, RetryResult};

/// Why the bot layer did not accept an outcome.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("Bot layer unavailable: {0}")]
    Unavailable(String),

    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

/// Hook through which the bot layer receives outcomes.
#[async_trait]
pub trait OutcomeHandler: Send + Sync {
    async fn handle(&self, outcome: &Outcome) -> Result<(), DeliveryError>;
}

/// Result of [`ResultSink::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReceipt {
    Delivered { attempts: u32 },
    /// The job id was already delivered, abandoned, or is being delivered.
    Duplicate,
    /// Every attempt failed; the outcome was discarded.
    DeliveryAbandoned { attempts: u32, error: String },
}

/// Ledger state of a job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Accepted for processing, no outcome yet
    Reserved,
    InFlight,
    Delivered,
    Abandoned,
}

/// Retry and deduplication settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// How many finished job ids are remembered for deduplication
    pub dedup_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(10),
            dedup_capacity: 10_000,
        }
    }
}

impl DeliveryConfig {
    fn retry_config(&self) -> RetryConfig {
        RetryConfig::new("deliver_outcome")
            .with_max_attempts(self.max_attempts.max(1))
            .with_base_delay(self.base_delay)
            .with_max_delay(self.max_delay)
    }
}

#[derive(Debug)]
struct Ledger {
    entries: HashMap<JobId, DeliveryStatus>,
    /// Finished ids, oldest first; in-flight ids are never evicted
    finished: VecDeque<JobId>,
    capacity: usize,
}

impl Ledger {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            finished: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Hold `id` until its outcome arrives. False if it is already known.
    fn reserve(&mut self, id: &JobId) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries.insert(id.clone(), DeliveryStatus::Reserved);
        true
    }

    fn release(&mut self, id: &JobId) {
        if self.entries.get(id) == Some(&DeliveryStatus::Reserved) {
            self.entries.remove(id);
        }
    }

    /// Claim `id` for delivery. False unless it is unknown or only reserved.
    fn claim(&mut self, id: &JobId) -> bool {
        match self.entries.get(id) {
            None | Some(DeliveryStatus::Reserved) => {
                self.entries.insert(id.clone(), DeliveryStatus::InFlight);
                true
            }
            Some(_) => false,
        }
    }

    fn settle(&mut self, id: &JobId, status: DeliveryStatus) {
        self.entries.insert(id.clone(), status);
        self.finished.push_back(id.clone());

        while self.finished.len() > self.capacity {
            if let Some(oldest) = self.finished.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Idempotent, retrying outcome delivery.
pub struct ResultSink {
    handler: Arc<dyn OutcomeHandler>,
    retry: RetryConfig,
    ledger: Mutex<Ledger>,
}

impl ResultSink {
    pub fn new(handler: Arc<dyn OutcomeHandler>, config: DeliveryConfig) -> Self {
        Self {
            handler,
            retry: config.retry_config(),
            ledger: Mutex::new(Ledger::new(config.dedup_capacity)),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand an outcome to the bot layer.
    ///
    /// Never fails: exhaustion is reported as
    /// [`DeliveryReceipt::DeliveryAbandoned`] and logged.
    pub async fn deliver(&self, outcome: Outcome) -> DeliveryReceipt {
        let job_id = outcome.job_id().clone();

        if !self.ledger().claim(&job_id) {
            debug!(job_id = %job_id, "Outcome already delivered, skipping");
            return DeliveryReceipt::Duplicate;
        }

        let handler = &self.handler;
        let result = retry_async(&self.retry, || handler.handle(&outcome)).await;

        match result {
            RetryResult::Success { attempts, .. } => {
                self.ledger().settle(&job_id, DeliveryStatus::Delivered);
                metrics::record_delivery(attempts);
                info!(
                    job_id = %job_id,
                    status = %outcome.status(),
                    attempts,
                    "Outcome delivered"
                );
                DeliveryReceipt::Delivered { attempts }
            }
            RetryResult::Failed { error, attempts } => {
                self.ledger().settle(&job_id, DeliveryStatus::Abandoned);
                metrics::record_delivery_abandoned();
                error!(
                    job_id = %job_id,
                    status = %outcome.status(),
                    attempts,
                    "Delivery abandoned: {}", error
                );
                DeliveryReceipt::DeliveryAbandoned {
                    attempts,
                    error: error.to_string(),
                }
            }
        }
    }

    /// Reserve `job_id` for a job about to be queued.
    ///
    /// Returns false when the id is already reserved or still remembered
    /// from an earlier delivery; an outcome under that id would be dropped.
    pub fn reserve(&self, job_id: &JobId) -> bool {
        self.ledger().reserve(job_id)
    }

    /// Undo [`reserve`](Self::reserve) for a job that never got queued.
    pub fn release(&self, job_id: &JobId) {
        self.ledger().release(job_id);
    }

    /// Delivery state of a job id, if it is still remembered.
    pub fn status(&self, job_id: &JobId) -> Option<DeliveryStatus> {
        self.ledger().entries.get(job_id).copied()
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts()
    }
}

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Forwards outcomes into an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<Outcome>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::Sender<Outcome>) -> Self {
        Self { tx }
    }

    /// Handler plus the receiving end, with room for `buffer` outcomes.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Outcome>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl OutcomeHandler for ChannelHandler {
    async fn handle(&self, outcome: &Outcome) -> Result<(), DeliveryError> {
        self.tx
            .send(outcome.clone())
            .await
            .map_err(|_| DeliveryError::Unavailable("outcome receiver dropped".to_string()))
    }
}

/// Logs each outcome. Used when no bot layer is attached.
#[derive(Debug, Clone, Default)]
pub struct LogHandler;

#[async_trait]
impl OutcomeHandler for LogHandler {
    async fn handle(&self, outcome: &Outcome) -> Result<(), DeliveryError> {
        match (outcome.artifact(), outcome.error()) {
            (Some(artifact), _) => info!(
                job_id = %outcome.job_id(),
                path = %artifact.path.display(),
                size_bytes = artifact.size_bytes,
                duration_secs = ?artifact.duration_secs,
                "Result ready"
            ),
            (None, Some(detail)) => warn!(
                job_id = %outcome.job_id(),
                status = %outcome.status(),
                kind = detail.kind.as_str(),
                "Result: {}", detail.message
            ),
            (None, None) => info!(
                job_id = %outcome.job_id(),
                status = %outcome.status(),
                "Result ready"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mconv_models::{FailureDetail, FailureKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OutcomeHandler for FlakyHandler {
        async fn handle(&self, _outcome: &Outcome) -> Result<(), DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(DeliveryError::Unavailable("bot offline".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn outcome(id: &str) -> Outcome {
        Outcome::failed(
            JobId::from_string(id),
            FailureDetail::new(FailureKind::ProcessingFailed, "exit status 1"),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_redelivery_is_a_noop() {
        let handler = FlakyHandler::new(0);
        let sink = ResultSink::new(handler.clone(), DeliveryConfig::default());

        assert_eq!(
            sink.deliver(outcome("a")).await,
            DeliveryReceipt::Delivered { attempts: 1 }
        );
        assert_eq!(sink.deliver(outcome("a")).await, DeliveryReceipt::Duplicate);
        assert_eq!(handler.calls(), 1);
        assert_eq!(
            sink.status(&JobId::from_string("a")),
            Some(DeliveryStatus::Delivered)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_delivers() {
        let handler = FlakyHandler::new(2);
        let sink = ResultSink::new(handler.clone(), DeliveryConfig::default());

        let receipt = sink.deliver(outcome("b")).await;
        assert_eq!(receipt, DeliveryReceipt::Delivered { attempts: 3 });
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_abandons_delivery() {
        let handler = FlakyHandler::new(u32::MAX);
        let sink = ResultSink::new(handler.clone(), DeliveryConfig::default());
        let started = tokio::time::Instant::now();

        let receipt = sink.deliver(outcome("c")).await;
        assert!(matches!(
            receipt,
            DeliveryReceipt::DeliveryAbandoned { attempts: 3, .. }
        ));
        assert_eq!(handler.calls(), sink.max_attempts());
        // 4s then 8s of backoff
        assert_eq!(started.elapsed(), Duration::from_secs(12));

        // Abandoned outcomes are never retried
        assert_eq!(sink.deliver(outcome("c")).await, DeliveryReceipt::Duplicate);
        assert_eq!(handler.calls(), 3);
        assert_eq!(
            sink.status(&JobId::from_string("c")),
            Some(DeliveryStatus::Abandoned)
        );
    }

    #[tokio::test]
    async fn test_ledger_is_bounded() {
        let config = DeliveryConfig {
            dedup_capacity: 2,
            ..Default::default()
        };
        let sink = ResultSink::new(FlakyHandler::new(0), config);

        for id in ["1", "2", "3"] {
            sink.deliver(outcome(id)).await;
        }

        assert_eq!(sink.status(&JobId::from_string("1")), None);
        assert_eq!(
            sink.status(&JobId::from_string("3")),
            Some(DeliveryStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn test_reserved_id_is_delivered_once() {
        let handler = FlakyHandler::new(0);
        let sink = ResultSink::new(handler.clone(), DeliveryConfig::default());
        let id = JobId::from_string("r");

        assert!(sink.reserve(&id));
        assert!(!sink.reserve(&id));
        assert_eq!(sink.status(&id), Some(DeliveryStatus::Reserved));

        assert_eq!(
            sink.deliver(outcome("r")).await,
            DeliveryReceipt::Delivered { attempts: 1 }
        );
        assert_eq!(sink.deliver(outcome("r")).await, DeliveryReceipt::Duplicate);
        assert!(!sink.reserve(&id));
        assert_eq!(handler.calls(), 1);
    }

    #[test]
    fn test_release_only_drops_reservations() {
        let sink = ResultSink::new(FlakyHandler::new(0), DeliveryConfig::default());
        let id = JobId::from_string("s");

        assert!(sink.reserve(&id));
        sink.release(&id);
        assert_eq!(sink.status(&id), None);
        assert!(sink.reserve(&id));
    }

    #[tokio::test]
    async fn test_release_keeps_delivered_ids() {
        let sink = ResultSink::new(FlakyHandler::new(0), DeliveryConfig::default());
        sink.deliver(outcome("t")).await;

        let id = JobId::from_string("t");
        sink.release(&id);
        assert_eq!(sink.status(&id), Some(DeliveryStatus::Delivered));
    }

    #[tokio::test]
    async fn test_channel_handler() {
        let (handler, mut rx) = ChannelHandler::channel(4);
        let sink = ResultSink::new(Arc::new(handler), DeliveryConfig::default());

        sink.deliver(outcome("d")).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.job_id().as_str(), "d");

        drop(rx);
        let config = DeliveryConfig {
            max_attempts: 1,
            ..Default::default()
        };
        let (handler, rx) = ChannelHandler::channel(1);
        drop(rx);
        let sink = ResultSink::new(Arc::new(handler), config);
        assert!(matches!(
            sink.deliver(outcome("e")).await,
            DeliveryReceipt::DeliveryAbandoned { attempts: 1, .. }
        ));
    }
}
