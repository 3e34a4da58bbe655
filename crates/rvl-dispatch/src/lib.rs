//! rvl-dispatch
//!
//! Hands transaction ids to the distribution engine **outside** the request
//! path that produced them: ingestion acknowledges the event source as soon
//! as the canonical record is persisted and enqueued, and never waits for
//! distribution.
//!
//! Delivery is at-least-once from the worker's point of view: a unit is
//! attempted up to `max_attempts` times with doubling backoff, then handed
//! to the [`AbandonSink`] for manual reconciliation instead of retrying
//! forever. Distribution itself is idempotent, so redundant attempts are
//! harmless.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Attempts per unit of work before abandonment.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per subsequent attempt.
    pub retry_delay: Duration,
    /// Bound on queued-but-unprocessed transaction ids.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            queue_capacity: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Processes one transaction id end to end (load, plan, apply).
///
/// Implementations must be idempotent: the worker may invoke `process` for
/// the same id more than once. Non-retryable conditions (e.g. an unknown
/// transaction id) must be swallowed and logged by the implementation, not
/// surfaced as errors.
#[async_trait]
pub trait DistributionHandler: Send + Sync + 'static {
    async fn process(&self, tx_id: Uuid) -> anyhow::Result<()>;
}

/// Receives units of work whose retry budget is exhausted.
#[async_trait]
pub trait AbandonSink: Send + Sync + 'static {
    async fn abandoned(&self, tx_id: Uuid, attempts: u32, last_error: &str);
}

#[async_trait]
impl<T: DistributionHandler + ?Sized> DistributionHandler for Arc<T> {
    async fn process(&self, tx_id: Uuid) -> anyhow::Result<()> {
        DistributionHandler::process(&**self, tx_id).await
    }
}

#[async_trait]
impl<T: AbandonSink + ?Sized> AbandonSink for Arc<T> {
    async fn abandoned(&self, tx_id: Uuid, attempts: u32, last_error: &str) {
        AbandonSink::abandoned(&**self, tx_id, attempts, last_error).await
    }
}

/// Marker a handler wraps its error in to declare the failure permanent:
/// retrying cannot succeed (data invariant violation, constraint rejection),
/// so the worker abandons the unit immediately instead of burning the
/// remaining retry budget.
#[derive(Debug)]
pub struct PermanentFailure(pub anyhow::Error);

impl fmt::Display for PermanentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "permanent failure: {}", self.0)
    }
}

impl std::error::Error for PermanentFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Enqueue side
// ---------------------------------------------------------------------------

/// Why an enqueue did not happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    /// The worker has shut down; nothing will drain the queue.
    Closed,
    /// `try_enqueue` only: the queue is at capacity right now.
    QueueFull,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Closed => write!(f, "dispatch queue is closed"),
            EnqueueError::QueueFull => write!(f, "dispatch queue is full"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Cloneable handle used by the ingestion path to hand off transaction ids.
#[derive(Clone)]
pub struct TxQueue {
    tx: mpsc::Sender<Uuid>,
}

impl TxQueue {
    /// Enqueue a transaction id, waiting for capacity if necessary.
    pub async fn enqueue(&self, tx_id: Uuid) -> Result<(), EnqueueError> {
        self.tx.send(tx_id).await.map_err(|_| EnqueueError::Closed)
    }

    /// Enqueue without waiting; fails fast under backpressure.
    pub fn try_enqueue(&self, tx_id: Uuid) -> Result<(), EnqueueError> {
        self.tx.try_send(tx_id).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Spawn the dispatch worker.
///
/// Returns the enqueue handle and the worker's join handle. The worker runs
/// until every `TxQueue` clone is dropped, then drains what is already
/// queued and exits — awaiting the join handle is a full drain barrier.
pub fn spawn<H, S>(handler: H, sink: S, config: DispatchConfig) -> (TxQueue, JoinHandle<()>)
where
    H: DistributionHandler,
    S: AbandonSink,
{
    let (tx, mut rx) = mpsc::channel::<Uuid>(config.queue_capacity);
    let worker = tokio::spawn(async move {
        info!(
            max_attempts = config.max_attempts,
            "distribution dispatcher started"
        );
        while let Some(tx_id) = rx.recv().await {
            run_unit(&handler, &sink, &config, tx_id).await;
        }
        info!("distribution dispatcher drained and stopped");
    });
    (TxQueue { tx }, worker)
}

/// Attempt one unit of work up to the configured retry budget.
async fn run_unit<H, S>(handler: &H, sink: &S, config: &DispatchConfig, tx_id: Uuid)
where
    H: DistributionHandler,
    S: AbandonSink,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.retry_delay;
    let mut last_error = String::new();
    let mut attempts = 0;

    for attempt in 1..=max_attempts {
        attempts = attempt;
        match handler.process(tx_id).await {
            Ok(()) => return,
            Err(err) => {
                let permanent = err.is::<PermanentFailure>();
                last_error = format!("{err:#}");
                warn!(%tx_id, attempt, permanent, error = %last_error, "distribution attempt failed");
                // A permanent failure cannot succeed on retry; skip straight
                // to abandonment.
                if permanent {
                    break;
                }
                if attempt < max_attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    error!(
        %tx_id,
        attempts,
        error = %last_error,
        "distribution abandoned; needs manual reconciliation"
    );
    sink.abandoned(tx_id, attempts, &last_error).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
