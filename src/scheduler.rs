use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::address::{AddressId, AddressRecord, AddressStatus};
use crate::pipeline::{AddressPipeline, Disposition, FailureKind, SkipReason, StepReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperation {
    Normalize,
    Geocode,
    /// Normalize when still pending, then geocode.
    Full,
}

impl BatchOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOperation::Normalize => "normalize",
            BatchOperation::Geocode => "geocode",
            BatchOperation::Full => "full",
        }
    }

    pub fn eligible_statuses(&self) -> &'static [AddressStatus] {
        match self {
            BatchOperation::Normalize => &[AddressStatus::Pending],
            BatchOperation::Geocode => &[AddressStatus::Normalized],
            BatchOperation::Full => &[AddressStatus::Pending, AddressStatus::Normalized],
        }
    }

    pub fn admits(&self, status: AddressStatus) -> bool {
        self.eligible_statuses().contains(&status)
    }

    fn geocodes(&self) -> bool {
        !matches!(self, BatchOperation::Normalize)
    }
}

impl fmt::Display for BatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation. Work already admitted runs to completion;
/// nothing new is admitted once the signal fires.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<CancelState>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub operation: BatchOperation,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub type ProgressObserver = Arc<dyn Fn(BatchProgress) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct FailedAddress {
    pub id: AddressId,
    pub error: FailureKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedAddress {
    pub id: AddressId,
    pub status: AddressStatus,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub operation: BatchOperation,
    pub succeeded: Vec<AddressId>,
    pub failed: Vec<FailedAddress>,
    pub skipped: Vec<SkippedAddress>,
    pub cancelled: bool,
    pub cache_hits: usize,
    pub provider_calls: usize,
}

impl BatchReport {
    fn new(operation: BatchOperation) -> Self {
        Self {
            operation,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            cancelled: false,
            cache_hits: 0,
            provider_calls: 0,
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    fn absorb(&mut self, step: StepReport) {
        self.cache_hits += step.cache_hits;
        self.provider_calls += step.provider_calls;
        let id = step.record.id;
        match step.disposition {
            Disposition::Succeeded => self.succeeded.push(id),
            Disposition::Skipped(reason) => self.skipped.push(SkippedAddress {
                id,
                status: step.record.status,
                reason,
            }),
            Disposition::Failed(error) => self.failed.push(FailedAddress { id, error }),
        }
    }

    fn progress(&self, total: usize) -> BatchProgress {
        BatchProgress {
            operation: self.operation,
            total,
            processed: self.processed(),
            succeeded: self.succeeded.len(),
            failed: self.failed.len(),
            skipped: self.skipped.len(),
        }
    }
}

/// Fans a batch out over a fixed number of workers. Each address is a
/// separate task; results come back over a channel.
pub struct BatchScheduler {
    pipeline: Arc<AddressPipeline>,
    workers: usize,
}

impl BatchScheduler {
    pub fn new(pipeline: Arc<AddressPipeline>, workers: usize) -> Self {
        Self {
            pipeline,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn run(
        &self,
        records: Vec<AddressRecord>,
        operation: BatchOperation,
        observer: Option<ProgressObserver>,
        cancel: Option<CancellationSignal>,
    ) -> BatchReport {
        let total = records.len();
        let cancel = cancel.unwrap_or_default();
        info!(%operation, total, workers = self.workers, "batch started");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let (tx, mut rx) = mpsc::channel::<StepReport>(self.workers);
        let mut tx = Some(tx);
        let mut queue = records.into_iter();
        let mut report = BatchReport::new(operation);

        loop {
            // Nothing left to admit; stop waiting on workers or backoff.
            if tx.is_some() && queue.as_slice().is_empty() {
                tx = None;
            }
            tokio::select! {
                biased;
                step = rx.recv() => {
                    // `None` once admission has stopped and every worker is done.
                    let Some(step) = step else { break };
                    report.absorb(step);
                    if let Some(callback) = &observer {
                        callback(report.progress(total));
                    }
                }
                admitted = self.admit(&semaphore, &cancel, operation), if tx.is_some() => {
                    let Some(permit) = admitted else {
                        report.cancelled = true;
                        tx = None;
                        continue;
                    };
                    let (Some(record), Some(sender)) = (queue.next(), tx.clone()) else {
                        tx = None;
                        continue;
                    };
                    let pipeline = self.pipeline.clone();
                    tokio::spawn(async move {
                        let snapshot = record.clone();
                        let worker =
                            tokio::spawn(async move { pipeline.run(record, operation).await });
                        let step = match worker.await {
                            Ok(step) => step,
                            Err(err) => {
                                let message = panic_message(err);
                                warn!(id = %snapshot.id, %message, "address worker panicked");
                                StepReport::failed(snapshot, FailureKind::Panicked { message })
                            }
                        };
                        let _ = sender.send(step).await;
                        drop(permit);
                    });
                }
            }
        }

        for record in queue {
            report.skipped.push(SkippedAddress {
                id: record.id,
                status: record.status,
                reason: SkipReason::Cancelled,
            });
        }

        info!(
            %operation,
            total,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            cache_hits = report.cache_hits,
            provider_calls = report.provider_calls,
            "batch finished"
        );
        report
    }

    /// Waits for a free worker. Geocoding work is also held back while every
    /// provider is backing off. Returns `None` on cancellation.
    async fn admit(
        &self,
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationSignal,
        operation: BatchOperation,
    ) -> Option<OwnedSemaphorePermit> {
        if cancel.is_cancelled() {
            return None;
        }
        let permit = tokio::select! {
            _ = cancel.cancelled() => return None,
            permit = semaphore.clone().acquire_owned() => permit.ok()?,
        };
        // Checked after the permit so a worker freed by a rate-limited call
        // sees the backoff it caused.
        if operation.geocodes() {
            while let Some(wait) = self.pipeline.router().admission_delay() {
                debug!(wait_ms = wait.as_millis() as u64, "all providers backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = sleep(wait) => {}
                }
            }
        }
        Some(permit)
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|text| text.to_string()))
            .unwrap_or_else(|| "worker panicked".to_string()),
        Err(err) => err.to_string(),
    }
}
