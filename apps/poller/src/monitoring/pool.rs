//! Bounded worker pool for batch probes.
//!
//! A fixed number of worker tasks share one bounded queue. This is the only
//! place probe processes are started, so the number of concurrent probe
//! processes never exceeds the worker count. Submitting never waits: when the
//! queue is full the batch is answered immediately with ERROR outcomes.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::bus::OutcomeBus;
use super::executor::BatchProbeExecutor;
use super::types::{BatchId, OutcomeEvent, ProbeBatch, ProbeCause, ProbeOutcome};
use crate::error::SubmitError;

/// Anything that accepts batches for probing
pub trait BatchSink: Send + Sync {
    /// Hand a batch over without waiting
    fn submit(&self, batch: ProbeBatch) -> Result<(), SubmitError>;
}

/// Per-host outcomes of one finished batch
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub outcomes: HashMap<String, ProbeOutcome>,
}

struct ProbeJob {
    batch: ProbeBatch,
    report: Option<oneshot::Sender<BatchReport>>,
}

pub struct ProbePool {
    queue: Mutex<Option<mpsc::Sender<ProbeJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    bus: OutcomeBus,
}

impl ProbePool {
    /// Spawn `workers` worker tasks behind a queue of `queue_capacity` batches
    pub fn start(
        workers: usize,
        queue_capacity: usize,
        executor: Arc<BatchProbeExecutor>,
        bus: OutcomeBus,
    ) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers)
            .map(|index| tokio::spawn(worker_loop(index, rx.clone(), executor.clone(), bus.clone())))
            .collect();

        info!(workers, queue_capacity, "Probe worker pool started");

        Self { queue: Mutex::new(Some(tx)), workers: Mutex::new(handles), bus }
    }

    /// Submit a batch and receive its report once every outcome is published.
    ///
    /// A rejected batch still produces a report (all ERROR).
    pub fn submit_with_report(&self, batch: ProbeBatch) -> oneshot::Receiver<BatchReport> {
        let (tx, rx) = oneshot::channel();
        let _ = self.enqueue(ProbeJob { batch, report: Some(tx) });
        rx
    }

    /// Close the queue and wait for queued and in-flight batches to finish
    pub async fn shutdown(&self) {
        let sender = self.queue.lock().map(|mut queue| queue.take()).unwrap_or(None);
        drop(sender);

        let handles: Vec<_> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Probe worker ended abnormally: {}", e);
            }
        }
        info!("Probe worker pool stopped");
    }

    fn enqueue(&self, job: ProbeJob) -> Result<(), SubmitError> {
        if job.batch.is_empty() {
            if let Some(report) = job.report {
                let _ = report.send(BatchReport { batch_id: job.batch.id, outcomes: HashMap::new() });
            }
            return Ok(());
        }

        let sender = self.queue.lock().ok().and_then(|queue| queue.clone());
        let Some(sender) = sender else {
            reject(&self.bus, job, SubmitError::Closed);
            return Err(SubmitError::Closed);
        };

        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                reject(&self.bus, job, SubmitError::QueueFull);
                Err(SubmitError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                reject(&self.bus, job, SubmitError::Closed);
                Err(SubmitError::Closed)
            }
        }
    }
}

impl BatchSink for ProbePool {
    fn submit(&self, batch: ProbeBatch) -> Result<(), SubmitError> {
        self.enqueue(ProbeJob { batch, report: None })
    }
}

async fn worker_loop(
    index: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<ProbeJob>>>,
    executor: Arc<BatchProbeExecutor>,
    bus: OutcomeBus,
) {
    debug!(worker = index, "Probe worker started");
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else { break };
        run_job(index, job, &executor, &bus).await;
    }
    debug!(worker = index, "Probe worker stopped");
}

async fn run_job(index: usize, job: ProbeJob, executor: &Arc<BatchProbeExecutor>, bus: &OutcomeBus) {
    let ProbeJob { batch, report } = job;
    let batch_id = batch.id;
    debug!(worker = index, batch = %batch_id, hosts = batch.len(), origin = ?batch.origin, "Batch picked up");

    // Separate task so a panic inside execution cannot take the worker down
    let task_executor = executor.clone();
    let addresses = batch.addresses();
    let outcomes = match tokio::spawn(async move { task_executor.execute(&addresses, batch_id).await }).await {
        Ok(outcomes) => outcomes,
        Err(e) => {
            error!(batch = %batch_id, "Batch execution aborted: {}", e);
            HashMap::new()
        }
    };

    let outcomes = publish_batch(bus, &batch, outcomes);
    if let Some(report) = report {
        let _ = report.send(BatchReport { batch_id, outcomes });
    }
}

/// Publish exactly one event per host of the batch, synthesizing ERROR for
/// any host the outcome map lacks. Returns the complete outcome map.
fn publish_batch(
    bus: &OutcomeBus,
    batch: &ProbeBatch,
    mut outcomes: HashMap<String, ProbeOutcome>,
) -> HashMap<String, ProbeOutcome> {
    let mut complete = HashMap::with_capacity(batch.len());
    let mut events = Vec::with_capacity(batch.len());

    for (address, cadence) in &batch.hosts {
        let outcome = outcomes
            .remove(address)
            .unwrap_or_else(|| ProbeOutcome::failed(address.as_str(), ProbeCause::Error));
        events.push(OutcomeEvent::new(&outcome, batch.id, *cadence));
        complete.insert(address.clone(), outcome);
    }

    let (succeeded, failed) = bus.publish(events);
    debug!(batch = %batch.id, succeeded, failed, "Batch outcomes published");
    complete
}

fn reject(bus: &OutcomeBus, job: ProbeJob, reason: SubmitError) {
    warn!(batch = %job.batch.id, hosts = job.batch.len(), "Batch rejected: {}", reason);
    let outcomes = publish_batch(bus, &job.batch, HashMap::new());
    if let Some(report) = job.report {
        let _ = report.send(BatchReport { batch_id: job.batch.id, outcomes });
    }
}
