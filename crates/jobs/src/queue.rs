// crates/jobs/src/queue.rs
//! Deferred FIFO job queue with a lock-free running counter.
//!
//! [`JobQueue`] never starts work on its own: jobs sit in the FIFO until a
//! caller invokes [`JobQueue::start_next`] or [`JobQueue::start_up_to`].
//! Started futures are spawned on the tokio runtime captured at construction,
//! so the start methods may be called from any thread.
//!
//! The running counter is only ever moved with atomic read-modify-write.
//! `start_up_to` reserves a slot with compare-and-swap *before* dequeuing, so
//! the counter never exceeds the ceiling. The one lock (`idle_gate`) guards
//! the compound "FIFO empty and nothing running" check behind `queue_empty`.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crossbeam_channel::{Receiver, Sender};
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::{QueueConfig, DEFAULT_EVENT_CAPACITY};
use crate::error::JobError;
use crate::handle::JobHandle;
use crate::job::{Job, RunningJob};
use crate::metrics;
use crate::types::{BoxError, JobEvent, JobId, JobResult, StartJob};

/// Queue of deferred jobs with manual start control.
///
/// Cloning is cheap and yields another handle to the same queue.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

struct Shared {
    ids: Arc<AtomicU64>,
    pending_tx: Sender<Job>,
    pending_rx: Receiver<Job>,
    running: AtomicUsize,
    /// Serializes the idle check against completions and rollbacks.
    idle_gate: Mutex<()>,
    /// Set when a completion left work behind; cleared once `queue_empty` fires.
    idle_owed: AtomicBool,
    /// Once set, nothing more is dequeued for starting.
    retired: AtomicBool,
    completed_tx: broadcast::Sender<JobEvent>,
    failed_tx: broadcast::Sender<JobError>,
    empty_tx: broadcast::Sender<()>,
    canceled_tx: broadcast::Sender<JobId>,
    event_capacity: usize,
    runtime: Handle,
}

impl JobQueue {
    /// Create a queue bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime. Use
    /// [`JobQueue::with_runtime`] to bind to an explicit runtime instead.
    pub fn new() -> Self {
        Self::with_runtime(Handle::current(), DEFAULT_EVENT_CAPACITY)
    }

    /// Create a queue on the current runtime using `config.event_capacity`.
    pub fn with_config(config: &QueueConfig) -> Self {
        Self::with_runtime(Handle::current(), config.event_capacity)
    }

    /// Create a queue whose jobs are spawned on `runtime`.
    pub fn with_runtime(runtime: Handle, event_capacity: usize) -> Self {
        Self::build(runtime, event_capacity, Arc::new(AtomicU64::new(1)))
    }

    fn build(runtime: Handle, event_capacity: usize, ids: Arc<AtomicU64>) -> Self {
        let event_capacity = event_capacity.max(1);
        let (pending_tx, pending_rx) = crossbeam_channel::unbounded();
        let (completed_tx, _) = broadcast::channel(event_capacity);
        let (failed_tx, _) = broadcast::channel(event_capacity);
        let (empty_tx, _) = broadcast::channel(event_capacity);
        let (canceled_tx, _) = broadcast::channel(event_capacity);
        Self {
            shared: Arc::new(Shared {
                ids,
                pending_tx,
                pending_rx,
                running: AtomicUsize::new(0),
                idle_gate: Mutex::new(()),
                idle_owed: AtomicBool::new(false),
                retired: AtomicBool::new(false),
                completed_tx,
                failed_tx,
                empty_tx,
                canceled_tx,
                event_capacity,
                runtime,
            }),
        }
    }

    /// A new, empty queue on the same runtime that continues this queue's
    /// job id sequence.
    pub(crate) fn next_generation(&self) -> Self {
        Self::build(
            self.shared.runtime.clone(),
            self.shared.event_capacity,
            Arc::clone(&self.shared.ids),
        )
    }

    /// Stop starting jobs from this queue. Queued jobs stay put until
    /// [`JobQueue::cancel_outstanding_jobs`] drains them; running jobs finish.
    pub(crate) fn retire(&self) {
        self.shared.retired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn downgrade(&self) -> WeakJobQueue {
        WeakJobQueue(Arc::downgrade(&self.shared))
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.shared.runtime
    }

    /// Append a job to the tail of the FIFO without starting it.
    pub fn enqueue<F, Fut>(&self, start: F) -> JobHandle
    where
        F: FnOnce(CancellationToken) -> Result<Fut, BoxError> + Send + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.enqueue_boxed(Box::new(start))
    }

    /// Append an already boxed [`StartJob`].
    pub fn enqueue_boxed(&self, start: Box<dyn StartJob>) -> JobHandle {
        let id = self.shared.ids.fetch_add(1, Ordering::Relaxed);
        let (job, handle) = Job::new(id, start);
        if let Err(rejected) = self.shared.pending_tx.send(job) {
            // Unreachable while `Shared` owns the receiver.
            rejected.into_inner().cancel();
        }
        metrics::record_enqueued();
        tracing::debug!(job_id = id, pending = self.pending_count(), "Job enqueued");
        handle
    }

    /// Start the first runnable job, skipping ones canceled while queued.
    ///
    /// Returns `false` if there was nothing to start.
    pub fn start_next(&self) -> bool {
        self.shared.running.fetch_add(1, Ordering::AcqRel);
        match self.shared.dequeue_runnable() {
            Some(job) => {
                self.shared.launch(job);
                true
            }
            None => {
                self.shared.rollback_reservation();
                false
            }
        }
    }

    /// Start jobs until `max_concurrent` are running or the FIFO is empty.
    ///
    /// Returns how many jobs this call started.
    pub fn start_up_to(&self, max_concurrent: usize) -> usize {
        let shared = &self.shared;
        let mut started = 0;
        loop {
            let current = shared.running.load(Ordering::Acquire);
            if current >= max_concurrent {
                break;
            }
            if shared
                .running
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            match shared.dequeue_runnable() {
                Some(job) => {
                    shared.launch(job);
                    started += 1;
                }
                None => {
                    shared.rollback_reservation();
                    // Another caller may have enqueued and been turned away by
                    // our reservation; go round again so its job is not stranded.
                    if shared.pending_rx.is_empty() || shared.is_retired() {
                        break;
                    }
                }
            }
        }
        if started > 0 {
            tracing::debug!(started, max_concurrent, running = self.running_count(), "Started jobs");
        }
        started
    }

    /// Resolve every job that has not started yet as canceled.
    ///
    /// Running jobs are untouched. Returns how many jobs were drained.
    pub fn cancel_outstanding_jobs(&self) -> usize {
        let mut drained = 0;
        while let Ok(job) = self.shared.pending_rx.try_recv() {
            self.shared.discard(job);
            drained += 1;
        }
        if self.shared.settle_if_idle() {
            let _ = self.shared.empty_tx.send(());
        }
        if drained > 0 {
            tracing::debug!(drained, "Canceled outstanding jobs");
        }
        drained
    }

    /// Jobs currently running (including slots reserved by an in-progress start).
    pub fn running_count(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Jobs waiting in the FIFO, including canceled ones not yet skipped.
    pub fn pending_count(&self) -> usize {
        self.shared.pending_rx.len()
    }

    pub fn is_idle(&self) -> bool {
        self.running_count() == 0 && self.shared.pending_rx.is_empty()
    }

    /// Every job that ran, with its outcome.
    pub fn subscribe_completed(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.completed_tx.subscribe()
    }

    /// The error of every job that ran and failed.
    pub fn subscribe_failed(&self) -> broadcast::Receiver<JobError> {
        self.shared.failed_tx.subscribe()
    }

    /// Fires when the last running job finishes and nothing is queued.
    pub fn subscribe_empty(&self) -> broadcast::Receiver<()> {
        self.shared.empty_tx.subscribe()
    }

    /// Ids of jobs resolved as canceled without ever starting.
    pub fn subscribe_canceled(&self) -> broadcast::Receiver<JobId> {
        self.shared.canceled_tx.subscribe()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("running", &self.running_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Shared {
    fn lock_gate(&self) -> MutexGuard<'_, ()> {
        match self.idle_gate.lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!("Mutex poisoned acquiring idle gate: {e}");
                e.into_inner()
            }
        }
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Pop the head of the FIFO, resolving canceled entries on the way.
    fn dequeue_runnable(&self) -> Option<Job> {
        while !self.is_retired() {
            let Ok(job) = self.pending_rx.try_recv() else {
                break;
            };
            if job.is_cancel_requested() {
                self.discard(job);
                continue;
            }
            return Some(job);
        }
        None
    }

    fn discard(&self, job: Job) {
        let id = job.id();
        job.cancel();
        metrics::record_canceled();
        tracing::debug!(job_id = id, "Job canceled before start");
        let _ = self.canceled_tx.send(id);
    }

    /// Invoke `start` for a job whose running slot is already reserved.
    fn launch(self: &Arc<Self>, job: Job) {
        let id = job.id();
        metrics::record_started();
        match job.start() {
            Ok((running, fut)) => {
                tracing::debug!(job_id = id, "Job started");
                let shared = Arc::clone(self);
                self.runtime.spawn(async move {
                    let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(JobError::failed(e)),
                        Err(_) => {
                            tracing::warn!(job_id = id, "Job panicked");
                            Err(JobError::failed("job panicked".into()))
                        }
                    };
                    shared.finish(running, outcome);
                });
            }
            Err((running, err)) => {
                tracing::warn!(job_id = id, error = %err, "Job failed to start");
                self.finish(running, Err(err));
            }
        }
    }

    /// Release the job's slot, resolve its handle and publish the events.
    fn finish(&self, job: RunningJob, outcome: JobResult) {
        let went_idle = self.release_after_completion();
        let running = self.running.load(Ordering::Acquire);
        metrics::record_finished(&outcome);
        job.finish(&outcome);

        match &outcome {
            Ok(()) => tracing::debug!(job_id = job.id(), running, "Job succeeded"),
            Err(e) => tracing::debug!(job_id = job.id(), running, error = %e, "Job failed"),
        }

        let failure = outcome.as_ref().err().cloned();
        let _ = self.completed_tx.send(JobEvent {
            id: job.id(),
            outcome,
        });
        if let Some(err) = failure {
            let _ = self.failed_tx.send(err);
        }
        if went_idle {
            tracing::debug!("Queue drained");
            let _ = self.empty_tx.send(());
        }
    }

    /// Decrement after a completion; true if that left the queue idle.
    fn release_after_completion(&self) -> bool {
        let _gate = self.lock_gate();
        let previous = self.running.fetch_sub(1, Ordering::AcqRel);
        let idle = previous == 1 && self.pending_rx.is_empty();
        self.idle_owed.store(!idle, Ordering::Release);
        idle
    }

    /// Undo a speculative reservation that found nothing to start.
    ///
    /// A completion that raced with the reservation saw a non-zero count and
    /// did not fire `queue_empty`; in that case the rollback fires it.
    fn rollback_reservation(&self) {
        let fire = {
            let _gate = self.lock_gate();
            let previous = self.running.fetch_sub(1, Ordering::AcqRel);
            previous == 1
                && self.pending_rx.is_empty()
                && self.idle_owed.swap(false, Ordering::AcqRel)
        };
        if fire {
            tracing::debug!("Queue drained");
            let _ = self.empty_tx.send(());
        }
    }

    fn settle_if_idle(&self) -> bool {
        let _gate = self.lock_gate();
        self.running.load(Ordering::Acquire) == 0
            && self.pending_rx.is_empty()
            && self.idle_owed.swap(false, Ordering::AcqRel)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let mut drained = 0;
        while let Ok(job) = self.pending_rx.try_recv() {
            self.discard(job);
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!(drained, "Queue dropped with pending jobs");
        }
    }
}

/// Non-owning reference used by background tasks that must not keep a
/// queue alive.
#[derive(Clone)]
pub(crate) struct WeakJobQueue(Weak<Shared>);

impl WeakJobQueue {
    pub(crate) fn upgrade(&self) -> Option<JobQueue> {
        self.0.upgrade().map(|shared| JobQueue { shared })
    }
}
