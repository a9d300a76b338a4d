// crates/jobs/src/parallel.rs
//! Concurrency-throttled wrapper around [`JobQueue`].
//!
//! [`ParallelJobQueue`] tops the inner queue up to its ceiling whenever a job
//! is added and whenever a job completes. Completions are observed by a
//! background pump task per inner queue, which also forwards that queue's
//! events onto the wrapper's own streams so subscribers survive [`stop`].
//!
//! A job's `start` never runs under the wrapper's generation lock, so it may
//! call [`add`] or [`stop`] on the queue that is starting it.
//!
//! [`add`]: ParallelJobQueue::add
//! [`stop`]: ParallelJobQueue::stop

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::error::{JobError, QueueError};
use crate::handle::JobHandle;
use crate::queue::{JobQueue, WeakJobQueue};
use crate::types::{BoxError, JobEvent, JobId, StartJob};

/// Runs at most `max_concurrent` jobs at once, starting queued jobs in FIFO
/// order as slots free up.
pub struct ParallelJobQueue {
    max_concurrent: usize,
    current: RwLock<Generation>,
    hub: Arc<EventHub>,
}

/// The inner queue currently fed by `add`.
struct Generation {
    id: u64,
    queue: JobQueue,
}

/// Wrapper-level streams, fed by every generation's pump.
struct EventHub {
    current_generation: AtomicU64,
    completed_tx: broadcast::Sender<JobEvent>,
    failed_tx: broadcast::Sender<JobError>,
    empty_tx: broadcast::Sender<()>,
    canceled_tx: broadcast::Sender<JobId>,
}

impl ParallelJobQueue {
    /// Create a wrapper on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(max_concurrent: usize) -> Result<Self, QueueError> {
        Self::with_config(&QueueConfig {
            max_concurrent,
            ..QueueConfig::default()
        })
    }

    /// Create a wrapper on the current tokio runtime from a config.
    pub fn with_config(config: &QueueConfig) -> Result<Self, QueueError> {
        Self::with_runtime(Handle::current(), config)
    }

    /// Create a wrapper whose jobs and pump run on `runtime`.
    pub fn with_runtime(runtime: Handle, config: &QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let capacity = config.event_capacity;
        let hub = Arc::new(EventHub {
            current_generation: AtomicU64::new(0),
            completed_tx: broadcast::channel(capacity).0,
            failed_tx: broadcast::channel(capacity).0,
            empty_tx: broadcast::channel(capacity).0,
            canceled_tx: broadcast::channel(capacity).0,
        });
        let queue = JobQueue::with_runtime(runtime, capacity);
        spawn_pump(&queue, 0, config.max_concurrent, Arc::clone(&hub));

        tracing::debug!(max_concurrent = config.max_concurrent, "Parallel job queue created");
        Ok(Self {
            max_concurrent: config.max_concurrent,
            current: RwLock::new(Generation { id: 0, queue }),
            hub,
        })
    }

    /// Submit a job and immediately start queued jobs up to the ceiling.
    pub fn add<F, Fut>(&self, start: F) -> JobHandle
    where
        F: FnOnce(CancellationToken) -> Result<Fut, BoxError> + Send + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.add_boxed(Box::new(start))
    }

    pub fn add_boxed(&self, start: Box<dyn StartJob>) -> JobHandle {
        // Enqueue under the read lock so a concurrent `stop` either drains this
        // job or never sees it. Starting happens after the guard is gone; a
        // queue retired in between refuses to start anything.
        let (handle, queue) = {
            let current = self.read_current();
            (current.queue.enqueue_boxed(start), current.queue.clone())
        };
        queue.start_up_to(self.max_concurrent);
        handle
    }

    /// Swap in a fresh inner queue and cancel everything the old one had not
    /// started. Jobs already running finish normally.
    ///
    /// Returns how many queued jobs were canceled.
    pub fn stop(&self) -> usize {
        let retired = self.retire_current();
        let canceled = retired.queue.cancel_outstanding_jobs();
        tracing::debug!(
            generation = retired.id,
            canceled,
            still_running = retired.queue.running_count(),
            "Parallel job queue stopped"
        );
        canceled
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Running jobs of the current inner queue.
    pub fn running_count(&self) -> usize {
        self.read_current().queue.running_count()
    }

    pub fn pending_count(&self) -> usize {
        self.read_current().queue.pending_count()
    }

    pub fn is_idle(&self) -> bool {
        self.read_current().queue.is_idle()
    }

    /// Completions from every inner queue, including ones retired by `stop`.
    pub fn subscribe_completed(&self) -> broadcast::Receiver<JobEvent> {
        self.hub.completed_tx.subscribe()
    }

    pub fn subscribe_failed(&self) -> broadcast::Receiver<JobError> {
        self.hub.failed_tx.subscribe()
    }

    /// Fires when the current inner queue drains. Retired queues never fire it.
    pub fn subscribe_empty(&self) -> broadcast::Receiver<()> {
        self.hub.empty_tx.subscribe()
    }

    pub fn subscribe_canceled(&self) -> broadcast::Receiver<JobId> {
        self.hub.canceled_tx.subscribe()
    }

    /// Swap in a fresh generation and hand back the retired one, which starts
    /// nothing more but still holds its queued jobs.
    fn retire_current(&self) -> Generation {
        let mut current = self.write_current();
        current.queue.retire();
        let id = current.id + 1;
        let queue = current.queue.next_generation();
        spawn_pump(&queue, id, self.max_concurrent, Arc::clone(&self.hub));
        self.hub.current_generation.store(id, Ordering::Release);
        std::mem::replace(&mut *current, Generation { id, queue })
    }

    fn read_current(&self) -> RwLockReadGuard<'_, Generation> {
        match self.current.read() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!("RwLock poisoned reading current queue: {e}");
                e.into_inner()
            }
        }
    }

    fn write_current(&self) -> RwLockWriteGuard<'_, Generation> {
        match self.current.write() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!("RwLock poisoned replacing current queue: {e}");
                e.into_inner()
            }
        }
    }
}

impl Drop for ParallelJobQueue {
    fn drop(&mut self) {
        // In-flight jobs keep the inner queue alive, so drain it explicitly.
        self.read_current().queue.cancel_outstanding_jobs();
    }
}

impl std::fmt::Debug for ParallelJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.read_current();
        f.debug_struct("ParallelJobQueue")
            .field("max_concurrent", &self.max_concurrent)
            .field("generation", &current.id)
            .field("queue", &current.queue)
            .finish()
    }
}

impl EventHub {
    fn forward_completed(&self, event: JobEvent) {
        if let Some(err) = event.error() {
            let _ = self.failed_tx.send(err.clone());
        }
        let _ = self.completed_tx.send(event);
    }

    fn forward_empty(&self, generation: u64) {
        if self.current_generation.load(Ordering::Acquire) == generation {
            let _ = self.empty_tx.send(());
        }
    }
}

/// Refill `queue` after each of its completions and forward its events.
///
/// The pump only holds a weak reference, so it ends once the queue has been
/// retired and its last running job has finished. Top-ups of a retired queue
/// start nothing, but its completions are still forwarded.
fn spawn_pump(queue: &JobQueue, generation: u64, max_concurrent: usize, hub: Arc<EventHub>) {
    let weak = queue.downgrade();
    let mut completed = queue.subscribe_completed();
    let mut empty = queue.subscribe_empty();
    let mut canceled = queue.subscribe_canceled();

    queue.runtime().spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = completed.recv() => match event {
                    Ok(event) => {
                        hub.forward_completed(event);
                        top_up(&weak, max_concurrent);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(generation, missed, "Pump lagged behind completions");
                        top_up(&weak, max_concurrent);
                    }
                    Err(RecvError::Closed) => break,
                },
                id = canceled.recv() => match id {
                    Ok(id) => {
                        let _ = hub.canceled_tx.send(id);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(generation, missed, "Pump lagged behind cancellations");
                    }
                    Err(RecvError::Closed) => break,
                },
                signal = empty.recv() => match signal {
                    Ok(()) => hub.forward_empty(generation),
                    Err(RecvError::Lagged(_)) => hub.forward_empty(generation),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!(generation, "Pump finished");
    });
}

fn top_up(weak: &WeakJobQueue, max_concurrent: usize) {
    if let Some(queue) = weak.upgrade() {
        queue.start_up_to(max_concurrent);
    }
}
