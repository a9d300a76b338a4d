// crates/jobs/src/handle.rs
//! Submitter-facing job handle and the control block it shares with the queue.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::completion::CompletionWatch;
use crate::types::{JobId, JobResult, JobStatus};

/// State shared between a queued job and every clone of its handle.
#[derive(Debug)]
pub(crate) struct JobControl {
    status: AtomicU8,
    cancel_requested: AtomicBool,
    /// Token of the live run, installed when the job starts.
    active_run: Mutex<Option<CancellationToken>>,
}

impl JobControl {
    pub(crate) fn new() -> Self {
        Self {
            status: AtomicU8::new(JobStatus::Queued as u8),
            cancel_requested: AtomicBool::new(false),
            active_run: Mutex::new(None),
        }
    }

    pub(crate) fn status(&self) -> JobStatus {
        let raw = self.status.load(Ordering::Acquire);
        // Only `set_status` writes this byte.
        JobStatus::from_u8(raw).unwrap_or_else(|| {
            tracing::error!(raw, "Invalid job status byte");
            JobStatus::Failed
        })
    }

    pub(crate) fn set_status(&self, status: JobStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Set the one-shot cancel flag and forward it to the live run, if any.
    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
        match self.active_run.lock() {
            Ok(guard) => {
                if let Some(token) = guard.as_ref() {
                    token.cancel();
                }
            }
            Err(e) => tracing::error!("Mutex poisoned reading active run: {e}"),
        }
    }

    /// Install the token for the run that is about to start.
    ///
    /// A cancel that raced ahead of the install is applied to the new token.
    pub(crate) fn install_run(&self, token: CancellationToken) {
        let mut guard = match self.active_run.lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!("Mutex poisoned installing active run: {e}");
                e.into_inner()
            }
        };
        if self.cancel_requested.load(Ordering::Acquire) {
            token.cancel();
        }
        *guard = Some(token);
    }
}

/// Handle returned to the submitter of a job.
///
/// Cloning is cheap; all clones refer to the same job. Dropping a handle does
/// not cancel the job, use [`JobHandle::cancel_on_drop`] for that.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    control: Arc<JobControl>,
    completion: CompletionWatch,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, control: Arc<JobControl>, completion: CompletionWatch) -> Self {
        Self {
            id,
            control,
            completion,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.control.status()
    }

    /// Request cancellation.
    ///
    /// A job that has not started yet is skipped and resolves as canceled.
    /// A running job has its cancellation token signalled; whether it stops
    /// early is up to the job.
    pub fn cancel(&self) {
        self.control.request_cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.control.is_cancel_requested()
    }

    /// Terminal outcome, if the job has finished.
    pub fn result(&self) -> Option<JobResult> {
        self.completion.peek()
    }

    /// Wait for the terminal outcome. Can be called any number of times.
    pub async fn wait(&self) -> JobResult {
        self.completion.wait().await
    }

    /// Wrap the handle in a guard that cancels the job when dropped.
    pub fn cancel_on_drop(self) -> CancelOnDrop {
        CancelOnDrop {
            handle: Some(self),
        }
    }
}

/// Cancels its job when dropped, unless [`CancelOnDrop::disarm`]ed.
#[derive(Debug)]
pub struct CancelOnDrop {
    handle: Option<JobHandle>,
}

impl CancelOnDrop {
    pub fn handle(&self) -> Option<&JobHandle> {
        self.handle.as_ref()
    }

    /// Give the handle back without cancelling.
    pub fn disarm(mut self) -> Option<JobHandle> {
        self.handle.take()
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}
