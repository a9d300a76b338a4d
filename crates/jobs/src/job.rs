// crates/jobs/src/job.rs
//! A single queued unit of work.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::completion::Completion;
use crate::error::JobError;
use crate::handle::{JobControl, JobHandle};
use crate::types::{JobFuture, JobId, JobResult, JobStatus, StartJob};

/// One submitted job, owned by the queue until it is started or discarded.
pub(crate) struct Job {
    id: JobId,
    start: Box<dyn StartJob>,
    control: Arc<JobControl>,
    completion: Completion,
}

impl Job {
    /// Build a job and the handle its submitter keeps.
    pub(crate) fn new(id: JobId, start: Box<dyn StartJob>) -> (Self, JobHandle) {
        let control = Arc::new(JobControl::new());
        let completion = Completion::new();
        let handle = JobHandle::new(id, Arc::clone(&control), completion.watch());
        let job = Self {
            id,
            start,
            control,
            completion,
        };
        (job, handle)
    }

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.control.is_cancel_requested()
    }

    /// Invoke `start` with a fresh run token.
    ///
    /// Either way the job is now a [`RunningJob`]; a synchronous failure
    /// or a panic inside `start` comes back as a startup error so the caller
    /// can finish it.
    pub(crate) fn start(self) -> Result<(RunningJob, JobFuture), (RunningJob, JobError)> {
        let token = CancellationToken::new();
        self.control.install_run(token.clone());
        self.control.set_status(JobStatus::Running);

        let running = RunningJob {
            id: self.id,
            control: self.control,
            completion: self.completion,
        };
        let start = self.start;
        match panic::catch_unwind(AssertUnwindSafe(move || start.start(token))) {
            Ok(Ok(fut)) => Ok((running, fut)),
            Ok(Err(e)) => Err((running, JobError::startup(e))),
            Err(_) => {
                tracing::warn!(job_id = running.id, "Job panicked during start");
                Err((running, JobError::startup("job panicked during start".into())))
            }
        }
    }

    /// Resolve a job that will never run.
    pub(crate) fn cancel(self) {
        self.control.set_status(JobStatus::Canceled);
        self.completion.resolve(Err(JobError::Canceled));
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("status", &self.control.status())
            .field("cancel_requested", &self.control.is_cancel_requested())
            .finish()
    }
}

/// A job whose `start` has been invoked; only its completion remains.
#[derive(Debug)]
pub(crate) struct RunningJob {
    id: JobId,
    control: Arc<JobControl>,
    completion: Completion,
}

impl RunningJob {
    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    /// Record the terminal outcome on the handle.
    pub(crate) fn finish(&self, outcome: &JobResult) {
        let status = if outcome.is_ok() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        self.control.set_status(status);
        self.completion.resolve(outcome.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoxError;

    type Ready = futures_util::future::Ready<Result<(), BoxError>>;

    fn ok_job(id: JobId) -> (Job, JobHandle) {
        Job::new(
            id,
            Box::new(|_cancel: CancellationToken| {
                Ok::<_, BoxError>(async { Ok::<(), BoxError>(()) })
            }),
        )
    }

    #[tokio::test]
    async fn test_start_and_finish() {
        let (job, handle) = ok_job(1);
        assert_eq!(job.id(), 1);

        let (running, fut) = job.start().unwrap();
        assert_eq!(handle.status(), JobStatus::Running);

        let outcome = fut.await.map_err(JobError::failed);
        running.finish(&outcome);
        assert_eq!(handle.status(), JobStatus::Succeeded);
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_resolves_canceled() {
        let (job, handle) = ok_job(2);
        handle.cancel();
        assert!(job.is_cancel_requested());

        job.cancel();
        assert_eq!(handle.status(), JobStatus::Canceled);
        assert!(matches!(handle.wait().await, Err(JobError::Canceled)));
    }

    #[test]
    fn test_start_failure_is_returned() {
        let (job, handle) = Job::new(
            3,
            Box::new(|_cancel: CancellationToken| {
                Err::<Ready, BoxError>("no destination".into())
            }),
        );
        let (running, err) = job.start().err().unwrap();
        assert!(matches!(err, JobError::Startup(_)));

        running.finish(&Err(err));
        assert_eq!(handle.status(), JobStatus::Failed);
        assert!(matches!(handle.result(), Some(Err(JobError::Startup(_)))));
    }

    #[test]
    fn test_start_panic_becomes_startup_error() {
        let (job, handle) = Job::new(
            5,
            Box::new(|_cancel: CancellationToken| -> Result<Ready, BoxError> {
                panic!("template missing")
            }),
        );
        let (running, err) = job.start().err().unwrap();
        assert_eq!(err.to_string(), "job failed to start: job panicked during start");

        running.finish(&Err(err));
        assert_eq!(handle.status(), JobStatus::Failed);
    }

    #[test]
    fn test_start_passes_cancellable_token() {
        let (job, handle) = Job::new(
            4,
            Box::new(|cancel: CancellationToken| {
                let fut = async move {
                    cancel.cancelled().await;
                    Ok::<(), BoxError>(())
                };
                Ok::<_, BoxError>(fut)
            }),
        );
        let (_running, fut) = job.start().unwrap();
        handle.cancel();
        // The token fired, so the future completes immediately.
        assert!(tokio_test::block_on(fut).is_ok());
    }
}
