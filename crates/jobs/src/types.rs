// crates/jobs/src/types.rs
//! Types shared by the queue, the handles and the event streams.

use std::error::Error;
use std::future::Future;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;

/// Unique identifier for a submitted job.
pub type JobId = u64;

/// Error type produced by job futures and by a failing `start`.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Terminal outcome of a job.
pub type JobResult = Result<(), JobError>;

/// Lifecycle of a single job.
///
/// `Queued -> Running -> (Succeeded | Failed)`, or `Queued -> Canceled`
/// when cancellation was requested before the job was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum JobStatus {
    Queued = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
    Canceled = 4,
}

impl JobStatus {
    /// Decode a stored discriminant; `None` for bytes no variant produces.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Queued),
            1 => Some(Self::Running),
            2 => Some(Self::Succeeded),
            3 => Some(Self::Failed),
            4 => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// True once the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on `job_completed` for every job that actually ran.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub id: JobId,
    pub outcome: JobResult,
}

impl JobEvent {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&JobError> {
        self.outcome.as_ref().err()
    }
}

/// A job's `start` callable.
///
/// Receives the cancellation token of the live run and either returns the
/// future doing the work, or fails synchronously before any work begins.
pub trait StartJob: Send + 'static {
    fn start(self: Box<Self>, cancel: CancellationToken) -> Result<JobFuture, BoxError>;
}

/// Boxed job future as stored by the queue once started.
pub type JobFuture = futures_util::future::BoxFuture<'static, Result<(), BoxError>>;

impl<F, Fut> StartJob for F
where
    F: FnOnce(CancellationToken) -> Result<Fut, BoxError> + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn start(self: Box<Self>, cancel: CancellationToken) -> Result<JobFuture, BoxError> {
        let fut = (*self)(cancel)?;
        Ok(Box::pin(fut))
    }
}
