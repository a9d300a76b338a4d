// crates/jobs/src/error.rs
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::types::BoxError;

/// Terminal failure of a job, as seen by its handle and the event streams.
///
/// Cloneable so one terminal event can be replayed to every observer.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Cancellation was requested before the job was started.
    #[error("job canceled before it started")]
    Canceled,

    /// The job's future completed with an error.
    #[error("job failed: {0}")]
    Failed(Arc<dyn Error + Send + Sync>),

    /// The job's `start` callable failed before producing a future.
    #[error("job failed to start: {0}")]
    Startup(Arc<dyn Error + Send + Sync>),
}

impl JobError {
    pub(crate) fn failed(err: BoxError) -> Self {
        Self::Failed(Arc::from(err))
    }

    pub(crate) fn startup(err: BoxError) -> Self {
        Self::Startup(Arc::from(err))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// The underlying cause, if the job actually ran or tried to.
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            Self::Canceled => None,
            Self::Failed(e) | Self::Startup(e) => Some(e.as_ref()),
        }
    }
}

/// Errors raised when building or configuring a queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("max_concurrent must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("event_capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),

    #[error("failed to read config {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value:?}")]
    ConfigEnv { var: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_display() {
        assert_eq!(JobError::Canceled.to_string(), "job canceled before it started");

        let failed = JobError::failed("connection reset".into());
        assert_eq!(failed.to_string(), "job failed: connection reset");

        let startup = JobError::startup("missing url".into());
        assert_eq!(startup.to_string(), "job failed to start: missing url");
    }

    #[test]
    fn test_job_error_cause() {
        assert!(JobError::Canceled.cause().is_none());
        assert!(JobError::Canceled.is_canceled());

        let failed = JobError::failed("disk full".into());
        assert_eq!(failed.cause().map(|e| e.to_string()), Some("disk full".into()));
        assert!(!failed.is_canceled());
    }

    #[test]
    fn test_job_error_clone_shares_cause() {
        let failed = JobError::failed("timeout".into());
        let cloned = failed.clone();
        match (&failed, &cloned) {
            (JobError::Failed(a), JobError::Failed(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected Failed"),
        }
    }

    #[test]
    fn test_queue_error_display() {
        assert_eq!(
            QueueError::InvalidConcurrency(0).to_string(),
            "max_concurrent must be at least 1, got 0"
        );
    }
}
