// crates/jobs/src/lib.rs
//! Bounded-concurrency deferred job scheduling.
//!
//! Provides:
//! - `JobQueue`: FIFO of deferred jobs with manual `start_next` / `start_up_to`
//! - `ParallelJobQueue`: keeps up to N jobs of a `JobQueue` running
//! - `JobHandle`: replayable completion + cooperative cancellation per job
//! - `QueueConfig`: ceiling and stream capacity, from TOML and `DEFERQ_*` env
//!
//! Jobs are `FnOnce(CancellationToken) -> Result<impl Future, BoxError>`:
//! a synchronous `Err` is a startup fault, the future's `Err` a job failure.

pub mod completion;
pub mod config;
pub mod error;
pub mod handle;
mod job;
pub mod metrics;
pub mod parallel;
pub mod queue;
pub mod types;

pub use completion::{Completion, CompletionWatch};
pub use config::QueueConfig;
pub use error::{JobError, QueueError};
pub use handle::{CancelOnDrop, JobHandle};
pub use parallel::ParallelJobQueue;
pub use queue::JobQueue;
pub use types::{BoxError, JobEvent, JobId, JobResult, JobStatus, StartJob};

pub use tokio_util::sync::CancellationToken;
