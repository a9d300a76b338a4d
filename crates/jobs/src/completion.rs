// crates/jobs/src/completion.rs
//! Resolve-once, replayable completion cell.
//!
//! [`Completion`] is held by the queue's bookkeeping and resolved exactly
//! once. Any number of [`CompletionWatch`]ers, created before or after the
//! resolution, observe the same terminal outcome.

use tokio::sync::watch;

use crate::error::JobError;
use crate::types::JobResult;

/// Write side of a job's completion.
#[derive(Debug)]
pub struct Completion {
    tx: watch::Sender<Option<JobResult>>,
}

impl Completion {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Publish the terminal outcome.
    ///
    /// Returns `false` if the completion was already resolved, in which case
    /// the earlier outcome is kept.
    pub fn resolve(&self, outcome: JobResult) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn watch(&self) -> CompletionWatch {
        CompletionWatch {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of a job's completion. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CompletionWatch {
    rx: watch::Receiver<Option<JobResult>>,
}

impl CompletionWatch {
    /// Current outcome without waiting.
    pub fn peek(&self) -> Option<JobResult> {
        self.rx.borrow().clone()
    }

    /// Wait for the terminal outcome.
    ///
    /// If the write side is dropped without resolving, the job can never run
    /// and this reports [`JobError::Canceled`].
    pub async fn wait(&self) -> JobResult {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(resolved) => resolved.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(JobError::Canceled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_resolves_once() {
        let completion = Completion::new();
        assert!(!completion.is_resolved());
        assert!(completion.resolve(Ok(())));
        assert!(completion.is_resolved());
        assert!(!completion.resolve(Err(JobError::Canceled)));
        assert!(completion.watch().peek().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_late_watcher_sees_outcome() {
        let completion = Completion::new();
        completion.resolve(Err(JobError::Canceled));

        let watch = completion.watch();
        let outcome = watch.wait().await;
        assert!(matches!(outcome, Err(JobError::Canceled)));
    }

    #[tokio::test]
    async fn test_multiple_waiters_see_same_outcome() {
        let completion = Completion::new();
        let a = completion.watch();
        let b = a.clone();

        let wait_a = tokio::spawn(async move { a.wait().await });
        let wait_b = tokio::spawn(async move { b.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        completion.resolve(Ok(()));

        assert!(wait_a.await.unwrap().is_ok());
        assert!(wait_b.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_unresolved_reports_canceled() {
        let completion = Completion::new();
        let watch = completion.watch();
        drop(completion);
        assert!(matches!(watch.wait().await, Err(JobError::Canceled)));
    }
}
