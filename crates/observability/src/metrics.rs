// crates/observability/src/metrics.rs
//! Prometheus recorder for the queue metrics.
//!
//! The jobs crate records through the `metrics` facade; this module installs
//! the process-wide recorder and renders it in Prometheus text format.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Handle to the installed recorder, passed to whoever renders metrics.
#[derive(Clone)]
pub struct MetricsHandle {
    inner: PrometheusHandle,
}

impl MetricsHandle {
    /// Current metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.inner.render()
    }
}

/// Install the Prometheus recorder and describe the queue metrics.
///
/// Fails if another recorder is already installed in this process.
pub fn init_metrics() -> anyhow::Result<MetricsHandle> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::set_global_recorder(recorder)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("failed to install metrics recorder")?;

    deferq_jobs::metrics::describe_metrics();

    tracing::info!("Prometheus metrics initialized");
    Ok(MetricsHandle { inner: handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use deferq_jobs::{BoxError, ParallelJobQueue};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_queue_activity_is_rendered() {
        let handle = init_metrics().unwrap();
        assert!(init_metrics().is_err());

        let queue = ParallelJobQueue::new(1).unwrap();
        let (release_old, old_done) = oneshot::channel::<()>();
        let (release_new, new_done) = oneshot::channel::<()>();
        let old = queue.add(move |_| {
            Ok(async move {
                let _ = old_done.await;
                Ok::<(), BoxError>(())
            })
        });

        // The retired generation keeps running next to the fresh one.
        queue.stop();
        let new = queue.add(move |_| {
            Ok(async move {
                let _ = new_done.await;
                Ok::<(), BoxError>(())
            })
        });
        assert!(handle.render().contains("deferq_jobs_running 2"));

        release_new.send(()).unwrap();
        assert!(new.wait().await.is_ok());
        assert!(handle.render().contains("deferq_jobs_running 1"));

        release_old.send(()).unwrap();
        assert!(old.wait().await.is_ok());

        let rendered = handle.render();
        assert!(rendered.contains("deferq_jobs_running 0"));
        assert!(rendered.contains("deferq_jobs_enqueued_total 2"));
        assert!(rendered.contains("deferq_jobs_started_total 2"));
        assert!(rendered.contains("outcome=\"succeeded\"} 2"));
    }
}
