// crates/jobs/src/metrics.rs
//! Queue metrics recorded through the `metrics` facade.
//!
//! Recording is a no-op until the host installs a recorder
//! (see `deferq_observability::init_metrics`).

use metrics::{counter, describe_counter, describe_gauge, gauge};

use crate::types::JobResult;

/// Describe all queue metrics. Call once after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(
        "deferq_jobs_enqueued_total",
        "Total number of jobs submitted to a queue"
    );
    describe_counter!(
        "deferq_jobs_started_total",
        "Total number of jobs whose start callable was invoked"
    );
    describe_counter!(
        "deferq_jobs_finished_total",
        "Total number of started jobs that reached a terminal state, by outcome"
    );
    describe_counter!(
        "deferq_jobs_canceled_total",
        "Total number of jobs resolved as canceled before they started"
    );
    describe_gauge!(
        "deferq_jobs_running",
        "Jobs currently running across every queue in the process"
    );
}

pub(crate) fn record_enqueued() {
    counter!("deferq_jobs_enqueued_total").increment(1);
}

// The running gauge moves by deltas: several queues (a retired generation and
// its replacement) may be live at once and all feed the same series.
pub(crate) fn record_started() {
    counter!("deferq_jobs_started_total").increment(1);
    gauge!("deferq_jobs_running").increment(1.0);
}

pub(crate) fn record_finished(outcome: &JobResult) {
    let outcome = if outcome.is_ok() { "succeeded" } else { "failed" };
    counter!("deferq_jobs_finished_total", "outcome" => outcome).increment(1);
    gauge!("deferq_jobs_running").decrement(1.0);
}

pub(crate) fn record_canceled() {
    counter!("deferq_jobs_canceled_total").increment(1);
}
