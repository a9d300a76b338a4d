//! `deferq simulate`: push simulated downloads through a [`ParallelJobQueue`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use clap::Args;
use deferq_jobs::{
    BoxError, CancellationToken, JobError, JobResult, ParallelJobQueue, QueueConfig,
};
use deferq_observability::init_metrics;
use futures_util::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Number of jobs to submit
    #[arg(long, default_value_t = 20)]
    pub jobs: usize,

    /// Maximum jobs running at once (overrides config file and environment)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Shortest simulated download, in milliseconds
    #[arg(long, default_value_t = 50)]
    pub min_ms: u64,

    /// Longest simulated download, in milliseconds
    #[arg(long, default_value_t = 250)]
    pub max_ms: u64,

    /// Probability that a download fails (0.0 to 1.0)
    #[arg(long, default_value_t = 0.0)]
    pub fail_rate: f64,

    /// Cancel every k-th job right after submitting it
    #[arg(long)]
    pub cancel_every: Option<usize>,

    /// Call `stop()` on the queue after this many milliseconds
    #[arg(long)]
    pub stop_after_ms: Option<u64>,

    /// Seed for download durations and failures (random if omitted)
    #[arg(long)]
    pub seed: Option<u64>,

    /// TOML file with queue settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Print Prometheus metrics after the summary
    #[arg(long)]
    pub metrics: bool,
}

impl SimulateArgs {
    fn validate(&self) -> Result<()> {
        ensure!(
            self.min_ms <= self.max_ms,
            "--min-ms ({}) must not exceed --max-ms ({})",
            self.min_ms,
            self.max_ms
        );
        ensure!(
            (0.0..=1.0).contains(&self.fail_rate),
            "--fail-rate must be between 0.0 and 1.0, got {}",
            self.fail_rate
        );
        ensure!(
            self.cancel_every != Some(0),
            "--cancel-every must be at least 1"
        );
        Ok(())
    }

    fn cancels(&self, index: usize) -> bool {
        self.cancel_every.is_some_and(|k| (index + 1) % k == 0)
    }
}

/// What happened to the submitted jobs.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Jobs whose start itself failed; also counted in `failed`.
    pub startup_failed: usize,
    pub canceled: usize,
    pub peak_running: usize,
    pub max_concurrent: usize,
    /// Queued jobs dropped by a timed `stop()`, if it fired.
    pub stopped_canceled: Option<usize>,
    pub elapsed_ms: u64,
}

impl Summary {
    fn tally(outcomes: &[JobResult]) -> Self {
        let mut summary = Self {
            submitted: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(()) => summary.succeeded += 1,
                Err(JobError::Canceled) => summary.canceled += 1,
                Err(JobError::Startup(_)) => {
                    summary.failed += 1;
                    summary.startup_failed += 1;
                }
                Err(JobError::Failed(_)) => summary.failed += 1,
            }
        }
        summary
    }

    fn print(&self) {
        println!(
            "  \u{2713} {} jobs in {:.2}s: {} succeeded, {} failed, {} canceled",
            self.submitted,
            self.elapsed_ms as f64 / 1000.0,
            self.succeeded,
            self.failed,
            self.canceled,
        );
        println!(
            "    peak running {} of {}",
            self.peak_running, self.max_concurrent
        );
        if let Some(canceled) = self.stopped_canceled {
            println!("    stop() canceled {canceled} queued jobs");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct JobPlan {
    delay: Duration,
    fail: bool,
}

fn plan_jobs(args: &SimulateArgs, rng: &mut impl Rng) -> Vec<JobPlan> {
    (0..args.jobs)
        .map(|_| JobPlan {
            delay: Duration::from_millis(rng.gen_range(args.min_ms..=args.max_ms)),
            fail: rng.gen_bool(args.fail_rate),
        })
        .collect()
}

/// Layer the config file, then `DEFERQ_*` variables, then `--concurrency`.
fn resolve_config(args: &SimulateArgs) -> Result<QueueConfig> {
    let base = match &args.config {
        Some(path) => QueueConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => QueueConfig::default(),
    };
    let mut config = base
        .with_env()
        .context("invalid queue settings in environment")?;
    if let Some(concurrency) = args.concurrency {
        config.max_concurrent = concurrency;
    }
    config.validate()?;
    Ok(config)
}

/// Tracks how many simulated downloads are in their body at once.
#[derive(Default)]
struct Occupancy {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    fn enter(self: &Arc<Self>) -> OccupancyGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        OccupancyGuard(Arc::clone(self))
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct OccupancyGuard(Arc<Occupancy>);

impl Drop for OccupancyGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    args.validate()?;
    let config = resolve_config(&args)?;
    let metrics = if args.metrics {
        Some(init_metrics()?)
    } else {
        None
    };

    let progress = if args.json {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(args.jobs as u64);
        bar.set_style(
            ProgressStyle::with_template("  {spinner} [{bar:30}] {pos}/{len} {msg}")
                .context("invalid progress template")?
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    };

    let summary = execute(&args, &config, progress.clone()).await?;
    progress.finish_and_clear();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        summary.print();
    }
    if let Some(metrics) = metrics {
        print!("{}", metrics.render());
    }
    Ok(())
}

async fn execute(
    args: &SimulateArgs,
    config: &QueueConfig,
    progress: ProgressBar,
) -> Result<Summary> {
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let plans = plan_jobs(args, &mut rng);

    let queue = Arc::new(ParallelJobQueue::with_config(config)?);
    let occupancy = Arc::new(Occupancy::default());
    let done = CancellationToken::new();
    let watcher = tokio::spawn(watch_events(
        Arc::clone(&queue),
        progress,
        done.clone(),
    ));

    tracing::info!(
        jobs = args.jobs,
        max_concurrent = config.max_concurrent,
        "Starting simulation"
    );
    let started_at = Instant::now();

    let stopper = args.stop_after_ms.map(|ms| {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let canceled = queue.stop();
            tracing::info!(canceled, "Queue stopped");
            canceled
        })
    });

    let mut handles = Vec::with_capacity(plans.len());
    for (index, plan) in plans.into_iter().enumerate() {
        let occupancy = Arc::clone(&occupancy);
        let handle = queue.add(move |cancel: CancellationToken| {
            Ok(async move {
                let _slot = occupancy.enter();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        Err::<(), BoxError>(format!("download {index} interrupted").into())
                    }
                    _ = tokio::time::sleep(plan.delay) => {
                        if plan.fail {
                            Err::<(), BoxError>(format!("download {index}: connection reset").into())
                        } else {
                            Ok(())
                        }
                    }
                }
            })
        });
        if args.cancels(index) {
            handle.cancel();
        }
        handles.push(handle);
    }

    let outcomes = join_all(handles.iter().map(|handle| handle.wait())).await;
    let elapsed = started_at.elapsed();

    let stopped_canceled = match stopper {
        Some(task) => {
            task.abort();
            task.await.ok()
        }
        None => None,
    };
    done.cancel();
    if let Err(e) = watcher.await {
        tracing::warn!(error = %e, "Event watcher ended abnormally");
    }

    let mut summary = Summary::tally(&outcomes);
    summary.peak_running = occupancy.peak();
    summary.max_concurrent = config.max_concurrent;
    summary.stopped_canceled = stopped_canceled;
    summary.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

    tracing::info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        canceled = summary.canceled,
        peak_running = summary.peak_running,
        "Simulation finished"
    );
    Ok(summary)
}

/// Advance the progress bar from the queue's event streams until `done`.
async fn watch_events(queue: Arc<ParallelJobQueue>, progress: ProgressBar, done: CancellationToken) {
    let mut completed = queue.subscribe_completed();
    let mut canceled = queue.subscribe_canceled();
    let mut empty = queue.subscribe_empty();

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            event = completed.recv() => match event {
                Ok(event) => {
                    if let Some(err) = event.error() {
                        tracing::debug!(job_id = event.id, error = %err, "Download failed");
                    }
                    progress.inc(1);
                }
                Err(RecvError::Lagged(missed)) => progress.inc(missed),
                Err(RecvError::Closed) => break,
            },
            id = canceled.recv() => match id {
                Ok(id) => {
                    tracing::debug!(job_id = id, "Download canceled");
                    progress.inc(1);
                }
                Err(RecvError::Lagged(missed)) => progress.inc(missed),
                Err(RecvError::Closed) => break,
            },
            signal = empty.recv() => match signal {
                Ok(()) | Err(RecvError::Lagged(_)) => tracing::debug!("Queue drained"),
                Err(RecvError::Closed) => break,
            },
        }
        progress.set_message(format!("{} running", queue.running_count()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn args(jobs: usize) -> SimulateArgs {
        SimulateArgs {
            jobs,
            concurrency: Some(2),
            min_ms: 1,
            max_ms: 5,
            fail_rate: 0.0,
            cancel_every: None,
            stop_after_ms: None,
            seed: Some(7),
            config: None,
            json: true,
            metrics: false,
        }
    }

    #[test]
    fn test_tally_counts_each_outcome() {
        let outcomes: Vec<JobResult> = vec![
            Ok(()),
            Ok(()),
            Err(JobError::Canceled),
            Err(JobError::Failed(Arc::new(std::io::Error::other("reset")))),
            Err(JobError::Startup(Arc::new(std::io::Error::other("bad url")))),
        ];
        let summary = Summary::tally(&outcomes);
        assert_eq!(
            summary,
            Summary {
                submitted: 5,
                succeeded: 2,
                failed: 2,
                startup_failed: 1,
                canceled: 1,
                ..Summary::default()
            }
        );
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut bad = args(1);
        bad.min_ms = 10;
        bad.max_ms = 5;
        assert!(bad.validate().is_err());

        let mut bad = args(1);
        bad.fail_rate = 1.5;
        assert!(bad.validate().is_err());

        let mut bad = args(1);
        bad.cancel_every = Some(0);
        assert!(bad.validate().is_err());

        assert!(args(1).validate().is_ok());
    }

    #[test]
    fn test_cancel_every_picks_kth_jobs() {
        let mut a = args(6);
        a.cancel_every = Some(3);
        let picked: Vec<usize> = (0..6).filter(|i| a.cancels(*i)).collect();
        assert_eq!(picked, vec![2, 5]);
        assert!(!args(6).cancels(0));
    }

    #[test]
    fn test_plan_respects_bounds_and_fail_rate() {
        let mut a = args(50);
        a.min_ms = 10;
        a.max_ms = 20;
        let mut rng = StdRng::seed_from_u64(1);
        let plans = plan_jobs(&a, &mut rng);
        assert_eq!(plans.len(), 50);
        assert!(plans.iter().all(|p| !p.fail));
        assert!(plans
            .iter()
            .all(|p| (10..=20).contains(&(p.delay.as_millis() as u64))));

        a.fail_rate = 1.0;
        let plans = plan_jobs(&a, &mut rng);
        assert!(plans.iter().all(|p| p.fail));
    }

    #[test]
    fn test_same_seed_same_plan() {
        let a = args(10);
        let first = plan_jobs(&a, &mut StdRng::seed_from_u64(42));
        let second = plan_jobs(&a, &mut StdRng::seed_from_u64(42));
        assert_eq!(first, second);
    }

    #[test]
    fn test_resolve_config_layers_file_and_flag() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent = 7\nevent_capacity = 32").unwrap();

        let mut a = args(1);
        a.concurrency = None;
        a.config = Some(file.path().to_path_buf());
        let config = resolve_config(&a).unwrap();
        assert_eq!(config.max_concurrent, 7);
        assert_eq!(config.event_capacity, 32);

        a.concurrency = Some(2);
        assert_eq!(resolve_config(&a).unwrap().max_concurrent, 2);

        a.concurrency = Some(0);
        assert!(resolve_config(&a).is_err());
    }

    #[test]
    fn test_resolve_config_reports_missing_file() {
        let mut a = args(1);
        a.config = Some(PathBuf::from("/nonexistent/deferq.toml"));
        let err = resolve_config(&a).unwrap_err();
        assert!(err.to_string().contains("failed to load config"));
    }

    #[tokio::test]
    async fn test_execute_with_cancellations() {
        let mut a = args(6);
        a.cancel_every = Some(3);
        let config = resolve_config(&a).unwrap();

        let summary = execute(&a, &config, ProgressBar::hidden()).await.unwrap();
        assert_eq!(summary.submitted, 6);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.canceled, 2);
        assert_eq!(summary.failed, 0);
        assert!(summary.peak_running >= 1);
        assert!(summary.peak_running <= 2);
        assert_eq!(summary.max_concurrent, 2);
        assert_eq!(summary.stopped_canceled, None);
    }

    #[tokio::test]
    async fn test_execute_all_failing() {
        let mut a = args(4);
        a.fail_rate = 1.0;
        let config = resolve_config(&a).unwrap();

        let summary = execute(&a, &config, ProgressBar::hidden()).await.unwrap();
        assert_eq!(summary.failed, 4);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.startup_failed, 0);
    }

    #[tokio::test]
    async fn test_execute_stop_spares_running_job() {
        let mut a = args(10);
        a.concurrency = Some(1);
        a.min_ms = 100;
        a.max_ms = 100;
        a.stop_after_ms = Some(20);
        let config = resolve_config(&a).unwrap();

        let summary = execute(&a, &config, ProgressBar::hidden()).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.canceled, 9);
        assert_eq!(summary.stopped_canceled, Some(9));
        assert_eq!(summary.peak_running, 1);
    }
}
