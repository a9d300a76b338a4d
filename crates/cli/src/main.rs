// crates/cli/src/main.rs
//! deferq CLI
//!
//! Drives a [`deferq_jobs::ParallelJobQueue`] with simulated downloads so the
//! scheduler can be watched under load.

mod simulate;

use std::process;

use clap::{Parser, Subcommand};
use deferq_observability::{init_tracing, LogFormat, DEFAULT_FILTER};

#[derive(Parser)]
#[command(name = "deferq")]
#[command(about = "Bounded-concurrency deferred job queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run simulated download jobs through a parallel queue
    Simulate(simulate::SimulateArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(DEFAULT_FILTER, LogFormat::from_env()) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }

    let result = match cli.command {
        Command::Simulate(args) => simulate::run(args).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simulate_flags() {
        let cli = Cli::try_parse_from([
            "deferq",
            "simulate",
            "--jobs",
            "12",
            "--concurrency",
            "3",
            "--fail-rate",
            "0.25",
            "--cancel-every",
            "4",
            "--json",
        ])
        .unwrap();

        let Command::Simulate(args) = cli.command;
        assert_eq!(args.jobs, 12);
        assert_eq!(args.concurrency, Some(3));
        assert_eq!(args.fail_rate, 0.25);
        assert_eq!(args.cancel_every, Some(4));
        assert!(args.json);
        assert!(!args.metrics);
        assert_eq!(args.stop_after_ms, None);
    }

    #[test]
    fn test_simulate_defaults() {
        let cli = Cli::try_parse_from(["deferq", "simulate"]).unwrap();
        let Command::Simulate(args) = cli.command;
        assert_eq!(args.jobs, 20);
        assert_eq!(args.concurrency, None);
        assert_eq!(args.min_ms, 50);
        assert_eq!(args.max_ms, 250);
        assert_eq!(args.fail_rate, 0.0);
    }

    #[test]
    fn test_missing_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["deferq"]).is_err());
    }
}
