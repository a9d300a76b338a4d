//! Logging and metrics setup for deferq binaries.
//!
//! - [`init_tracing`] installs the global `tracing` subscriber
//! - [`init_metrics`] installs the Prometheus recorder

pub mod metrics;

pub use metrics::{init_metrics, MetricsHandle};

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "warn,deferq=info,deferq_jobs=info";

/// Selects the log line format (`DEFERQ_LOG_FORMAT`).
pub const ENV_LOG_FORMAT: &str = "DEFERQ_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// Read the format from the environment; anything but `json` is compact.
    pub fn from_env() -> Self {
        Self::parse(std::env::var(ENV_LOG_FORMAT).ok().as_deref())
    }

    fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Logs go to stderr so
/// they do not mix with command output.
pub fn init_tracing(default_filter: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse(None), LogFormat::Compact);
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" JSON ")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("pretty")), LogFormat::Compact);
    }

    #[test]
    fn test_init_tracing_twice_fails() {
        assert!(init_tracing(DEFAULT_FILTER, LogFormat::Compact).is_ok());
        assert!(init_tracing(DEFAULT_FILTER, LogFormat::Json).is_err());
    }
}
