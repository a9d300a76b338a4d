// crates/jobs/src/config.rs
//! Queue configuration.
//!
//! Resolved in order: built-in defaults, an optional TOML file, then
//! environment variables. Callers (the CLI) may override on top.
//!
//! ```toml
//! max_concurrent = 8
//! event_capacity = 512
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::QueueError;

/// Default concurrency ceiling.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Default buffer size of each broadcast event stream.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

pub const ENV_MAX_CONCURRENT: &str = "DEFERQ_MAX_CONCURRENT";
pub const ENV_EVENT_CAPACITY: &str = "DEFERQ_EVENT_CAPACITY";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// How many jobs a `ParallelJobQueue` runs at once.
    pub max_concurrent: usize,
    /// Slow subscribers that fall further behind than this lose events.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl QueueConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, QueueError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| QueueError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `DEFERQ_*` overrides from the process environment.
    pub fn with_env(self) -> Result<Self, QueueError> {
        self.with_env_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides using `lookup` in place of the process environment.
    pub fn with_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, QueueError> {
        if let Some(raw) = lookup(ENV_MAX_CONCURRENT) {
            self.max_concurrent = parse_env(ENV_MAX_CONCURRENT, raw)?;
        }
        if let Some(raw) = lookup(ENV_EVENT_CAPACITY) {
            self.event_capacity = parse_env(ENV_EVENT_CAPACITY, raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_concurrent < 1 {
            return Err(QueueError::InvalidConcurrency(self.max_concurrent));
        }
        if self.event_capacity < 1 {
            return Err(QueueError::InvalidCapacity(self.event_capacity));
        }
        Ok(())
    }
}

fn parse_env(var: &'static str, raw: String) -> Result<usize, QueueError> {
    raw.trim()
        .parse()
        .map_err(|_| QueueError::ConfigEnv { var, value: raw })
}
