//! Runtime configuration.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `worker_threads` | available CPU parallelism |
//! | `thread_stack_size` | 2 MiB |
//! | `thread_name_prefix` | `"coopsync-worker"` |
//!
//! # Environment overrides
//!
//! [`RuntimeConfig::from_env`] starts from the defaults and applies every
//! `COOPSYNC_*` variable it recognizes:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `COOPSYNC_WORKER_THREADS` | `worker_threads` |
//! | `COOPSYNC_THREAD_STACK_SIZE` | `thread_stack_size` |
//! | `COOPSYNC_THREAD_NAME_PREFIX` | `thread_name_prefix` |
//!
//! Unknown `COOPSYNC_*` keys are rejected so typos do not go unnoticed.

use std::collections::BTreeMap;

const ENV_PREFIX: &str = "COOPSYNC_";
const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;
const DEFAULT_NAME_PREFIX: &str = "coopsync-worker";

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A value could not be parsed.
    #[error("config parse error: {0}")]
    Parse(String),
    /// `worker_threads` was zero after normalization was skipped.
    #[error("worker_threads must be > 0")]
    InvalidWorkerThreads,
    /// The stack size is below the platform-independent floor.
    #[error("thread_stack_size must be at least {min} bytes, got {actual}")]
    StackTooSmall {
        /// Smallest accepted stack size.
        min: usize,
        /// Configured stack size.
        actual: usize,
    },
    /// An unrecognized `COOPSYNC_*` variable was set.
    #[error("invalid override: {0}")]
    InvalidOverride(String),
}

/// Configuration for a [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of worker threads (default: available parallelism).
    pub worker_threads: usize,
    /// Stack size per worker thread (default: 2 MiB).
    pub thread_stack_size: usize,
    /// Name prefix for worker threads; the worker index is appended.
    pub thread_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: available_parallelism(),
            thread_stack_size: DEFAULT_STACK_SIZE,
            thread_name_prefix: DEFAULT_NAME_PREFIX.to_owned(),
        }
    }
}

impl RuntimeConfig {
    /// Smallest stack size [`validate`](Self::validate) accepts.
    pub const MIN_STACK_SIZE: usize = 64 * 1024;

    /// Creates a configuration with `worker_threads` workers and default
    /// values elsewhere.
    #[must_use]
    pub fn with_workers(worker_threads: usize) -> Self {
        Self {
            worker_threads,
            ..Self::default()
        }
    }

    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = 1;
        }
        if self.thread_stack_size == 0 {
            self.thread_stack_size = DEFAULT_STACK_SIZE;
        }
        if self.thread_name_prefix.is_empty() {
            DEFAULT_NAME_PREFIX.clone_into(&mut self.thread_name_prefix);
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidWorkerThreads);
        }
        if self.thread_stack_size < Self::MIN_STACK_SIZE {
            return Err(ConfigError::StackTooSmall {
                min: Self::MIN_STACK_SIZE,
                actual: self.thread_stack_size,
            });
        }
        Ok(())
    }

    /// Builds a configuration from the defaults plus `COOPSYNC_*` environment
    /// variables, then normalizes and validates it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let overrides: BTreeMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        Self::from_overrides(&overrides)
    }

    /// Same as [`from_env`](Self::from_env) with an explicit override map.
    pub fn from_overrides(overrides: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in overrides {
            config.apply_override(key, value)?;
        }
        config.normalize();
        config.validate()?;
        tracing::debug!(
            worker_threads = config.worker_threads,
            thread_stack_size = config.thread_stack_size,
            thread_name_prefix = %config.thread_name_prefix,
            "runtime config loaded"
        );
        Ok(config)
    }

    fn apply_override(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "COOPSYNC_WORKER_THREADS" => self.worker_threads = parse_usize(value, key)?,
            "COOPSYNC_THREAD_STACK_SIZE" => self.thread_stack_size = parse_usize(value, key)?,
            "COOPSYNC_THREAD_NAME_PREFIX" => value.clone_into(&mut self.thread_name_prefix),
            _ => return Err(ConfigError::InvalidOverride(key.to_owned())),
        }
        Ok(())
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .max(1)
}

fn parse_usize(value: &str, key: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::Parse(format!("invalid usize for {key}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test;

    fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn defaults_validate() {
        init_test("defaults_validate");
        let config = RuntimeConfig::default();
        crate::assert_with_log!(
            config.validate().is_ok(),
            "defaults are valid",
            true,
            config.validate().is_ok()
        );
        assert!(config.worker_threads >= 1);
        crate::test_complete!("defaults_validate");
    }

    #[test]
    fn normalize_fills_zeroes() {
        let mut config = RuntimeConfig {
            worker_threads: 0,
            thread_stack_size: 0,
            thread_name_prefix: String::new(),
        };
        config.normalize();
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.thread_stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.thread_name_prefix, DEFAULT_NAME_PREFIX);
    }

    #[test]
    fn overrides_apply() {
        init_test("overrides_apply");
        let config = RuntimeConfig::from_overrides(&overrides(&[
            ("COOPSYNC_WORKER_THREADS", "3"),
            ("COOPSYNC_THREAD_NAME_PREFIX", "jobs"),
        ]))
        .expect("valid overrides");
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.thread_name_prefix, "jobs");
        crate::test_complete!("overrides_apply");
    }

    #[test]
    fn bad_overrides_rejected() {
        let err = RuntimeConfig::from_overrides(&overrides(&[("COOPSYNC_WORKER_THREADS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = RuntimeConfig::from_overrides(&overrides(&[("COOPSYNC_WORKERS", "2")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidOverride("COOPSYNC_WORKERS".into()));

        let err = RuntimeConfig::from_overrides(&overrides(&[("COOPSYNC_THREAD_STACK_SIZE", "1024")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::StackTooSmall { actual: 1024, .. }));
    }
}
