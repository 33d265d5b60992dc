//! Configuration types for anvilq.
//!
//! This module contains all configuration structures used throughout anvilq,
//! including per-queue dispatch settings, registry recycling cadence and
//! logging.

use crate::error::{AnvilError, AnvilResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for anvilq.
///
/// # Examples
///
/// ```rust
/// use anvilq::config::*;
///
/// // Use default configuration
/// let config = AnvilConfig::default();
///
/// // Custom configuration
/// let config = AnvilConfig {
///     registry: RegistryConfig {
///         recycle_interval_secs: 300,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnvilConfig {
    /// Keyed registry configuration
    pub registry: RegistryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// How a queue runs its action for each item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Run the action on the engine itself; the next item waits for this one
    #[default]
    Inline,
    /// Run the action as a task on the shared runtime pool
    Pooled,
    /// Run the action on its own blocking thread
    Dedicated,
}

/// Configuration for a single work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueConfig {
    /// Stop the engine when the queue drains, restart it on the next enqueue
    pub reclaim: bool,

    /// Dispatch mode for the action
    pub dispatch_mode: DispatchMode,

    /// Maximum number of concurrent dispatches (clamped to `concurrency_ceiling`)
    pub max_concurrency: usize,

    /// Upper bound for `max_concurrency`
    pub concurrency_ceiling: usize,

    /// How long `start` waits for a previous engine to retire (in milliseconds)
    pub retire_timeout_ms: u64,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            reclaim: false,
            dispatch_mode: DispatchMode::Inline,
            max_concurrency: cpus,
            concurrency_ceiling: cpus * 4,
            retire_timeout_ms: 5000, // 5 seconds
        }
    }
}

impl WorkQueueConfig {
    /// Enable or disable reclaim.
    pub fn with_reclaim(mut self, reclaim: bool) -> Self {
        self.reclaim = reclaim;
        self
    }

    /// Set the dispatch mode.
    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Set the maximum number of concurrent dispatches.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set the concurrency ceiling.
    pub fn with_concurrency_ceiling(mut self, ceiling: usize) -> Self {
        self.concurrency_ceiling = ceiling;
        self
    }

    /// Set the retire timeout.
    pub fn with_retire_timeout(mut self, timeout_ms: u64) -> Self {
        self.retire_timeout_ms = timeout_ms;
        self
    }

    /// Concurrency actually applied: `max_concurrency` clamped to the ceiling.
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.min(self.concurrency_ceiling)
    }

    /// Retire timeout as a `Duration`.
    pub fn retire_timeout(&self) -> Duration {
        self.retire_timeout_ms.millis()
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_concurrency == 0 {
            errors.push("Max concurrency must be greater than 0".to_string());
        }

        if self.concurrency_ceiling == 0 {
            errors.push("Concurrency ceiling must be greater than 0".to_string());
        }

        if self.retire_timeout_ms == 0 {
            errors.push("Retire timeout must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration for a keyed queue registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Template for per-key queues. Reclaim and inline dispatch are always
    /// applied on top of it.
    pub queue: WorkQueueConfig,

    /// Delay before the first recycle pass (in seconds)
    pub recycle_warmup_secs: u64,

    /// Interval between recycle passes (in seconds)
    pub recycle_interval_secs: u64,

    /// Separator between registry name and key in per-key queue names
    pub key_separator: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            queue: WorkQueueConfig::default(),
            recycle_warmup_secs: 60,     // 1 minute
            recycle_interval_secs: 1800, // 30 minutes
            key_separator: "/".to_string(),
        }
    }
}

impl RegistryConfig {
    /// Set the recycle cadence.
    pub fn with_recycle(mut self, warmup_secs: u64, interval_secs: u64) -> Self {
        self.recycle_warmup_secs = warmup_secs;
        self.recycle_interval_secs = interval_secs;
        self
    }

    /// Set the per-key queue template.
    pub fn with_queue(mut self, queue: WorkQueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Queue configuration applied to every per-key queue.
    pub fn member_queue_config(&self) -> WorkQueueConfig {
        self.queue
            .clone()
            .with_reclaim(true)
            .with_dispatch_mode(DispatchMode::Inline)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = match self.queue.validate() {
            Ok(()) => Vec::new(),
            Err(errors) => errors,
        };

        if self.recycle_interval_secs == 0 {
            errors.push("Recycle interval must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include timestamps in logs
    pub include_timestamps: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_timestamps: true,
            include_targets: false,
        }
    }
}

impl LoggingConfig {
    /// Install a global `tracing` subscriber built from this configuration.
    pub fn init(&self) -> AnvilResult<()> {
        let level: tracing::Level = self.level.clone().into();
        let builder = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(self.include_targets);

        let result = match (self.json_format, self.include_timestamps) {
            (true, true) => builder.json().try_init(),
            (true, false) => builder.json().without_time().try_init(),
            (false, true) => builder.with_ansi(self.colored).try_init(),
            (false, false) => builder.with_ansi(self.colored).without_time().try_init(),
        };

        result.map_err(|e| AnvilError::config(format!("Failed to install logger: {}", e)))
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Helper trait for converting durations in configuration.
pub trait DurationExt {
    /// Convert seconds to Duration
    fn secs(self) -> Duration;
    /// Convert milliseconds to Duration
    fn millis(self) -> Duration;
}

impl DurationExt for u64 {
    fn secs(self) -> Duration {
        Duration::from_secs(self)
    }

    fn millis(self) -> Duration {
        Duration::from_millis(self)
    }
}

impl AnvilConfig {
    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> AnvilResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config
            .validate()
            .map_err(|errors| AnvilError::config(errors.join("; ")))?;
        Ok(config)
    }

    /// Create a configuration for development.
    pub fn development() -> Self {
        Self {
            registry: RegistryConfig {
                queue: WorkQueueConfig {
                    max_concurrency: 2,
                    ..Default::default()
                },
                recycle_warmup_secs: 10,
                recycle_interval_secs: 60,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Create a configuration for production.
    pub fn production() -> Self {
        Self {
            registry: RegistryConfig {
                queue: WorkQueueConfig {
                    retire_timeout_ms: 30_000,
                    ..Default::default()
                },
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_timestamps: true,
                include_targets: false,
            },
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            registry: RegistryConfig {
                queue: WorkQueueConfig {
                    max_concurrency: 1,
                    concurrency_ceiling: 4,
                    retire_timeout_ms: 1000,
                    ..Default::default()
                },
                recycle_warmup_secs: 1,
                recycle_interval_secs: 1,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_timestamps: false,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        self.registry.validate()
    }
}
