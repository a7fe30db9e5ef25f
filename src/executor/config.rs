//! Executor and queue configuration.
//!
//! All knobs are constructor-time and immutable afterwards. A config can be
//! built in code or parsed from a TOML document:
//!
//! ```toml
//! worker_threads = 8
//! quantum_millis = 1000
//!
//! [queue]
//! level_absolute_priority = false
//! level_time_multiplier = 2.0
//! ```

use serde::Deserialize;
use std::time::Duration;

/// Selection-policy knobs for [`MultilevelSplitQueue`](crate::MultilevelSplitQueue).
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Strictly drain lower levels before higher ones instead of balancing
    /// scheduled time.
    pub level_absolute_priority: bool,

    /// Target scheduled-time ratio between adjacent levels. Meaningful above
    /// 1.0; smaller values degenerate the selection and are not rejected.
    pub level_time_multiplier: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            level_absolute_priority: false,
            level_time_multiplier: 2.0,
        }
    }
}

/// Configuration for [`SplitThreadPool`](crate::SplitThreadPool).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of worker threads pulling from the queue.
    pub worker_threads: usize,

    /// Quantum budget handed to a split per dispatch, in milliseconds.
    pub quantum_millis: u64,

    /// Queue selection policy.
    pub queue: QueueConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            worker_threads: num_cpus::get(),
            quantum_millis: 1_000,
            queue: QueueConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Parse a TOML configuration document. Missing keys fall back to the
    /// defaults.
    pub fn parse_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn quantum(&self) -> Duration {
        Duration::from_millis(self.quantum_millis)
    }
}
