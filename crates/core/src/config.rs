use std::env;

use serde::{Deserialize, Serialize};

use crate::error::QuiverError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn parsed_or<F>(lookup: &F, key: &str, default: usize) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|s| !s.is_empty())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Dispatch queue sizing.
///
/// Read once when the dispatch queue is created; later changes have no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuiverConfig {
    /// Capacity of the pending queue. Submitting past it suspends the caller.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Maximum number of tasks running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_queue_size() -> usize { 8192 }
fn default_max_concurrent() -> usize { 2048 }

impl Default for QuiverConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl QuiverConfig {
    /// Build config from `QUIVER_QUEUE_SIZE` / `QUIVER_MAX_CONCURRENT`
    /// (call `load_dotenv()` first). Unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            queue_size: parsed_or(&lookup, "QUIVER_QUEUE_SIZE", default_queue_size()),
            max_concurrent: parsed_or(&lookup, "QUIVER_MAX_CONCURRENT", default_max_concurrent()),
        }
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn validate(&self) -> Result<(), QuiverError> {
        if self.queue_size == 0 {
            return Err(QuiverError::InvalidConfig("queue_size must be > 0".into()));
        }
        if self.max_concurrent == 0 {
            return Err(QuiverError::InvalidConfig("max_concurrent must be > 0".into()));
        }
        Ok(())
    }

    pub fn log_summary(&self) {
        tracing::info!(
            queue_size = self.queue_size,
            max_concurrent = self.max_concurrent,
            "quiver config loaded"
        );
    }
}
