//! Construction-time settings for the indexing scheduler.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_MAX_FILE_SIZE, DEFAULT_MEMORY_BUDGET_BYTES, DEFAULT_MEMORY_WAIT_INTERVAL_MS,
    DEFAULT_POLL_INTERVAL_MS, MAX_DEFAULT_WORKERS,
};
use crate::error::{ChunkstoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Ceiling on file bytes held in memory at once (default: 20MB).
    #[serde(default = "default_memory_budget_bytes")]
    pub memory_budget_bytes: u64,
    /// Worker threads per job (default: CPU count, at most 8).
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Apply index values on a dedicated writer thread (default: false).
    #[serde(default)]
    pub write_on_separate_thread: bool,
    /// Files larger than this are skipped (default: 20MB).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// How often the submitting thread checks job completion.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Wait slice while the memory budget is exhausted.
    #[serde(default = "default_memory_wait_interval_ms")]
    pub memory_wait_interval_ms: u64,
}

fn default_memory_budget_bytes() -> u64 {
    DEFAULT_MEMORY_BUDGET_BYTES
}

fn default_worker_threads() -> usize {
    num_cpus::get().clamp(1, MAX_DEFAULT_WORKERS)
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_memory_wait_interval_ms() -> u64 {
    DEFAULT_MEMORY_WAIT_INTERVAL_MS
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: default_memory_budget_bytes(),
            worker_threads: default_worker_threads(),
            write_on_separate_thread: false,
            max_file_size: default_max_file_size(),
            poll_interval_ms: default_poll_interval_ms(),
            memory_wait_interval_ms: default_memory_wait_interval_ms(),
        }
    }
}

impl IndexingConfig {
    pub fn memory_budget_bytes(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn write_on_separate_thread(mut self, enabled: bool) -> Self {
        self.write_on_separate_thread = enabled;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn memory_wait_interval(mut self, interval: Duration) -> Self {
        self.memory_wait_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn memory_wait_duration(&self) -> Duration {
        Duration::from_millis(self.memory_wait_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("memory_budget_bytes", self.memory_budget_bytes == 0),
            ("worker_threads", self.worker_threads == 0),
            ("max_file_size", self.max_file_size == 0),
            ("poll_interval_ms", self.poll_interval_ms == 0),
            ("memory_wait_interval_ms", self.memory_wait_interval_ms == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ChunkstoreError::Config {
                reason: format!("{field} must be greater than zero"),
            });
        }
        Ok(())
    }

    /// Parses JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|err| ChunkstoreError::Config {
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = IndexingConfig::from_json_str(r#"{ "worker_threads": 3 }"#).expect("parse");
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.memory_budget_bytes, 20 * 1024 * 1024);
        assert!(!config.write_on_separate_thread);
        assert_eq!(config.poll_interval_duration(), Duration::from_millis(100));
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = IndexingConfig::default()
            .worker_threads(0)
            .validate()
            .expect_err("zero workers");
        assert!(matches!(err, ChunkstoreError::Config { .. }));
        assert!(IndexingConfig::from_json_str(r#"{ "max_file_size": 0 }"#).is_err());
    }

    #[test]
    fn default_worker_count_is_bounded() {
        let workers = IndexingConfig::default().worker_threads;
        assert!((1..=MAX_DEFAULT_WORKERS).contains(&workers));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("indexing.json");
        std::fs::write(&path, r#"{ "write_on_separate_thread": true }"#).expect("write");
        let config = IndexingConfig::from_path(&path).expect("load");
        assert!(config.write_on_separate_thread);
    }
}
