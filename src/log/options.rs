//! Construction-time options for a [`ValueLog`](super::ValueLog).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::{
    COMPACTION_WINDOW, HARD_MAX_RETAINED_BYTES, SOFT_LIMIT_BLOCK_SIZE, SOFT_MAX_RETAINED_BYTES,
};
use crate::error::{ChunkstoreError, Result};
use crate::io::{CompressionKind, HandleCache};

fn default_window() -> usize {
    COMPACTION_WINDOW
}

fn default_soft_retained() -> u64 {
    SOFT_MAX_RETAINED_BYTES
}

fn default_hard_retained() -> u64 {
    HARD_MAX_RETAINED_BYTES
}

fn default_soft_block() -> usize {
    SOFT_LIMIT_BLOCK_SIZE
}

/// Memory limits applied while compacting chained values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionLimits {
    /// Size of each backward read window.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Retained bytes past which entries larger than `soft_block` are spilled.
    #[serde(default = "default_soft_retained")]
    pub soft_retained: u64,
    /// Retained bytes past which every entry is spilled.
    #[serde(default = "default_hard_retained")]
    pub hard_retained: u64,
    #[serde(default = "default_soft_block")]
    pub soft_block: usize,
}

impl Default for CompactionLimits {
    fn default() -> Self {
        Self {
            window: default_window(),
            soft_retained: default_soft_retained(),
            hard_retained: default_hard_retained(),
            soft_block: default_soft_block(),
        }
    }
}

impl CompactionLimits {
    pub fn validate(&self) -> Result<()> {
        if self.window < crate::constants::MAX_CHUNK_HEADER_LEN * 2 {
            return Err(ChunkstoreError::Config {
                reason: format!("compaction window {} is too small", self.window),
            });
        }
        if self.soft_retained > self.hard_retained {
            return Err(ChunkstoreError::Config {
                reason: "soft retained limit exceeds hard limit".into(),
            });
        }
        Ok(())
    }
}

/// How a value log is opened. Fixed for the lifetime of the instance.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub read_only: bool,
    /// Every value is a single chunk and no backlink is stored.
    pub headerless: bool,
    pub compression: Option<CompressionKind>,
    pub compaction: CompactionLimits,
    /// Handle pool to use; the process-wide pool when unset.
    pub handles: Option<Arc<HandleCache>>,
}

impl LogOptions {
    #[must_use]
    pub fn builder() -> LogOptionsBuilder {
        LogOptionsBuilder::default()
    }

    /// On-disk format version implied by these options.
    #[must_use]
    pub fn format_version(&self) -> u32 {
        let headerless = if self.headerless { 10 } else { 0 };
        let compressed = if self.compression.is_some() { 0x13 } else { 0 };
        headerless * 31 + compressed
    }

    pub(crate) fn handle_cache(&self) -> Arc<HandleCache> {
        self.handles.clone().unwrap_or_else(HandleCache::global)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogOptionsBuilder {
    inner: LogOptions,
}

impl LogOptionsBuilder {
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.inner.read_only = read_only;
        self
    }

    pub fn headerless(mut self, headerless: bool) -> Self {
        self.inner.headerless = headerless;
        self
    }

    pub fn compression(mut self, kind: CompressionKind) -> Self {
        self.inner.compression = Some(kind);
        self
    }

    pub fn compaction(mut self, limits: CompactionLimits) -> Self {
        self.inner.compaction = limits;
        self
    }

    pub fn handles(mut self, handles: Arc<HandleCache>) -> Self {
        self.inner.handles = Some(handles);
        self
    }

    #[must_use]
    pub fn build(self) -> LogOptions {
        self.inner
    }
}
