//! Cooperative control signals shared between a caller and the workers
//! running its job.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ChunkstoreError, Result};

/// Cooperative cancellation flag. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns [`ChunkstoreError::Cancelled`] once [`cancel`](Self::cancel) was called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ChunkstoreError::Cancelled {
                on_worker_thread: false,
            });
        }
        Ok(())
    }
}

/// External pause switch; workers skip a suspended job without blocking others.
#[derive(Debug, Clone, Default)]
pub struct SuspendHandle {
    suspended: Arc<AtomicBool>,
}

impl SuspendHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }
}

/// Receives job progress. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn set_fraction(&self, fraction: f64);

    fn set_text(&self, _text: &str) {}

    fn set_details(&self, _details: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn set_fraction(&self, _fraction: f64) {}
}

/// Owner of a job, e.g. a project. Disposing it stops every job it owns.
#[derive(Debug, Clone)]
pub struct IndexingScope {
    name: Arc<str>,
    disposed: Arc<AtomicBool>,
}

impl IndexingScope {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_cancellation() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(observer.check().is_ok());
        token.cancel();
        assert!(observer.check().expect_err("cancelled").is_cancellation());
    }

    #[test]
    fn suspension_toggles() {
        let handle = SuspendHandle::new();
        handle.suspend();
        assert!(handle.clone().is_suspended());
        handle.resume();
        assert!(!handle.is_suspended());
    }
}
