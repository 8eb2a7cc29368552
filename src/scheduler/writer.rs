//! Dedicated thread applying index values in submission order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::{ChunkstoreError, Result};

use super::source::IndexApplier;

type Completion = Box<dyn FnOnce(Result<()>) + Send>;

enum WriteTask {
    Apply {
        applier: Box<dyn IndexApplier>,
        done: Completion,
    },
    Barrier(Sender<()>),
}

#[derive(Debug, Default)]
struct WriterStats {
    applied: AtomicU64,
    failed: AtomicU64,
}

/// Single writer thread fed through an unbounded channel.
pub struct IndexWriteExecutor {
    sender: Option<Sender<WriteTask>>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<WriterStats>,
}

impl std::fmt::Debug for IndexWriteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriteExecutor")
            .field("applied", &self.stats.applied.load(Ordering::Relaxed))
            .field("failed", &self.stats.failed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl IndexWriteExecutor {
    pub fn start() -> Result<Self> {
        let (sender, receiver) = unbounded();
        let stats = Arc::new(WriterStats::default());
        let thread_stats = Arc::clone(&stats);
        let thread = std::thread::Builder::new()
            .name("chunkstore-index-writer".into())
            .spawn(move || write_loop(&receiver, &thread_stats))?;
        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
            stats,
        })
    }

    /// Queues `applier`; `done` runs on the writer thread with its outcome.
    pub fn submit(
        &self,
        applier: Box<dyn IndexApplier>,
        done: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        self.sender()?
            .send(WriteTask::Apply {
                applier,
                done: Box::new(done),
            })
            .map_err(|_| writer_gone())
    }

    /// Blocks until every task submitted before this call has run.
    pub fn barrier(&self) -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.sender()?
            .send(WriteTask::Barrier(tx))
            .map_err(|_| writer_gone())?;
        rx.recv().map_err(|_| writer_gone())
    }

    #[must_use]
    pub fn applied(&self) -> u64 {
        self.stats.applied.load(Ordering::Relaxed)
    }

    fn sender(&self) -> Result<&Sender<WriteTask>> {
        self.sender.as_ref().ok_or_else(writer_gone)
    }
}

fn writer_gone() -> ChunkstoreError {
    ChunkstoreError::InvalidState {
        reason: "index writer thread is not running".into(),
    }
}

fn write_loop(receiver: &Receiver<WriteTask>, stats: &WriterStats) {
    while let Ok(task) = receiver.recv() {
        match task {
            WriteTask::Apply { applier, done } => {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| applier.apply()))
                    .unwrap_or_else(|panic| {
                        Err(ChunkstoreError::UnexpectedFailure {
                            reason: panic_message(panic.as_ref()),
                        })
                    });
                if outcome.is_ok() {
                    stats.applied.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                }
                done(outcome);
            }
            WriteTask::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

impl Drop for IndexWriteExecutor {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("index writer thread panicked during shutdown");
            }
        }
    }
}
