//! Per-job bookkeeping and the process-wide list of active jobs.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::{ChunkstoreError, Result};

use super::control::{CancellationToken, IndexingScope, ProgressSink, SuspendHandle};
use super::source::{FileId, FileSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Outcome summary of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub state: JobState,
    pub total_files: u32,
    pub processed: u32,
    pub remaining: u32,
    pub oversized: u32,
    pub failed_loads: u32,
    pub elapsed: Duration,
}

/// One queued file and the set that contributed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileTask {
    pub file: FileId,
    pub set: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// A deduplicated queue of files plus the signals controlling it.
pub struct IndexingJob {
    id: u64,
    scope: IndexingScope,
    file_sets: Vec<FileSet>,
    queue: Mutex<VecDeque<FileTask>>,
    total_files: u32,
    remaining: Mutex<u32>,
    all_processed: Condvar,
    no_more_files: AtomicBool,
    error: Mutex<Option<RecordedError>>,
    state: Mutex<JobState>,
    cancel: CancellationToken,
    suspend: SuspendHandle,
    progress: Arc<dyn ProgressSink>,
    last_text_set: AtomicUsize,
    exclusive: bool,
    oversized: AtomicU32,
    failed_loads: AtomicU32,
}

impl std::fmt::Debug for IndexingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingJob")
            .field("id", &self.id)
            .field("scope", &self.scope.name())
            .field("total_files", &self.total_files)
            .field("remaining", &self.remaining())
            .finish_non_exhaustive()
    }
}

impl IndexingJob {
    pub(crate) fn new(
        scope: IndexingScope,
        file_sets: Vec<FileSet>,
        cancel: CancellationToken,
        suspend: SuspendHandle,
        progress: Arc<dyn ProgressSink>,
        exclusive: bool,
    ) -> Self {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        for (set, file_set) in file_sets.iter().enumerate() {
            for &file in &file_set.files {
                if seen.insert(file) {
                    queue.push_back(FileTask { file, set });
                }
            }
        }
        let total_files = u32::try_from(queue.len()).unwrap_or(u32::MAX);
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            scope,
            file_sets,
            queue: Mutex::new(queue),
            total_files,
            remaining: Mutex::new(total_files),
            all_processed: Condvar::new(),
            no_more_files: AtomicBool::new(false),
            error: Mutex::new(None),
            state: Mutex::new(JobState::Queued),
            cancel,
            suspend,
            progress,
            last_text_set: AtomicUsize::new(usize::MAX),
            exclusive,
            oversized: AtomicU32::new(0),
            failed_loads: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn scope(&self) -> &IndexingScope {
        &self.scope
    }

    #[must_use]
    pub fn total_files(&self) -> u32 {
        self.total_files
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        *lock(&self.remaining)
    }

    /// Whether the job runs entirely on the submitting thread.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    #[must_use]
    pub fn state(&self) -> JobState {
        *lock(&self.state)
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn suspension(&self) -> &SuspendHandle {
        &self.suspend
    }

    /// Files still waiting in the queue, in pop order.
    #[must_use]
    pub fn pending_files(&self) -> Vec<FileId> {
        lock(&self.queue).iter().map(|task| task.file).collect()
    }

    pub(crate) fn set_state(&self, state: JobState) {
        *lock(&self.state) = state;
    }

    pub(crate) fn pop_file(&self) -> Option<FileTask> {
        let task = lock(&self.queue).pop_front();
        if task.is_none() {
            self.no_more_files.store(true, Ordering::Release);
        }
        task
    }

    /// Puts an unprocessed file back; the remaining count is left untouched.
    pub(crate) fn requeue(&self, task: FileTask) {
        lock(&self.queue).push_back(task);
        self.no_more_files.store(false, Ordering::Release);
    }

    #[must_use]
    pub(crate) fn has_queued_files(&self) -> bool {
        !lock(&self.queue).is_empty()
    }

    pub(crate) fn no_more_files(&self) -> bool {
        self.no_more_files.load(Ordering::Acquire)
    }

    pub(crate) fn file_processed(&self) {
        let remaining = {
            let mut remaining = lock(&self.remaining);
            debug_assert!(*remaining > 0, "more files processed than queued");
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.all_processed.notify_all();
            }
            *remaining
        };
        if self.total_files > 0 {
            self.progress
                .set_fraction(1.0 - f64::from(remaining) / f64::from(self.total_files));
        }
    }

    pub(crate) fn file_oversized(&self) {
        self.oversized.fetch_add(1, Ordering::Relaxed);
        self.file_processed();
    }

    pub(crate) fn file_failed_to_load(&self) {
        self.failed_loads.fetch_add(1, Ordering::Relaxed);
        self.file_processed();
    }

    #[must_use]
    pub fn all_files_processed(&self) -> bool {
        self.remaining() == 0
    }

    /// Waits up to `timeout` for the last file; returns whether all are done.
    pub(crate) fn wait_all_processed(&self, timeout: Duration) -> bool {
        let remaining = lock(&self.remaining);
        if *remaining == 0 {
            return true;
        }
        let (remaining, _) = self
            .all_processed
            .wait_timeout(remaining, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        *remaining == 0
    }

    /// Stores `error` unless an earlier one is already recorded.
    pub(crate) fn record_error(&self, error: ChunkstoreError) -> bool {
        self.store_error(error, false)
    }

    /// Same as [`record_error`](Self::record_error) for failures raised on a
    /// worker or writer thread.
    pub(crate) fn record_worker_error(&self, error: ChunkstoreError) -> bool {
        self.store_error(error, true)
    }

    fn store_error(&self, error: ChunkstoreError, on_worker_thread: bool) -> bool {
        let mut slot = lock(&self.error);
        if slot.is_some() {
            tracing::debug!(job.id = self.id, error = %error, "dropping secondary job failure");
            return false;
        }
        *slot = Some(RecordedError {
            error,
            on_worker_thread,
        });
        drop(slot);
        // wake the submitting thread early
        let _guard = lock(&self.remaining);
        self.all_processed.notify_all();
        true
    }

    #[must_use]
    pub(crate) fn has_error(&self) -> bool {
        lock(&self.error).is_some()
    }

    pub(crate) fn take_error(&self) -> Option<RecordedError> {
        lock(&self.error).take()
    }

    /// Workers drop a job from the active list once this is false.
    pub(crate) fn accepts_work(&self) -> bool {
        !self.scope.is_disposed()
            && !self.no_more_files()
            && !self.cancel.is_cancelled()
            && !self.has_error()
    }

    pub(crate) fn announce(&self, task: FileTask, location: &str) {
        if self.last_text_set.swap(task.set, Ordering::AcqRel) != task.set {
            if let Some(text) = &self.file_sets[task.set].progress_text {
                self.progress.set_text(text);
            }
        }
        self.progress.set_details(location);
    }

    pub(crate) fn report(&self, elapsed: Duration) -> JobReport {
        let remaining = self.remaining();
        JobReport {
            state: self.state(),
            total_files: self.total_files,
            processed: self.total_files - remaining,
            remaining,
            oversized: self.oversized.load(Ordering::Relaxed),
            failed_loads: self.failed_loads.load(Ordering::Relaxed),
            elapsed,
        }
    }
}

/// First failure of a job and the kind of thread that raised it.
#[derive(Debug)]
pub(crate) struct RecordedError {
    pub error: ChunkstoreError,
    pub on_worker_thread: bool,
}

/// Processes files of jobs found in a [`JobRegistry`].
pub(crate) trait FileWorker: Send + Sync {
    /// Returns `false` when no file was handled, either because the queue was
    /// empty or because the file popped is held by another job.
    fn index_one_file(&self, job: &Arc<IndexingJob>) -> Result<bool>;

    /// Pause after a pass over every job that handled no file.
    fn idle_backoff(&self) -> Duration;
}

/// A published job together with whatever knows how to process its files.
#[derive(Clone)]
pub(crate) struct RegisteredJob {
    pub job: Arc<IndexingJob>,
    pub worker: Arc<dyn FileWorker>,
}

/// Copy-on-write list of active jobs plus the set of files being processed.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<Arc<Vec<RegisteredJob>>>,
    locked_files: Mutex<HashSet<FileId>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.len())
            .field("locked_files", &lock(&self.locked_files).len())
            .finish()
    }
}

static GLOBAL_REGISTRY: Lazy<Arc<JobRegistry>> = Lazy::new(|| Arc::new(JobRegistry::default()));

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Current entries; the snapshot is unaffected by later changes.
    pub(crate) fn snapshot(&self) -> Arc<Vec<RegisteredJob>> {
        Arc::clone(&self.jobs.read().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn jobs(&self) -> Vec<Arc<IndexingJob>> {
        self.snapshot().iter().map(|entry| Arc::clone(&entry.job)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.snapshot().iter().any(|entry| entry.job.id == id)
    }

    pub(crate) fn add(&self, entry: RegisteredJob) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.iter().any(|existing| existing.job.id == entry.job.id) {
            return;
        }
        let mut next = Vec::with_capacity(jobs.len() + 1);
        next.extend(jobs.iter().cloned());
        next.push(entry);
        *jobs = Arc::new(next);
    }

    pub(crate) fn remove(&self, id: u64) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.iter().any(|entry| entry.job.id == id) {
            *jobs = Arc::new(jobs.iter().filter(|entry| entry.job.id != id).cloned().collect());
        }
    }

    /// Claims `file` for the caller unless another job is processing it.
    pub(crate) fn try_lock_file(self: &Arc<Self>, file: FileId) -> Option<FileLock> {
        if lock(&self.locked_files).insert(file) {
            Some(FileLock {
                registry: Arc::clone(self),
                file,
            })
        } else {
            None
        }
    }
}

/// Exclusive claim on one file; released on drop.
#[derive(Debug)]
pub(crate) struct FileLock {
    registry: Arc<JobRegistry>,
    file: FileId,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        lock(&self.registry.locked_files).remove(&self.file);
    }
}
