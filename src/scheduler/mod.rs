//! Drives file sets through a [`ContentIndexer`] on a pool of worker threads.
//!
//! Jobs are published to a shared [`JobRegistry`]; every worker walks the
//! active jobs round-robin and takes one file per visit so no job can starve
//! the others. File bytes are admitted against a [`MemoryBudget`] before they
//! are loaded. Cancellation is cooperative: a file interrupted between
//! admission and write goes back to its queue unprocessed.

pub mod budget;
pub mod control;
pub mod job;
pub mod source;
pub mod writer;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::config::IndexingConfig;
use crate::constants::{DEFAULT_MEMORY_BUDGET_BYTES, INDEXING_TRACE_PERIOD};
use crate::error::{ChunkstoreError, Result};

pub use budget::{BudgetStats, MemoryBudget, MemoryPermit};
pub use control::{CancellationToken, IndexingScope, NoopProgress, ProgressSink, SuspendHandle};
pub use job::{IndexingJob, JobRegistry, JobReport, JobState};
pub use source::{
    ContentError, ContentErrorKind, ContentIndexer, ContentSource, ContentType, FileContent,
    FileId, FileSet, IndexApplier, MemoryContentSource,
};
pub use writer::IndexWriteExecutor;

use job::{FileLock, FileTask, FileWorker, RecordedError, RegisteredJob};
use writer::panic_message;

/// What to index and under which controls.
pub struct JobRequest {
    scope: IndexingScope,
    file_sets: Vec<FileSet>,
    cancel: CancellationToken,
    suspend: SuspendHandle,
    progress: Arc<dyn ProgressSink>,
    exclusive: bool,
}

impl std::fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRequest")
            .field("scope", &self.scope.name())
            .field("file_sets", &self.file_sets.len())
            .field("exclusive", &self.exclusive)
            .finish_non_exhaustive()
    }
}

impl JobRequest {
    pub fn new(scope: IndexingScope, file_sets: Vec<FileSet>) -> Self {
        Self {
            scope,
            file_sets,
            cancel: CancellationToken::new(),
            suspend: SuspendHandle::new(),
            progress: Arc::new(NoopProgress),
            exclusive: false,
        }
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn suspension(mut self, handle: SuspendHandle) -> Self {
        self.suspend = handle;
        self
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Run every file on the calling thread, e.g. while it holds a
    /// capability that cannot be shared with workers.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

#[derive(Debug, Default)]
struct IndexingCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
}

/// State a worker needs to process a file of some job.
struct FileProcessor {
    config: IndexingConfig,
    source: Arc<dyn ContentSource>,
    indexer: Arc<dyn ContentIndexer>,
    budget: Arc<MemoryBudget>,
    registry: Arc<JobRegistry>,
    writer: Option<IndexWriteExecutor>,
    counters: IndexingCounters,
}

pub struct IndexingScheduler {
    processor: Arc<FileProcessor>,
}

impl std::fmt::Debug for IndexingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingScheduler")
            .field("config", &self.processor.config)
            .field("budget", &self.processor.budget.stats())
            .finish_non_exhaustive()
    }
}

pub struct IndexingSchedulerBuilder {
    config: IndexingConfig,
    source: Arc<dyn ContentSource>,
    indexer: Arc<dyn ContentIndexer>,
    budget: Option<Arc<MemoryBudget>>,
    registry: Option<Arc<JobRegistry>>,
}

impl IndexingSchedulerBuilder {
    pub fn config(mut self, config: IndexingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn budget(mut self, budget: Arc<MemoryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn registry(mut self, registry: Arc<JobRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validates the configuration and starts the writer thread if enabled.
    ///
    /// Without an explicit budget the process-wide one is shared, unless the
    /// configured limit differs from the default.
    pub fn build(self) -> Result<IndexingScheduler> {
        self.config.validate()?;
        let budget = match self.budget {
            Some(budget) => budget,
            None if self.config.memory_budget_bytes == DEFAULT_MEMORY_BUDGET_BYTES => {
                MemoryBudget::global()
            }
            None => Arc::new(MemoryBudget::new(self.config.memory_budget_bytes)),
        };
        let writer = if self.config.write_on_separate_thread {
            Some(IndexWriteExecutor::start()?)
        } else {
            None
        };
        Ok(IndexingScheduler {
            processor: Arc::new(FileProcessor {
                config: self.config,
                source: self.source,
                indexer: self.indexer,
                budget,
                registry: self.registry.unwrap_or_else(JobRegistry::global),
                writer,
                counters: IndexingCounters::default(),
            }),
        })
    }
}

impl IndexingScheduler {
    pub fn builder(
        source: Arc<dyn ContentSource>,
        indexer: Arc<dyn ContentIndexer>,
    ) -> IndexingSchedulerBuilder {
        IndexingSchedulerBuilder {
            config: IndexingConfig::default(),
            source,
            indexer,
            budget: None,
            registry: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &IndexingConfig {
        &self.processor.config
    }

    #[must_use]
    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.processor.budget
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.processor.registry
    }

    /// (attempted, indexed) file counts since construction.
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        (
            self.processor.counters.attempts.load(Ordering::Relaxed),
            self.processor.counters.successes.load(Ordering::Relaxed),
        )
    }

    /// Builds the deduplicated job for `request` without running it.
    #[must_use]
    pub fn prepare(&self, request: JobRequest) -> Arc<IndexingJob> {
        Arc::new(IndexingJob::new(
            request.scope,
            request.file_sets,
            request.cancel,
            request.suspend,
            request.progress,
            request.exclusive,
        ))
    }

    /// Indexes every file of `request` and waits for the outcome.
    pub fn index_files(&self, request: JobRequest) -> Result<JobReport> {
        self.run(&self.prepare(request))
    }

    /// Runs a prepared job to completion, cancellation or failure.
    ///
    /// A disposed scope ends the job early with state [`JobState::Cancelled`]
    /// and an `Ok` report.
    pub fn run(&self, job: &Arc<IndexingJob>) -> Result<JobReport> {
        let exclusive = job.is_exclusive();
        let started = Instant::now();
        if job.total_files() == 0 {
            job.set_state(JobState::Completed);
            return Ok(job.report(started.elapsed()));
        }
        if let Err(err) = job.cancellation().check() {
            job.set_state(JobState::Cancelled);
            return Err(err);
        }
        job.set_state(JobState::Running);
        tracing::debug!(
            job.id = job.id(),
            job.scope = job.scope().name(),
            job.files = job.total_files(),
            job.exclusive = exclusive,
            "indexing job started"
        );

        if exclusive {
            self.run_on_current_thread(job);
        } else {
            self.run_on_workers(job)?;
        }

        if let Some(writer) = &self.processor.writer {
            if let Err(err) = writer.barrier() {
                job.record_error(err);
            }
        }
        self.finish(job, started)
    }

    fn run_on_current_thread(&self, job: &Arc<IndexingJob>) {
        let poll = self.processor.config.poll_interval_duration();
        while !job.all_files_processed() && !job.scope().is_disposed() && !job.has_error() {
            if let Err(err) = job.cancellation().check() {
                job.record_error(err);
                break;
            }
            if !job.has_queued_files() {
                // last files are still being written elsewhere
                job.wait_all_processed(poll);
                continue;
            }
            match self.processor.index_one_file(job) {
                Ok(true) => {}
                // file held by another job
                Ok(false) => {
                    job.wait_all_processed(poll);
                }
                Err(err) => {
                    job.record_error(err);
                }
            }
        }
    }

    fn run_on_workers(&self, job: &Arc<IndexingJob>) -> Result<()> {
        let entry = RegisteredJob {
            job: Arc::clone(job),
            worker: Arc::clone(&self.processor) as Arc<dyn FileWorker>,
        };
        let registry = &self.processor.registry;
        registry.add(entry.clone());
        let running = Arc::new(AtomicUsize::new(0));
        let outcome = self.wait_for_workers(&entry, &running);
        registry.remove(job.id());
        outcome
    }

    /// Polls until the job finishes, fails, is cancelled or its scope goes
    /// away, topping up workers that have exited in the meantime.
    fn wait_for_workers(&self, entry: &RegisteredJob, running: &Arc<AtomicUsize>) -> Result<()> {
        let job = &entry.job;
        let registry = &self.processor.registry;
        let wanted = self.processor.config.worker_threads;
        let poll = self.processor.config.poll_interval_duration();
        loop {
            if job.scope().is_disposed() || job.all_files_processed() || job.has_error() {
                return Ok(());
            }
            if let Err(err) = job.cancellation().check() {
                job.record_error(err);
                return Ok(());
            }
            // files put back after a worker dropped the job need it listed again
            if job.has_queued_files() && !registry.contains(job.id()) {
                registry.add(entry.clone());
            }
            let alive = running.load(Ordering::Acquire);
            for _ in alive..wanted {
                self.spawn_worker(running)?;
            }
            if job.wait_all_processed(poll) {
                return Ok(());
            }
        }
    }

    fn spawn_worker(&self, running: &Arc<AtomicUsize>) -> Result<()> {
        let ordinal = running.fetch_add(1, Ordering::AcqRel);
        let guard = WorkerGuard(Arc::clone(running));
        let registry = Arc::clone(&self.processor.registry);
        std::thread::Builder::new()
            .name(format!("chunkstore-indexer-{ordinal}"))
            .spawn(move || {
                let _guard = guard;
                index_jobs_fairly(&registry);
            })?;
        Ok(())
    }

    fn finish(&self, job: &Arc<IndexingJob>, started: Instant) -> Result<JobReport> {
        let elapsed = started.elapsed();
        match job.take_error() {
            Some(RecordedError { error: err, .. }) if err.is_cancellation() => {
                job.set_state(JobState::Cancelled);
                tracing::debug!(job.id = job.id(), job.remaining = job.remaining(), "indexing job cancelled");
                Err(err)
            }
            Some(RecordedError {
                error: err,
                on_worker_thread,
            }) => {
                job.set_state(JobState::Failed);
                tracing::error!(
                    job.id = job.id(),
                    job.scope = job.scope().name(),
                    job.on_worker_thread = on_worker_thread,
                    error = %err,
                    "indexing job failed"
                );
                Err(ChunkstoreError::IndexingFailed {
                    scope: job.scope().name().to_string(),
                    on_worker_thread,
                    source: Box::new(err),
                })
            }
            None if job.all_files_processed() => {
                job.set_state(JobState::Completed);
                let report = job.report(elapsed);
                tracing::debug!(
                    job.id = job.id(),
                    job.files = report.total_files,
                    job.oversized = report.oversized,
                    job.failed_loads = report.failed_loads,
                    job.elapsed_ms = elapsed.as_millis() as u64,
                    "indexing job completed"
                );
                Ok(report)
            }
            None => {
                job.set_state(JobState::Cancelled);
                tracing::info!(job.id = job.id(), job.scope = job.scope().name(), "indexing scope disposed");
                Ok(job.report(elapsed))
            }
        }
    }
}

struct WorkerGuard(Arc<AtomicUsize>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Takes one file from each runnable job in turn until the registry is
/// empty or every remaining job is suspended. Never returns an error:
/// failures land in the job's error slot.
///
/// A pass that handles no file sleeps for the shortest idle backoff among
/// the jobs it visited before trying again.
fn index_jobs_fairly(registry: &JobRegistry) {
    loop {
        let jobs = registry.snapshot();
        if jobs.is_empty() {
            break;
        }
        let mut all_suspended = true;
        let mut progressed = false;
        let mut backoff: Option<Duration> = None;
        for entry in jobs.iter() {
            let job = &entry.job;
            if !job.accepts_work() {
                registry.remove(job.id());
                all_suspended = false;
                progressed = true;
                continue;
            }
            if job.suspension().is_suspended() {
                continue;
            }
            all_suspended = false;
            let idle = entry.worker.idle_backoff();
            backoff = Some(backoff.map_or(idle, |current| current.min(idle)));
            let outcome = catch_unwind(AssertUnwindSafe(|| entry.worker.index_one_file(job)));
            let failure = match outcome {
                Ok(Ok(handled)) => {
                    progressed |= handled;
                    None
                }
                Ok(Err(err)) if err.is_cancellation() => Some(ChunkstoreError::Cancelled {
                    on_worker_thread: true,
                }),
                Ok(Err(err)) => Some(err),
                Err(panic) => Some(ChunkstoreError::UnexpectedFailure {
                    reason: panic_message(panic.as_ref()),
                }),
            };
            if let Some(err) = failure {
                job.record_worker_error(err);
                registry.remove(job.id());
                progressed = true;
            }
        }
        if all_suspended {
            break;
        }
        if let (false, Some(pause)) = (progressed, backoff) {
            std::thread::sleep(pause);
        }
    }
}

impl FileWorker for FileProcessor {
    /// Processes the next queued file of `job`, if any.
    ///
    /// File-level problems are logged and the file counted as processed.
    /// Cancellation puts the file back and is returned; any other error is a
    /// job failure.
    fn index_one_file(&self, job: &Arc<IndexingJob>) -> Result<bool> {
        let Some(task) = job.pop_file() else {
            return Ok(false);
        };
        let Some(file_lock) = self.registry.try_lock_file(task.file) else {
            job.requeue(task);
            return Ok(false);
        };
        match self.process(job, task, file_lock) {
            Ok(()) => Ok(true),
            Err(err) if err.is_cancellation() => {
                job.requeue(task);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn idle_backoff(&self) -> Duration {
        self.config.poll_interval_duration()
    }
}

impl FileProcessor {
    fn process(&self, job: &Arc<IndexingJob>, task: FileTask, file_lock: FileLock) -> Result<()> {
        let file = task.file;
        let length = match self.source.length(file) {
            Ok(length) => length,
            Err(err) => {
                self.log_failed_load(file, err);
                job.file_failed_to_load();
                return Ok(());
            }
        };
        if length > self.config.max_file_size {
            let err = ChunkstoreError::OversizedContent {
                file,
                length,
                limit: self.config.max_file_size,
            };
            tracing::info!(file.location = %self.source.describe(file), error = %err, "skipping file");
            job.file_oversized();
            return Ok(());
        }

        let permit = self
            .budget
            .acquire(length, self.config.memory_wait_duration(), job.cancellation())?;
        let bytes = match self.source.load(file) {
            Ok(bytes) => bytes,
            Err(err) => {
                drop(permit);
                self.log_failed_load(file, err);
                job.file_failed_to_load();
                return Ok(());
            }
        };
        let content = FileContent::new(file, bytes);
        job.announce(task, &self.source.describe(file));

        job.cancellation().check()?;
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let applier = match self.indexer.index(&content) {
            Ok(applier) => applier,
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                tracing::error!(
                    file = file,
                    file.location = %self.source.describe(file),
                    file.sha256 = %content.sha256(),
                    error = %err,
                    "error while indexing file"
                );
                job.file_processed();
                return Ok(());
            }
        };
        job.cancellation().check()?;
        drop(content);

        let indexed = self.counters.successes.fetch_add(1, Ordering::Relaxed) + 1;
        if indexed % INDEXING_TRACE_PERIOD == 0 {
            tracing::trace!(
                indexing.attempts = self.counters.attempts.load(Ordering::Relaxed),
                indexing.indexed = indexed,
                "indexing counters"
            );
        }

        match &self.writer {
            Some(writer) => {
                let job = Arc::clone(job);
                writer.submit(applier, move |outcome| {
                    drop(permit);
                    drop(file_lock);
                    match outcome {
                        Ok(()) => job.file_processed(),
                        Err(err) => {
                            job.record_worker_error(err);
                        }
                    }
                })
            }
            None => {
                let outcome = applier.apply();
                drop(permit);
                drop(file_lock);
                outcome?;
                job.file_processed();
                Ok(())
            }
        }
    }

    fn log_failed_load(&self, file: FileId, source: ContentError) {
        let location = self.source.describe(file);
        let kind = source.kind();
        let err = ChunkstoreError::ContentLoadFailure { file, source };
        match kind {
            ContentErrorKind::NotFound => {
                tracing::debug!(file.location = %location, error = %err, "file content not found");
            }
            ContentErrorKind::OutOfRange | ContentErrorKind::InvalidHandle => {
                tracing::info!(file.location = %location, error = %err, "failed to load file content");
            }
            ContentErrorKind::Other => {
                tracing::error!(file.location = %location, error = %err, "failed to load file content");
            }
        }
    }
}
