//! End-to-end behaviour of the indexing scheduler on worker threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chunkstore_core::{
    ChunkstoreError, ContentIndexer, FileContent, FileId, FileSet, IndexApplier, IndexingConfig,
    IndexingScheduler, IndexingScope, JobRegistry, JobRequest, JobState, MemoryBudget,
    CancellationToken, MemoryContentSource, ProgressSink, Result, SuspendHandle,
};

/// Records how often each file was indexed and which thread applied it.
#[derive(Default)]
struct RecordingIndexer {
    seen: Mutex<HashMap<FileId, u32>>,
    applied: Arc<Mutex<Vec<(FileId, String)>>>,
    cancel_on: Option<FileId>,
    fail_apply_on: Option<FileId>,
    delay: Duration,
}

impl RecordingIndexer {
    fn seen(&self, file: FileId) -> u32 {
        self.seen.lock().unwrap().get(&file).copied().unwrap_or(0)
    }

    fn total_seen(&self) -> u32 {
        self.seen.lock().unwrap().values().sum()
    }
}

impl ContentIndexer for RecordingIndexer {
    fn index(&self, content: &FileContent) -> Result<Box<dyn IndexApplier>> {
        let file = content.file;
        if self.cancel_on == Some(file) {
            return Err(ChunkstoreError::Cancelled {
                on_worker_thread: false,
            });
        }
        *self.seen.lock().unwrap().entry(file).or_default() += 1;
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let applied = Arc::clone(&self.applied);
        let fail = self.fail_apply_on == Some(file);
        Ok(Box::new(move || -> Result<()> {
            if fail {
                return Err(ChunkstoreError::InvalidState {
                    reason: format!("index storage rejected file {file}"),
                });
            }
            let name = thread::current().name().unwrap_or_default().to_string();
            applied.lock().unwrap().push((file, name));
            Ok(())
        }))
    }
}

#[derive(Default)]
struct RecordingProgress {
    fractions: Mutex<Vec<f64>>,
    texts: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingProgress {
    fn set_fraction(&self, fraction: f64) {
        self.fractions.lock().unwrap().push(fraction);
    }

    fn set_text(&self, text: &str) {
        self.texts.lock().unwrap().push(text.to_string());
    }
}

fn source_with(files: impl IntoIterator<Item = (FileId, usize)>) -> Arc<MemoryContentSource> {
    let source = Arc::new(MemoryContentSource::default());
    for (file, len) in files {
        source.insert(file, vec![b'a'; len]);
    }
    source
}

fn config(workers: usize) -> IndexingConfig {
    IndexingConfig::default()
        .worker_threads(workers)
        .poll_interval(Duration::from_millis(10))
        .memory_wait_interval(Duration::from_millis(5))
}

fn scheduler(
    source: Arc<MemoryContentSource>,
    indexer: Arc<RecordingIndexer>,
    config: IndexingConfig,
) -> IndexingScheduler {
    IndexingScheduler::builder(source, indexer)
        .config(config)
        .budget(Arc::new(MemoryBudget::new(1024 * 1024)))
        .registry(Arc::new(JobRegistry::new()))
        .build()
        .unwrap()
}

#[test]
fn every_file_is_indexed_once() {
    let source = source_with((1..=3).map(|file| (file, 16)));
    let indexer = Arc::new(RecordingIndexer::default());
    let scheduler = scheduler(source, Arc::clone(&indexer), config(2));

    let report = scheduler
        .index_files(JobRequest::new(
            IndexingScope::new("project"),
            vec![FileSet::new("abc", [1, 2, 3])],
        ))
        .unwrap();
    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.remaining, 0);
    assert_eq!(report.processed, 3);
    for file in 1..=3 {
        assert_eq!(indexer.seen(file), 1, "file {file}");
    }
    assert!(scheduler.registry().is_empty());
    assert_eq!(scheduler.counters(), (3, 3));
}

#[test]
fn overlapping_sets_are_deduplicated() {
    let source = source_with((1..=7).map(|file| (file, 8)));
    let indexer = Arc::new(RecordingIndexer::default());
    let scheduler = scheduler(source, Arc::clone(&indexer), config(3));

    let report = scheduler
        .index_files(JobRequest::new(
            IndexingScope::new("project"),
            vec![
                FileSet::new("first", [1, 2, 3, 4, 5]),
                FileSet::new("second", [3, 4, 5, 6, 7]),
            ],
        ))
        .unwrap();
    assert_eq!(report.total_files, 7);
    assert_eq!(indexer.total_seen(), 7);
}

#[test]
fn cancelled_file_returns_to_the_queue() {
    let source = source_with((1..=4).map(|file| (file, 8)));
    let indexer = Arc::new(RecordingIndexer {
        cancel_on: Some(3),
        ..RecordingIndexer::default()
    });
    let scheduler = scheduler(source, Arc::clone(&indexer), config(1));

    let job = scheduler.prepare(JobRequest::new(
        IndexingScope::new("project"),
        vec![FileSet::new("files", [1, 2, 3, 4])],
    ));
    let err = scheduler.run(&job).unwrap_err();
    assert!(err.is_cancellation(), "{err}");
    assert_eq!(job.state(), JobState::Cancelled);
    // files 1 and 2 went through before the interruption
    assert_eq!(job.remaining(), 2);
    assert!(job.pending_files().contains(&3));
    assert_eq!(indexer.seen(3), 0);
    assert_eq!(scheduler.budget().loaded(), 0);
}

#[test]
fn token_cancelled_before_start_fails_fast() {
    let source = source_with([(1, 8)]);
    let indexer = Arc::new(RecordingIndexer::default());
    let scheduler = scheduler(source, Arc::clone(&indexer), config(2));
    let request = JobRequest::new(IndexingScope::new("project"), vec![FileSet::new("one", [1])]);
    let token = CancellationToken::new();
    token.cancel();

    let job = scheduler.prepare(request.cancellation(token));
    let err = scheduler.run(&job).unwrap_err();
    assert!(matches!(err, ChunkstoreError::Cancelled { .. }));
    assert_eq!(job.state(), JobState::Cancelled);
    assert_eq!(job.remaining(), 1);
    assert_eq!(indexer.total_seen(), 0);
}

#[test]
fn cancelling_while_waiting_for_memory_requeues_files() {
    let source = source_with((1..=3).map(|file| (file, 8)));
    let indexer = Arc::new(RecordingIndexer::default());
    let budget = Arc::new(MemoryBudget::new(16));
    let held = budget
        .acquire(16, Duration::from_millis(5), &CancellationToken::new())
        .unwrap();
    let scheduler = Arc::new(
        IndexingScheduler::builder(source, Arc::clone(&indexer) as Arc<dyn ContentIndexer>)
            .config(config(2))
            .budget(Arc::clone(&budget))
            .registry(Arc::new(JobRegistry::new()))
            .build()
            .unwrap(),
    );
    let token = CancellationToken::new();
    let job = scheduler.prepare(
        JobRequest::new(IndexingScope::new("starved"), vec![FileSet::new("all", [1, 2, 3])])
            .cancellation(token.clone()),
    );

    let runner = {
        let scheduler = Arc::clone(&scheduler);
        let job = Arc::clone(&job);
        thread::spawn(move || scheduler.run(&job))
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(job.state(), JobState::Running);
    token.cancel();

    let err = runner.join().unwrap().unwrap_err();
    assert!(err.is_cancellation(), "{err}");
    assert_eq!(job.state(), JobState::Cancelled);
    assert_eq!(job.remaining(), 3);
    // blocked workers put their file back once they notice the token
    for _ in 0..200 {
        if job.pending_files().len() == 3 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    let mut pending = job.pending_files();
    pending.sort_unstable();
    assert_eq!(pending, vec![1, 2, 3]);
    assert_eq!(indexer.total_seen(), 0);
    drop(held);
    assert_eq!(budget.loaded(), 0);
}

#[test]
fn oversized_and_missing_files_are_skipped() {
    let source = source_with([(1, 10), (2, 500)]);
    let indexer = Arc::new(RecordingIndexer::default());
    let scheduler = scheduler(source, Arc::clone(&indexer), config(2).max_file_size(100));

    let report = scheduler
        .index_files(JobRequest::new(
            IndexingScope::new("project"),
            vec![FileSet::new("mixed", [1, 2, 3])],
        ))
        .unwrap();
    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.oversized, 1);
    assert_eq!(report.failed_loads, 1);
    assert_eq!(indexer.seen(1), 1);
    assert_eq!(indexer.seen(2), 0);
    assert_eq!(scheduler.counters(), (1, 1));
}

#[test]
fn memory_budget_bounds_loaded_bytes() {
    let mut rng = fastrand::Rng::with_seed(17);
    let files: Vec<(FileId, usize)> = (1..=40).map(|file| (file, rng.usize(1..=80))).collect();
    let largest = files.iter().map(|(_, len)| *len as u64).max().unwrap();
    let source = source_with(files);
    let indexer = Arc::new(RecordingIndexer {
        delay: Duration::from_millis(1),
        ..RecordingIndexer::default()
    });
    let budget = Arc::new(MemoryBudget::new(100));
    let scheduler = IndexingScheduler::builder(source, Arc::clone(&indexer) as Arc<dyn ContentIndexer>)
        .config(config(4))
        .budget(Arc::clone(&budget))
        .registry(Arc::new(JobRegistry::new()))
        .build()
        .unwrap();

    let report = scheduler
        .index_files(JobRequest::new(
            IndexingScope::new("project"),
            vec![FileSet::new("many", 1..=40)],
        ))
        .unwrap();
    assert_eq!(report.state, JobState::Completed);
    let stats = budget.stats();
    assert!(stats.peak <= 100 + largest, "{stats:?}");
    assert_eq!(stats.loaded, 0);
    assert_eq!(indexer.total_seen(), 40);
}

#[test]
fn separate_writer_applies_every_file() {
    let source = source_with((1..=12).map(|file| (file, 4)));
    let indexer = Arc::new(RecordingIndexer::default());
    let scheduler = scheduler(
        source,
        Arc::clone(&indexer),
        config(3).write_on_separate_thread(true),
    );

    let report = scheduler
        .index_files(JobRequest::new(
            IndexingScope::new("project"),
            vec![FileSet::new("all", 1..=12)],
        ))
        .unwrap();
    assert_eq!(report.state, JobState::Completed);
    let applied = indexer.applied.lock().unwrap();
    assert_eq!(applied.len(), 12);
    assert!(applied.iter().all(|(_, thread)| thread == "chunkstore-index-writer"));
}

#[test]
fn exclusive_job_runs_on_the_caller() {
    let source = source_with((1..=5).map(|file| (file, 4)));
    let indexer = Arc::new(RecordingIndexer::default());
    let scheduler = scheduler(source, Arc::clone(&indexer), config(4));

    let caller = thread::Builder::new()
        .name("exclusive-caller".into())
        .spawn(move || {
            scheduler
                .index_files(
                    JobRequest::new(IndexingScope::new("project"), vec![FileSet::new("all", 1..=5)])
                        .exclusive(true),
                )
                .unwrap()
        })
        .unwrap();
    let report = caller.join().unwrap();
    assert_eq!(report.state, JobState::Completed);
    let applied = indexer.applied.lock().unwrap();
    assert_eq!(applied.len(), 5);
    assert!(applied.iter().all(|(_, thread)| thread == "exclusive-caller"));
}

#[test]
fn suspended_job_waits_for_resume() {
    let source = source_with((1..=4).map(|file| (file, 4)));
    let indexer = Arc::new(RecordingIndexer::default());
    let scheduler = scheduler(source, Arc::clone(&indexer), config(2));
    let suspend = SuspendHandle::new();
    suspend.suspend();

    let request = JobRequest::new(IndexingScope::new("project"), vec![FileSet::new("all", 1..=4)])
        .suspension(suspend.clone());
    let runner = thread::spawn(move || scheduler.index_files(request));

    thread::sleep(Duration::from_millis(150));
    assert_eq!(indexer.total_seen(), 0);
    suspend.resume();

    let report = runner.join().unwrap().unwrap();
    assert_eq!(report.state, JobState::Completed);
    assert_eq!(indexer.total_seen(), 4);
}

#[test]
fn applier_failure_fails_the_job() {
    let source = source_with((1..=3).map(|file| (file, 4)));
    let indexer = Arc::new(RecordingIndexer {
        fail_apply_on: Some(2),
        ..RecordingIndexer::default()
    });
    let scheduler = scheduler(source, Arc::clone(&indexer), config(1));

    let job = scheduler.prepare(JobRequest::new(
        IndexingScope::new("broken"),
        vec![FileSet::new("all", [1, 2, 3])],
    ));
    let err = scheduler.run(&job).unwrap_err();
    assert!(err.to_string().contains("worker thread"), "{err}");
    match err {
        ChunkstoreError::IndexingFailed {
            scope,
            on_worker_thread,
            source,
        } => {
            assert_eq!(scope, "broken");
            assert!(on_worker_thread);
            assert!(matches!(*source, ChunkstoreError::InvalidState { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(job.state(), JobState::Failed);
}

#[test]
fn exclusive_failure_is_reported_from_the_caller() {
    let source = source_with((1..=3).map(|file| (file, 4)));
    let indexer = Arc::new(RecordingIndexer {
        fail_apply_on: Some(1),
        ..RecordingIndexer::default()
    });
    let scheduler = scheduler(source, Arc::clone(&indexer), config(2));

    let err = scheduler
        .index_files(
            JobRequest::new(IndexingScope::new("inline"), vec![FileSet::new("all", [1, 2, 3])])
                .exclusive(true),
        )
        .unwrap_err();
    assert_eq!(err.to_string(), "indexing of inline has failed");
    assert!(matches!(
        err,
        ChunkstoreError::IndexingFailed {
            on_worker_thread: false,
            ..
        }
    ));
}

#[test]
fn disposed_scope_stops_without_error() {
    let source = source_with((1..=3).map(|file| (file, 4)));
    let indexer = Arc::new(RecordingIndexer::default());
    let scheduler = scheduler(source, Arc::clone(&indexer), config(2));
    let scope = IndexingScope::new("closing");
    scope.dispose();

    let report = scheduler
        .index_files(JobRequest::new(scope, vec![FileSet::new("all", [1, 2, 3])]))
        .unwrap();
    assert_eq!(report.state, JobState::Cancelled);
    assert_eq!(report.remaining, 3);
    assert_eq!(indexer.total_seen(), 0);
}

#[test]
fn progress_reports_fraction_and_set_text() {
    let source = source_with((1..=4).map(|file| (file, 4)));
    let indexer = Arc::new(RecordingIndexer::default());
    let scheduler = scheduler(source, Arc::clone(&indexer), config(1));
    let progress = Arc::new(RecordingProgress::default());

    scheduler
        .index_files(
            JobRequest::new(
                IndexingScope::new("project"),
                vec![
                    FileSet::new("sources", [1, 2]).with_progress_text("Indexing sources"),
                    FileSet::new("libraries", [3, 4]).with_progress_text("Indexing libraries"),
                ],
            )
            .exclusive(true)
            .progress(Arc::clone(&progress) as Arc<dyn ProgressSink>),
        )
        .unwrap();

    let fractions = progress.fractions.lock().unwrap();
    assert_eq!(fractions.as_slice(), &[0.25, 0.5, 0.75, 1.0]);
    let texts = progress.texts.lock().unwrap();
    assert_eq!(texts.as_slice(), &["Indexing sources", "Indexing libraries"]);
}

#[test]
fn concurrent_jobs_share_workers() {
    let source = source_with((1..=60).map(|file| (file, 4)));
    let indexer = Arc::new(RecordingIndexer {
        delay: Duration::from_millis(1),
        ..RecordingIndexer::default()
    });
    let registry = Arc::new(JobRegistry::new());
    let scheduler = Arc::new(
        IndexingScheduler::builder(source, Arc::clone(&indexer) as Arc<dyn ContentIndexer>)
            .config(config(2))
            .budget(Arc::new(MemoryBudget::new(1024)))
            .registry(Arc::clone(&registry))
            .build()
            .unwrap(),
    );
    let finished = Arc::new(AtomicU64::new(0));

    let runners: Vec<_> = [1..=30, 31..=60]
        .into_iter()
        .enumerate()
        .map(|(index, files)| {
            let scheduler = Arc::clone(&scheduler);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                let report = scheduler
                    .index_files(JobRequest::new(
                        IndexingScope::new(format!("project-{index}")),
                        vec![FileSet::new("half", files)],
                    ))
                    .unwrap();
                finished.fetch_add(1, Ordering::SeqCst);
                report
            })
        })
        .collect();
    for runner in runners {
        let report = runner.join().unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.processed, 30);
    }
    assert_eq!(finished.load(Ordering::SeqCst), 2);
    assert_eq!(indexer.total_seen(), 60);
    assert!(registry.is_empty());
}
