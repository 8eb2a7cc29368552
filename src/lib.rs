#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(
    test,
    allow(
        clippy::useless_vec,
        clippy::uninlined_format_args,
        clippy::cast_possible_truncation,
        clippy::float_cmp,
        clippy::cast_precision_loss
    )
)]
#![allow(clippy::module_name_repetitions)]
//
// Strategic lint exceptions - these are allowed project-wide for pragmatic reasons:
//
// Documentation lints: Many internal/self-documenting functions don't need extensive docs.
// Public APIs should still have proper documentation.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
//
// Cast safety: casts are bounded by log sizes, chunk lengths and file counts.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::cast_possible_truncation)]
//
// Style/complexity: compaction and the worker loop are long by nature.
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::similar_names)]
// e.g., file_id, set_id, job_id
//
// Pattern matching: These pedantic lints often suggest changes that reduce clarity.
#![allow(clippy::manual_let_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::if_same_then_else)]
#![allow(clippy::collapsible_match)]
//
// Performance/ergonomics trade-offs that are acceptable for this codebase:
#![allow(clippy::needless_pass_by_value)] // Many builders take owned values intentionally
#![allow(clippy::return_self_not_must_use)] // Builder patterns don't need must_use on every method
#![allow(clippy::format_push_string)] // Readability over minor perf difference
#![allow(clippy::assigning_clones)] // clone_from() often less readable
//
// Low-value pedantic lints that add noise:
#![allow(clippy::struct_excessive_bools)] // Config structs naturally have many flags
#![allow(clippy::needless_continue)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::case_sensitive_file_extension_comparisons)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::field_reassign_with_default)]
#![allow(clippy::unreadable_literal)] // Magic numbers in binary formats are clearer as hex
#![allow(clippy::implicit_hasher)]
#![allow(clippy::manual_clamp)]
#![allow(clippy::len_without_is_empty)] // Many index types don't need is_empty()
#![allow(clippy::large_enum_variant)]
#![allow(clippy::ptr_arg)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::incompatible_msrv)]
#![allow(clippy::should_implement_trait)] // Some method names are clearer than trait names
#![allow(clippy::duplicated_attributes)]
//
// Return value wrapping: Many functions use Result for consistency even when they
// currently can't fail, allowing future error conditions to be added without breaking API.
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::unused_self)] // Some trait impls or future extensibility

/// The chunkstore-core crate version (matches `Cargo.toml`).
pub const CHUNKSTORE_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cache;
pub mod config;
pub mod constants;
pub mod digest;
pub mod error;
pub mod io;
pub mod log;
pub mod overlay;
pub mod scheduler;

pub use cache::{
    Blake3KeyDescriptor, CachingEnumerator, DataEnumerator, EnumeratorCacheStats, KeyDescriptor,
    LogEnumerator, MemoryEnumerator, NULL_ID, SlruMap, StdKeyDescriptor,
};
pub use config::IndexingConfig;
pub use digest::{ContentHash, sha256_file, sha256_hex};
pub use error::{ChunkstoreError, Result};
pub use io::{CompressionKind, HandleCache, PageCompressor};
pub use log::{
    ChunkScanner, CompactionLimits, CompactionRecord, CompactionStats, LogOptions,
    LogOptionsBuilder, LogStats, ReadResult, ScannedChunk, ValueLog, VerifyIssue, VerifyReport,
};
pub use overlay::{
    BufferingStateListener, ChangeTrackingContainer, IndexStorage, LogIndexStorage,
    MemoryIndexStorage, TransientOverlay, ValueContainer,
};
pub use scheduler::{
    BudgetStats, CancellationToken, ContentError, ContentErrorKind, ContentIndexer, ContentSource,
    ContentType, FileContent, FileId, FileSet, IndexApplier, IndexWriteExecutor, IndexingJob,
    IndexingScheduler, IndexingSchedulerBuilder, IndexingScope, JobRegistry, JobReport,
    JobRequest, JobState, MemoryBudget, MemoryContentSource, MemoryPermit, NoopProgress,
    ProgressSink, SuspendHandle,
};
