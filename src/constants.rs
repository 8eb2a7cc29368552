//! Format and tuning constants shared across the value log, caches and scheduler.

/// Record written as the very first chunk of every fresh log.
pub const LOG_HEADER_RECORD: &[u8] = b"chunkstore value log header record";

/// Maximum encoded size of a chunk header: length varint + backlink delta varint.
pub const MAX_CHUNK_HEADER_LEN: usize = 5 + 10;

/// Bytes fetched per hop while walking a chain backwards.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Backward scan window used by compaction.
pub const COMPACTION_WINDOW: usize = 256 * 1024;
/// Retained partially-merged bytes above which large entries are spilled.
pub const SOFT_MAX_RETAINED_BYTES: u64 = 10 * 1024 * 1024;
/// Retained partially-merged bytes above which every entry is spilled.
pub const HARD_MAX_RETAINED_BYTES: u64 = 100 * 1024 * 1024;
/// Entries at least this large are spilled once the soft limit is hit.
pub const SOFT_LIMIT_BLOCK_SIZE: usize = 1024;

/// Uncompressed size of one page in a compressed log.
pub const COMPRESSED_PAGE_SIZE: usize = 32 * 1024;

/// Open-handle cache segment sizes.
pub const HANDLE_CACHE_PROTECTED: usize = 10;
pub const HANDLE_CACHE_PROBATIONAL: usize = 20;
/// Pending write bytes kept in memory per handle before they hit the file.
pub const HANDLE_WRITE_BUFFER: usize = 64 * 1024;

/// Number of stripes is `1 << STRIPE_POWER`.
pub const STRIPE_POWER: u32 = 4;
pub const STRIPE_COUNT: usize = 1 << STRIPE_POWER;
pub const STRIPE_MASK: i32 = (STRIPE_COUNT as i32) - 1;
/// Total cached entries per map, split evenly across stripes.
pub const ENUMERATOR_CACHE_SIZE: usize = 8192;

/// Default ceiling on concurrently loaded file bytes.
pub const DEFAULT_MEMORY_BUDGET_BYTES: u64 = 20 * 1024 * 1024;
/// Default ceiling on a single indexable file.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MEMORY_WAIT_INTERVAL_MS: u64 = 100;
pub const MAX_DEFAULT_WORKERS: usize = 8;

/// Counters are traced every time this many files were attempted.
pub const INDEXING_TRACE_PERIOD: u64 = 10_000;

/// Read buffer used when hashing whole files.
pub const DIGEST_BUFFER_SIZE: usize = 512 * 1024;
