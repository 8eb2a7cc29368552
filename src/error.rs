use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::source::ContentError;

/// Result alias used across chunkstore.
pub type Result<T> = std::result::Result<T, ChunkstoreError>;

/// Canonical error surface for chunkstore.
#[derive(Debug, Error)]
pub enum ChunkstoreError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("corrupted storage {path}: {reason} (offset {offset})")]
    CorruptedStorage {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("incompatible log format in {path}: expected version {expected}, found {found}")]
    IncompatibleFormat {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("storage is read-only: {reason}")]
    ReadOnly { reason: String },

    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("file {file} is too large ({length} bytes, limit {limit})")]
    OversizedContent { file: u32, length: u64, limit: u64 },

    #[error("failed to load content of file {file}: {source}")]
    ContentLoadFailure {
        file: u32,
        #[source]
        source: ContentError,
    },

    #[error("{}", if *on_worker_thread { "indexing cancelled (originated in a worker thread)" } else { "indexing cancelled" })]
    Cancelled { on_worker_thread: bool },

    #[error("indexing of {scope} has failed{}", if *on_worker_thread { " (originated in a worker thread)" } else { "" })]
    IndexingFailed {
        scope: String,
        on_worker_thread: bool,
        #[source]
        source: Box<ChunkstoreError>,
    },

    #[error("unexpected failure: {reason}")]
    UnexpectedFailure { reason: String },

    #[error("failed to encode value: {reason}")]
    Encode { reason: String },

    #[error("failed to decode value: {reason}")]
    Decode { reason: String },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("compression failure: {reason}")]
    Compression { reason: String },
}

impl ChunkstoreError {
    /// True for the cooperative cancellation signal, which callers treat as
    /// "stop and retry later" rather than a failure.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub(crate) fn corrupted(path: &std::path::Path, offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptedStorage {
            path: path.to_path_buf(),
            offset,
            reason: reason.into(),
        }
    }
}

impl From<bincode::error::EncodeError> for ChunkstoreError {
    fn from(value: bincode::error::EncodeError) -> Self {
        Self::Encode {
            reason: value.to_string(),
        }
    }
}

impl From<bincode::error::DecodeError> for ChunkstoreError {
    fn from(value: bincode::error::DecodeError) -> Self {
        Self::Decode {
            reason: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for ChunkstoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode {
            reason: value.to_string(),
        }
    }
}
