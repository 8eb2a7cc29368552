//! Collaborators the scheduler drives: where bytes come from and what
//! consumes them.

use std::collections::HashMap;
use std::io;
use std::sync::RwLock;

use thiserror::Error;

use crate::digest::{ContentHash, sha256_hex};
use crate::error::Result;

/// Stable integer identity of an indexable file.
pub type FileId = u32;

/// A named group of files submitted together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSet {
    pub debug_name: String,
    pub progress_text: Option<String>,
    pub files: Vec<FileId>,
}

impl FileSet {
    pub fn new(debug_name: impl Into<String>, files: impl IntoIterator<Item = FileId>) -> Self {
        Self {
            debug_name: debug_name.into(),
            progress_text: None,
            files: files.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn with_progress_text(mut self, text: impl Into<String>) -> Self {
        self.progress_text = Some(text.into());
        self
    }
}

/// Failure reported by a [`ContentSource`].
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("file {file} not found")]
    NotFound { file: FileId },

    #[error("read of file {file} out of range: {reason}")]
    OutOfRange { file: FileId, reason: String },

    #[error("file {file} handle is no longer valid")]
    InvalidHandle { file: FileId },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{reason}")]
    Other { reason: String },
}

/// Coarse classification deciding how loudly a load failure is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentErrorKind {
    NotFound,
    OutOfRange,
    InvalidHandle,
    Other,
}

impl ContentError {
    #[must_use]
    pub fn kind(&self) -> ContentErrorKind {
        match self {
            Self::NotFound { .. } => ContentErrorKind::NotFound,
            Self::OutOfRange { .. } => ContentErrorKind::OutOfRange,
            Self::InvalidHandle { .. } => ContentErrorKind::InvalidHandle,
            Self::Io(err) => match err.kind() {
                io::ErrorKind::NotFound => ContentErrorKind::NotFound,
                io::ErrorKind::UnexpectedEof => ContentErrorKind::OutOfRange,
                _ => ContentErrorKind::Other,
            },
            Self::Other { .. } => ContentErrorKind::Other,
        }
    }
}

/// Supplies file lengths and bytes.
pub trait ContentSource: Send + Sync {
    fn length(&self, file: FileId) -> std::result::Result<u64, ContentError>;
    fn load(&self, file: FileId) -> std::result::Result<Vec<u8>, ContentError>;

    /// Human-readable location used in logs and progress text.
    fn describe(&self, file: FileId) -> String {
        format!("file #{file}")
    }
}

/// In-memory content source, handy for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryContentSource {
    files: RwLock<HashMap<FileId, Vec<u8>>>,
}

impl MemoryContentSource {
    pub fn insert(&self, file: FileId, bytes: impl Into<Vec<u8>>) {
        self.files
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(file, bytes.into());
    }

    pub fn remove(&self, file: FileId) -> Option<Vec<u8>> {
        self.files
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&file)
    }
}

impl ContentSource for MemoryContentSource {
    fn length(&self, file: FileId) -> std::result::Result<u64, ContentError> {
        self.files
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&file)
            .map(|bytes| bytes.len() as u64)
            .ok_or(ContentError::NotFound { file })
    }

    fn load(&self, file: FileId) -> std::result::Result<Vec<u8>, ContentError> {
        self.files
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&file)
            .cloned()
            .ok_or(ContentError::NotFound { file })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Text,
    Binary,
    Unknown,
}

const SNIFF_LEN: usize = 8 * 1024;

impl ContentType {
    /// Sniffs the leading bytes: NUL means binary, valid UTF-8 means text.
    #[must_use]
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::Unknown;
        }
        let head = &bytes[..bytes.len().min(SNIFF_LEN)];
        if head.contains(&0) {
            return Self::Binary;
        }
        match std::str::from_utf8(head) {
            Ok(_) => Self::Text,
            // a multi-byte character cut at the sniff boundary
            Err(err) if err.error_len().is_none() && head.len() < bytes.len() => Self::Text,
            Err(_) => Self::Unknown,
        }
    }
}

/// Loaded bytes of one file.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub file: FileId,
    pub bytes: Vec<u8>,
    pub content_type: ContentType,
}

impl FileContent {
    pub fn new(file: FileId, bytes: Vec<u8>) -> Self {
        let content_type = ContentType::detect(&bytes);
        Self {
            file,
            bytes,
            content_type,
        }
    }

    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of(&self.bytes)
    }

    /// Hex SHA-256 of the content, comparable with [`sha256_file`] on disk.
    ///
    /// [`sha256_file`]: crate::digest::sha256_file
    #[must_use]
    pub fn sha256(&self) -> String {
        sha256_hex(&self.bytes)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Writes index values produced for one file.
pub trait IndexApplier: Send {
    fn apply(self: Box<Self>) -> Result<()>;
}

impl<F> IndexApplier for F
where
    F: FnOnce() -> Result<()> + Send,
{
    fn apply(self: Box<Self>) -> Result<()> {
        (*self)()
    }
}

/// Turns loaded content into pending index values.
pub trait ContentIndexer: Send + Sync {
    fn index(&self, content: &FileContent) -> Result<Box<dyn IndexApplier>>;
}
