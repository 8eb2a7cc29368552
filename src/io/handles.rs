//! Bounded cache of open, write-buffered log files shared per path.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;

use crate::cache::slru::SlruMap;
use crate::constants::{HANDLE_CACHE_PROBATIONAL, HANDLE_CACHE_PROTECTED, HANDLE_WRITE_BUFFER};
use crate::error::Result;

/// An open log file with an in-memory write buffer.
///
/// Reads observe buffered bytes, so callers never need to flush before reading
/// their own appends.
#[derive(Debug)]
pub struct CachedFile {
    path: PathBuf,
    file: File,
    pending: Vec<u8>,
    flushed_len: u64,
    writable: bool,
}

impl CachedFile {
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let file = if writable {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?
        } else {
            File::open(path)?
        };
        let flushed_len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            pending: Vec::new(),
            flushed_len,
            writable,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Logical length including bytes not yet written to the file.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.flushed_len + self.pending.len() as u64
    }

    /// Appends `bytes` at the logical end and returns the offset they start at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.len();
        self.pending.extend_from_slice(bytes);
        if self.pending.len() >= HANDLE_WRITE_BUFFER {
            self.flush()?;
        }
        Ok(offset)
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.flushed_len))?;
        self.file.write_all(&self.pending)?;
        self.flushed_len += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Fills as much of `buf` as exists at `offset`; returns the number of bytes read.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0usize;
        if offset < self.flushed_len {
            let on_disk = (self.flushed_len - offset).min(buf.len() as u64) as usize;
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut buf[..on_disk])?;
            filled = on_disk;
        }
        if filled < buf.len() {
            let pending_start = (offset + filled as u64).saturating_sub(self.flushed_len) as usize;
            if pending_start < self.pending.len() {
                let take = (self.pending.len() - pending_start).min(buf.len() - filled);
                buf[filled..filled + take]
                    .copy_from_slice(&self.pending[pending_start..pending_start + take]);
                filled += take;
            }
        }
        Ok(filled)
    }
}

pub type SharedFile = Arc<Mutex<CachedFile>>;

pub(crate) fn lock_file(file: &SharedFile) -> MutexGuard<'_, CachedFile> {
    file.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide pool of open log files keyed by path.
///
/// Evicted handles are flushed before they are dropped.
pub struct HandleCache {
    handles: Mutex<SlruMap<PathBuf, SharedFile>>,
}

impl std::fmt::Debug for HandleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleCache")
            .field("open", &self.len())
            .finish()
    }
}

static GLOBAL_HANDLES: Lazy<Arc<HandleCache>> = Lazy::new(|| {
    Arc::new(HandleCache::new(
        HANDLE_CACHE_PROTECTED,
        HANDLE_CACHE_PROBATIONAL,
    ))
});

impl HandleCache {
    #[must_use]
    pub fn new(protected: usize, probational: usize) -> Self {
        let map = SlruMap::new(protected, probational).with_evicted_fn(Box::new(
            |path: PathBuf, file: SharedFile| {
                if let Err(err) = lock_file(&file).flush() {
                    tracing::warn!(
                        handle.path = %path.display(),
                        error = %err,
                        "failed to flush evicted log handle"
                    );
                }
            },
        ));
        Self {
            handles: Mutex::new(map),
        }
    }

    /// Shared default instance used when a log is opened without an explicit cache.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_HANDLES)
    }

    fn map(&self) -> MutexGuard<'_, SlruMap<PathBuf, SharedFile>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached handle for `path`, opening it if needed.
    ///
    /// A read-only handle is replaced when write access is requested.
    pub fn get(&self, path: &Path, writable: bool) -> Result<SharedFile> {
        let key = path.to_path_buf();
        let mut map = self.map();
        if let Some(existing) = map.get(&key) {
            let existing = Arc::clone(existing);
            if !writable || lock_file(&existing).is_writable() {
                return Ok(existing);
            }
            map.remove(&key);
        }
        let opened = Arc::new(Mutex::new(CachedFile::open(path, writable)?));
        map.put(key, Arc::clone(&opened));
        Ok(opened)
    }

    #[must_use]
    pub fn get_if_cached(&self, path: &Path) -> Option<SharedFile> {
        self.map().peek(&path.to_path_buf()).map(Arc::clone)
    }

    /// Flushes and forgets the handle for `path`.
    pub fn remove(&self, path: &Path) -> Result<()> {
        let removed = self.map().remove(&path.to_path_buf());
        if let Some(file) = removed {
            lock_file(&file).flush()?;
        }
        Ok(())
    }

    /// Flushes every cached handle and empties the cache.
    pub fn flush_all(&self) -> Result<()> {
        let mut drained = Vec::new();
        self.map().drain_with(|_, file| drained.push(file));
        for file in drained {
            lock_file(&file).flush()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map().len()
    }
}
