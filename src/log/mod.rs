//! Chunked append-only value log.
//!
//! Every chunk is `[length varint][backlink delta varint][payload]` written at
//! its own address. A logical value is the concatenation of the payloads met
//! while walking backlinks from a tail chunk down to address 0, oldest first.
//! Headerless logs omit the delta and hold exactly one chunk per value.
//!
//! The first chunk of every log is a fixed header record carrying the format
//! version, so address 0 never names user data.

mod compaction;
pub mod options;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use memmap2::Mmap;
use serde::Serialize;

use crate::constants::{LOG_HEADER_RECORD, MAX_CHUNK_HEADER_LEN, READ_BUFFER_SIZE};
use crate::error::{ChunkstoreError, Result};
use crate::io::compressed::CompressedFile;
use crate::io::handles::{HandleCache, lock_file};
use crate::io::varint::{self, VarintBuf};

pub use compaction::{CompactionRecord, CompactionStats};
pub use options::{CompactionLimits, LogOptions, LogOptionsBuilder};

/// A reassembled logical value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub bytes: Vec<u8>,
    pub chunk_count: u32,
}

/// One physical chunk as found by a forward scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedChunk {
    pub address: u64,
    pub backlink: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub appends: u64,
    pub bytes_appended: u64,
    pub reads: u64,
    pub chunks_read: u64,
    pub fragmented_reads: u64,
}

#[derive(Debug, Default)]
struct LogCounters {
    appends: AtomicU64,
    bytes_appended: AtomicU64,
    reads: AtomicU64,
    chunks_read: AtomicU64,
    fragmented_reads: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyIssue {
    pub address: u64,
    pub reason: String,
}

/// Outcome of a full structural scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub size: u64,
    pub header_ok: bool,
    pub chunk_count: u64,
    pub payload_bytes: u64,
    pub issues: Vec<VerifyIssue>,
}

impl VerifyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.header_ok && self.issues.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct ChunkHeader {
    length: u32,
    backlink: u64,
    encoded_len: usize,
}

/// Extracts the format version from a header record in either chunk layout.
fn header_record_version(probe: &[u8], record_len: usize) -> Option<u32> {
    let (length, used) = varint::read_u32(probe)?;
    if length as usize != record_len {
        return None;
    }
    // chained logs store a zero delta between length and payload
    let candidates = [used, used + 1];
    candidates.iter().find_map(|&start| {
        if start > used && probe.get(used) != Some(&0) {
            return None;
        }
        let payload = probe.get(start..start + record_len)?;
        let version = payload.strip_prefix(LOG_HEADER_RECORD)?;
        let bytes: [u8; 4] = version.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct ValueLog {
    path: PathBuf,
    options: LogOptions,
    handles: Arc<HandleCache>,
    size: AtomicU64,
    append_lock: Mutex<()>,
    compaction_mode: AtomicBool,
    compaction_reader: Mutex<Option<Mmap>>,
    compressed: Option<Mutex<CompressedFile>>,
    counters: LogCounters,
}

impl ValueLog {
    /// Opens (or prepares to create) the log at `path`.
    ///
    /// A read-only open of a missing file fails. A non-empty file must start
    /// with a header record matching the format implied by `options`.
    pub fn open(path: impl AsRef<Path>, options: LogOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        options.compaction.validate()?;
        if options.read_only && !path.exists() {
            return Err(ChunkstoreError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("value log {} does not exist", path.display()),
                ),
            });
        }
        let handles = options.handle_cache();

        let compressed = match options.compression {
            Some(kind) => Some(Mutex::new(CompressedFile::open(
                &path,
                kind.compressor(),
                !options.read_only,
            )?)),
            None => None,
        };
        let size = if let Some(compressed) = &compressed {
            lock(compressed).len()
        } else if let Some(cached) = handles.get_if_cached(&path) {
            lock_file(&cached).len()
        } else if path.exists() {
            std::fs::metadata(&path)?.len()
        } else {
            0
        };

        let log = Self {
            path,
            options,
            handles,
            size: AtomicU64::new(size),
            append_lock: Mutex::new(()),
            compaction_mode: AtomicBool::new(false),
            compaction_reader: Mutex::new(None),
            compressed,
            counters: LogCounters::default(),
        };
        if size > 0 {
            log.check_header_record()?;
        }
        tracing::debug!(
            log.path = %log.path.display(),
            log.size = size,
            log.headerless = log.options.headerless,
            log.compressed = log.compressed.is_some(),
            "value log opened"
        );
        Ok(log)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn options(&self) -> &LogOptions {
        &self.options
    }

    /// Current logical end of the log.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    #[must_use]
    pub fn is_headerless(&self) -> bool {
        self.options.headerless
    }

    #[must_use]
    pub fn in_compaction_mode(&self) -> bool {
        self.compaction_mode.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> LogStats {
        LogStats {
            appends: self.counters.appends.load(Ordering::Relaxed),
            bytes_appended: self.counters.bytes_appended.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
            chunks_read: self.counters.chunks_read.load(Ordering::Relaxed),
            fragmented_reads: self.counters.fragmented_reads.load(Ordering::Relaxed),
        }
    }

    fn header_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(LOG_HEADER_RECORD.len() + 4);
        payload.extend_from_slice(LOG_HEADER_RECORD);
        payload.extend_from_slice(&self.options.format_version().to_le_bytes());
        payload
    }

    fn check_header_record(&self) -> Result<()> {
        let size = self.size();
        let mut probe = vec![0u8; (size as usize).min(READ_BUFFER_SIZE)];
        self.read_fully(0, &mut probe)?;
        let expected = self.header_payload();
        let found = header_record_version(&probe, expected.len()).ok_or_else(|| {
            ChunkstoreError::corrupted(&self.path, 0, "missing value log header record")
        })?;
        if found != self.options.format_version() {
            return Err(ChunkstoreError::IncompatibleFormat {
                path: self.path.clone(),
                expected: self.options.format_version(),
                found,
            });
        }
        Ok(())
    }

    fn allowed_to_append(&self) -> bool {
        !self.in_compaction_mode() && !self.options.read_only
    }

    fn assert_appendable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(ChunkstoreError::ReadOnly {
                reason: format!("value log {} is read-only", self.path.display()),
            });
        }
        if self.in_compaction_mode() {
            return Err(ChunkstoreError::InvalidState {
                reason: format!(
                    "value log {} is in compaction mode; appends are disabled",
                    self.path.display()
                ),
            });
        }
        Ok(())
    }

    /// Appends `payload` as one chunk linked to `prev` (0 for none) and returns its address.
    pub fn append(&self, payload: &[u8], prev: u64) -> Result<u64> {
        self.assert_appendable()?;
        self.append_unchecked(payload, prev)
    }

    pub(crate) fn append_unchecked(&self, payload: &[u8], prev: u64) -> Result<u64> {
        if prev != 0 && self.options.headerless {
            return Err(ChunkstoreError::InvalidOperation {
                reason: "headerless value log cannot link chunks".into(),
            });
        }
        let _guard = lock(&self.append_lock);
        if self.size() == 0 {
            self.write_header_record()?;
        }
        self.write_chunk(payload, prev)
    }

    fn write_header_record(&self) -> Result<()> {
        let payload = self.header_payload();
        self.write_chunk(&payload, 0)?;
        self.sync_writer()?;
        if self.compressed.is_none() {
            let on_disk = std::fs::metadata(&self.path)?.len();
            if on_disk > self.size() {
                tracing::info!(
                    log.path = %self.path.display(),
                    log.size = self.size(),
                    log.on_disk = on_disk,
                    "value log grew unexpectedly during first write; adopting file length"
                );
                self.size.store(on_disk, Ordering::Release);
            }
        }
        Ok(())
    }

    fn write_chunk(&self, payload: &[u8], prev: u64) -> Result<u64> {
        let length = u32::try_from(payload.len()).map_err(|_| ChunkstoreError::InvalidOperation {
            reason: format!("chunk payload of {} bytes is too large", payload.len()),
        })?;

        let write = |address: u64| -> Result<Vec<u8>> {
            if prev != 0 && prev >= address {
                return Err(ChunkstoreError::corrupted(
                    &self.path,
                    address,
                    format!("backlink {prev} does not precede chunk"),
                ));
            }
            let mut header = VarintBuf::new();
            varint::write_u32(&mut header, length);
            if !self.options.headerless {
                varint::write_u64(&mut header, if prev == 0 { 0 } else { address - prev });
            }
            let mut combined = Vec::with_capacity(header.len() + payload.len());
            combined.extend_from_slice(&header);
            combined.extend_from_slice(payload);
            Ok(combined)
        };

        let (address, written) = if let Some(compressed) = &self.compressed {
            let mut file = lock(compressed);
            let address = self.reconcile_size(file.len())?;
            let combined = write(address)?;
            file.append(&combined)?;
            (address, combined.len())
        } else {
            let handle = self.handles.get(&self.path, true)?;
            let mut file = lock_file(&handle);
            let address = self.reconcile_size(file.len())?;
            let combined = write(address)?;
            file.append(&combined)?;
            (address, combined.len())
        };

        self.size
            .store(address + written as u64, Ordering::Release);
        self.counters.appends.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_appended
            .fetch_add(written as u64, Ordering::Relaxed);
        tracing::trace!(
            log.address = address,
            log.backlink = prev,
            log.payload_len = payload.len(),
            "value log append"
        );
        Ok(address)
    }

    /// Lines the tracked size up with the physical end seen by the writer.
    fn reconcile_size(&self, physical: u64) -> Result<u64> {
        let tracked = self.size();
        if physical == tracked {
            return Ok(tracked);
        }
        if physical > tracked {
            tracing::info!(
                log.path = %self.path.display(),
                log.size = tracked,
                log.physical = physical,
                "value log length moved ahead of tracked size; adopting it"
            );
            self.size.store(physical, Ordering::Release);
            return Ok(physical);
        }
        Err(ChunkstoreError::corrupted(
            &self.path,
            physical,
            format!("log shrank below tracked size {tracked}"),
        ))
    }

    fn sync_writer(&self) -> Result<()> {
        if let Some(compressed) = &self.compressed {
            return lock(compressed).force();
        }
        if let Some(handle) = self.handles.get_if_cached(&self.path) {
            lock_file(&handle).sync()?;
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if let Some(compressed) = &self.compressed {
            return lock(compressed).read_at(offset, buf);
        }
        if self.in_compaction_mode() {
            let reader = lock(&self.compaction_reader);
            if let Some(map) = reader.as_ref() {
                let start = offset as usize;
                if let Some(bytes) = map.get(start..start + buf.len()) {
                    buf.copy_from_slice(bytes);
                    return Ok(buf.len());
                }
            }
        }
        let handle = self.handles.get(&self.path, !self.options.read_only)?;
        let mut file = lock_file(&handle);
        file.read_at(offset, buf)
    }

    fn read_fully(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let read = self.read_at(offset, buf)?;
        if read < buf.len() {
            return Err(ChunkstoreError::corrupted(
                &self.path,
                offset,
                format!("expected {} bytes, found {read}", buf.len()),
            ));
        }
        Ok(())
    }

    fn decode_header(&self, address: u64, bytes: &[u8]) -> Result<ChunkHeader> {
        let (length, mut used) = varint::read_u32(bytes).ok_or_else(|| {
            ChunkstoreError::corrupted(&self.path, address, "invalid chunk length")
        })?;
        let mut backlink = 0;
        if !self.options.headerless {
            let (delta, delta_len) = varint::read_u64(&bytes[used..]).ok_or_else(|| {
                ChunkstoreError::corrupted(&self.path, address, "invalid backlink delta")
            })?;
            if delta != 0 && delta >= address {
                return Err(ChunkstoreError::corrupted(
                    &self.path,
                    address,
                    format!("backlink delta {delta} reaches past the start of the log"),
                ));
            }
            used += delta_len;
            backlink = if delta == 0 { 0 } else { address - delta };
        }
        Ok(ChunkHeader {
            length,
            backlink,
            encoded_len: used,
        })
    }

    /// Reads the chunk header at `address`, fetching bytes straight from the log.
    fn read_header_at(&self, address: u64, size: u64) -> Result<ChunkHeader> {
        let probe_len = (size - address).min(MAX_CHUNK_HEADER_LEN as u64) as usize;
        let mut probe = [0u8; MAX_CHUNK_HEADER_LEN];
        self.read_fully(address, &mut probe[..probe_len])?;
        self.decode_header(address, &probe[..probe_len])
    }

    /// Reassembles the value whose newest chunk is at `tail`.
    pub fn read(&self, tail: u64) -> Result<ReadResult> {
        let size = self.size();
        let mut segments: Vec<Vec<u8>> = Vec::new();
        let mut total = 0u64;
        let mut chunk = tail;
        let mut buffer = [0u8; READ_BUFFER_SIZE];

        while chunk != 0 {
            if chunk > size {
                return Err(ChunkstoreError::corrupted(
                    &self.path,
                    chunk,
                    format!("chunk address beyond log end {size}"),
                ));
            }
            let len = (size - chunk).min(READ_BUFFER_SIZE as u64) as usize;
            self.read_fully(chunk, &mut buffer[..len])?;
            let header = self.decode_header(chunk, &buffer[..len])?;
            let chunk_len = header.length as usize;
            let data_start = chunk + header.encoded_len as u64;
            if data_start + chunk_len as u64 > size {
                return Err(ChunkstoreError::corrupted(
                    &self.path,
                    chunk,
                    format!("chunk of {chunk_len} bytes overruns log end {size}"),
                ));
            }
            let payload = if header.encoded_len + chunk_len <= len {
                buffer[header.encoded_len..header.encoded_len + chunk_len].to_vec()
            } else {
                let mut payload = vec![0u8; chunk_len];
                self.read_fully(data_start, &mut payload)?;
                payload
            };
            if header.backlink >= chunk {
                return Err(ChunkstoreError::corrupted(
                    &self.path,
                    chunk,
                    format!("backlink {} does not precede chunk", header.backlink),
                ));
            }

            total += chunk_len as u64;
            if total > size && self.compressed.is_none() {
                return Err(ChunkstoreError::corrupted(
                    &self.path,
                    chunk,
                    "value longer than the log itself",
                ));
            }
            segments.push(payload);
            chunk = header.backlink;
        }

        let chunk_count = segments.len() as u32;
        let mut bytes = Vec::with_capacity(total as usize);
        for segment in segments.iter().rev() {
            bytes.extend_from_slice(segment);
        }

        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .chunks_read
            .fetch_add(u64::from(chunk_count), Ordering::Relaxed);
        if chunk_count > 1 {
            self.counters.fragmented_reads.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                log.tail = tail,
                log.chunks = chunk_count,
                log.value_len = bytes.len(),
                "fragmented value read"
            );
        }
        Ok(ReadResult { bytes, chunk_count })
    }

    /// Whether a value read in `chunk_count` chunks should be rewritten as one.
    #[must_use]
    pub fn should_compact_chunks(&self, chunk_count: u32) -> bool {
        chunk_count > 1 && self.allowed_to_append()
    }

    /// Re-appends a defragmented value as a single chunk and returns its address.
    pub fn compact_chunks(&self, defragmented: &[u8]) -> Result<u64> {
        self.assert_appendable()?;
        self.append_unchecked(defragmented, 0)
    }

    /// Disables ordinary appends and pins a read snapshot for compaction.
    pub fn switch_to_compaction_mode(&self) -> Result<()> {
        if self.options.read_only {
            return Err(ChunkstoreError::ReadOnly {
                reason: "cannot compact a read-only value log".into(),
            });
        }
        let _guard = lock(&self.append_lock);
        if self.compressed.is_none() {
            self.handles.remove(&self.path)?;
            if self.size() > 0 {
                let file = File::open(&self.path)?;
                // Safety: read-only mapping; appends are disabled while it is alive.
                let map = unsafe { Mmap::map(&file)? };
                *lock(&self.compaction_reader) = Some(map);
            }
        }
        self.compaction_mode.store(true, Ordering::Release);
        tracing::debug!(log.path = %self.path.display(), log.size = self.size(), "compaction mode on");
        Ok(())
    }

    /// Flushes buffered writes, fsyncs them and releases the cached handle.
    pub fn force(&self) -> Result<()> {
        if self.options.read_only {
            return Ok(());
        }
        let _guard = lock(&self.append_lock);
        self.sync_writer()?;
        self.handles.remove(&self.path)
    }

    /// Like [`force`](Self::force), and also drops the compaction snapshot.
    pub fn dispose(&self) -> Result<()> {
        let result = if self.options.read_only {
            self.handles.remove(&self.path)
        } else {
            self.force()
        };
        lock(&self.compaction_reader).take();
        result
    }

    /// Iterates every user chunk front to back.
    #[must_use]
    pub fn scan(&self) -> ChunkScanner<'_> {
        ChunkScanner {
            log: self,
            size: self.size(),
            position: 0,
            skipped_header: false,
        }
    }

    /// Walks the whole log checking structure without failing on the first issue.
    pub fn verify(&self) -> Result<VerifyReport> {
        let size = self.size();
        let mut report = VerifyReport {
            size,
            ..VerifyReport::default()
        };
        if size == 0 {
            report.header_ok = true;
            return Ok(report);
        }
        report.header_ok = match self.check_header_record() {
            Ok(()) => true,
            Err(err) => {
                report.issues.push(VerifyIssue {
                    address: 0,
                    reason: err.to_string(),
                });
                false
            }
        };
        if !report.header_ok {
            return Ok(report);
        }

        let mut starts = std::collections::HashSet::new();
        for chunk in self.scan() {
            match chunk {
                Ok(chunk) => {
                    if chunk.backlink != 0 && !starts.contains(&chunk.backlink) {
                        report.issues.push(VerifyIssue {
                            address: chunk.address,
                            reason: format!(
                                "backlink {} does not point at a chunk start",
                                chunk.backlink
                            ),
                        });
                    }
                    starts.insert(chunk.address);
                    report.chunk_count += 1;
                    report.payload_bytes += chunk.payload.len() as u64;
                }
                Err(err) => {
                    let address = match &err {
                        ChunkstoreError::CorruptedStorage { offset, .. } => *offset,
                        _ => 0,
                    };
                    report.issues.push(VerifyIssue {
                        address,
                        reason: err.to_string(),
                    });
                    break;
                }
            }
        }
        if !report.issues.is_empty() {
            tracing::warn!(
                log.path = %self.path.display(),
                issues = report.issues.len(),
                "value log verification found issues"
            );
        }
        Ok(report)
    }
}

impl Drop for ValueLog {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            tracing::warn!(log.path = %self.path.display(), error = %err, "failed to dispose value log");
        }
    }
}

/// Forward iterator over the physical chunks of a log.
#[derive(Debug)]
pub struct ChunkScanner<'a> {
    log: &'a ValueLog,
    size: u64,
    position: u64,
    skipped_header: bool,
}

impl ChunkScanner<'_> {
    fn next_chunk(&mut self) -> Result<ScannedChunk> {
        let address = self.position;
        let header = self.log.read_header_at(address, self.size)?;
        let data_start = address + header.encoded_len as u64;
        let end = data_start + u64::from(header.length);
        if end > self.size {
            return Err(ChunkstoreError::corrupted(
                &self.log.path,
                address,
                "chunk overruns log end",
            ));
        }
        let mut payload = vec![0u8; header.length as usize];
        self.log.read_fully(data_start, &mut payload)?;
        self.position = end;
        Ok(ScannedChunk {
            address,
            backlink: header.backlink,
            payload,
        })
    }
}

impl Iterator for ChunkScanner<'_> {
    type Item = Result<ScannedChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.position >= self.size {
                return None;
            }
            match self.next_chunk() {
                Ok(chunk) if !self.skipped_header => {
                    self.skipped_header = true;
                    debug_assert_eq!(chunk.address, 0);
                }
                Ok(chunk) => return Some(Ok(chunk)),
                Err(err) => {
                    self.position = self.size;
                    return Some(Err(err));
                }
            }
        }
    }
}
