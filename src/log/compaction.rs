//! Rewriting fragmented chains as single chunks.
//!
//! Headerless logs are copied front to back through a forward window. Chained
//! logs are scanned backwards from the tail in fixed windows while a max-heap
//! of pending chain positions decides which chunk to consume next; partially
//! merged values are held in memory until their chain bottoms out or the
//! retained total crosses a limit, in which case they are spilled to the
//! target as two linked chunks.

use std::collections::BinaryHeap;
use std::fs;
use std::path::Path;

use crate::constants::MAX_CHUNK_HEADER_LEN;
use crate::error::{ChunkstoreError, Result};
use crate::io::compressed::side_file;

use super::{ChunkHeader, LogOptions, ValueLog};

/// One value to carry over during compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionRecord<K> {
    pub key: K,
    /// Tail address of the value in the source log.
    pub value_address: u64,
    /// Suffix accumulated so far; empty until the chain is partially merged.
    pub value: Option<Vec<u8>>,
    /// Address of the rewritten value in the target log.
    pub new_address: u64,
}

impl<K> CompactionRecord<K> {
    #[must_use]
    pub fn new(key: K, value_address: u64) -> Self {
        Self {
            key,
            value_address,
            value: None,
            new_address: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CompactionStats {
    pub chunks_read: u64,
    pub chunks_written: u64,
}

impl ValueLog {
    /// Rewrites every chain in `records` into `target`, filling in `new_address`.
    ///
    /// The source is switched to compaction mode first. `target` may be the
    /// source itself only when the log is headerless.
    pub fn compact<K>(
        &self,
        records: &mut [CompactionRecord<K>],
        target: &ValueLog,
    ) -> Result<CompactionStats> {
        let same_log = std::ptr::eq(self, target);
        if same_log && !self.options.headerless {
            return Err(ChunkstoreError::InvalidOperation {
                reason: "chained values can only be compacted into a separate log".into(),
            });
        }
        if !same_log {
            target.assert_appendable()?;
        }
        if !self.in_compaction_mode() {
            self.switch_to_compaction_mode()?;
        }

        let size = self.size();
        for record in records.iter() {
            if record.value_address == 0 || record.value_address >= size {
                return Err(ChunkstoreError::corrupted(
                    &self.path,
                    record.value_address,
                    format!("compaction record address outside log of {size} bytes"),
                ));
            }
        }

        let emit = |payload: &[u8], prev: u64| -> Result<u64> {
            if same_log {
                self.append_unchecked(payload, prev)
            } else {
                target.append(payload, prev)
            }
        };

        let stats = if self.options.headerless {
            self.compact_single_chunks(records, size, emit)?
        } else {
            self.compact_chains(records, size, emit)?
        };
        tracing::info!(
            log.path = %self.path.display(),
            compaction.records = records.len(),
            compaction.chunks_read = stats.chunks_read,
            compaction.chunks_written = stats.chunks_written,
            "value log compacted"
        );
        Ok(stats)
    }

    fn compact_single_chunks<K>(
        &self,
        records: &mut [CompactionRecord<K>],
        size: u64,
        emit: impl Fn(&[u8], u64) -> Result<u64>,
    ) -> Result<CompactionStats> {
        let window_len = self.options.compaction.window;
        let mut order: Vec<usize> = (0..records.len()).collect();
        order.sort_by_key(|&index| records[index].value_address);

        let mut stats = CompactionStats::default();
        let mut window = Vec::with_capacity(window_len);
        let mut window_start = 0u64;

        for index in order {
            let address = records[index].value_address;
            let window_end = window_start + window.len() as u64;
            if window.is_empty()
                || address < window_start
                || address + (MAX_CHUNK_HEADER_LEN as u64).min(size - address) > window_end
            {
                window_start = address;
                let len = (size - address).min(window_len as u64) as usize;
                window.resize(len, 0);
                self.read_fully(address, &mut window)?;
            }
            let in_window = (address - window_start) as usize;
            let header = self.decode_header(address, &window[in_window..])?;
            let payload = self.chunk_payload(address, &header, size, window_start, &window)?;
            records[index].new_address = emit(&payload, 0)?;
            stats.chunks_read += 1;
            stats.chunks_written += 1;
        }
        Ok(stats)
    }

    fn compact_chains<K>(
        &self,
        records: &mut [CompactionRecord<K>],
        size: u64,
        emit: impl Fn(&[u8], u64) -> Result<u64>,
    ) -> Result<CompactionStats> {
        let limits = self.options.compaction;
        let window_len = limits.window as u64;
        let mut heap: BinaryHeap<(u64, usize)> = records
            .iter()
            .enumerate()
            .map(|(index, record)| (record.value_address, index))
            .collect();

        let mut stats = CompactionStats::default();
        let mut retained = records
            .iter()
            .filter_map(|record| record.value.as_ref())
            .map(|value| value.len() as u64)
            .sum::<u64>();
        let mut window = Vec::with_capacity(limits.window);
        let mut window_end = size;
        let mut window_size = match size % window_len {
            0 => window_len,
            rem => rem,
        };

        while window_end > 0 && !heap.is_empty() {
            let window_start = window_end - window_size.min(window_end);
            window.resize((window_end - window_start) as usize, 0);
            self.read_fully(window_start, &mut window)?;

            while let Some(&(address, index)) = heap.peek() {
                if address < window_start {
                    break;
                }
                if address >= window_end {
                    return Err(ChunkstoreError::corrupted(
                        &self.path,
                        address,
                        format!("record lies past compaction window ending at {window_end}"),
                    ));
                }
                heap.pop();

                let header = self.header_in_window(address, size, window_start, &window)?;
                let mut merged = self.chunk_payload(address, &header, size, window_start, &window)?;
                stats.chunks_read += 1;

                let record = &mut records[index];
                if let Some(suffix) = record.value.take() {
                    retained -= suffix.len() as u64;
                    merged.extend_from_slice(&suffix);
                }

                if header.backlink == 0 {
                    record.new_address = emit(&merged, record.new_address)?;
                    stats.chunks_written += 1;
                    continue;
                }

                let pending = retained + merged.len() as u64;
                if (pending > limits.soft_retained && merged.len() > limits.soft_block)
                    || pending > limits.hard_retained
                {
                    let older = self.read(header.backlink)?;
                    stats.chunks_read += u64::from(older.chunk_count);
                    record.new_address = emit(&older.bytes, record.new_address)?;
                    record.new_address = emit(&merged, record.new_address)?;
                    record.value_address = 0;
                    stats.chunks_written += 2;
                    tracing::debug!(
                        log.path = %self.path.display(),
                        compaction.retained = pending,
                        compaction.spilled = merged.len(),
                        "compaction spilled a partially merged value"
                    );
                    continue;
                }

                retained = pending;
                record.value = Some(merged);
                record.value_address = header.backlink;
                heap.push((header.backlink, index));
            }

            window_end = window_start;
            window_size = window_len;
        }

        if let Some((address, _)) = heap.peek() {
            return Err(ChunkstoreError::corrupted(
                &self.path,
                *address,
                "compaction finished with unconsumed chain positions",
            ));
        }
        Ok(stats)
    }

    /// Decodes a header from the window, reading directly when it straddles the window end.
    fn header_in_window(
        &self,
        address: u64,
        size: u64,
        window_start: u64,
        window: &[u8],
    ) -> Result<ChunkHeader> {
        let in_window = (address - window_start) as usize;
        let needed = (size - address).min(MAX_CHUNK_HEADER_LEN as u64) as usize;
        if in_window + needed <= window.len() {
            self.decode_header(address, &window[in_window..])
        } else {
            self.read_header_at(address, size)
        }
    }

    /// Copies a chunk payload, taking what the window holds and reading the rest.
    fn chunk_payload(
        &self,
        address: u64,
        header: &ChunkHeader,
        size: u64,
        window_start: u64,
        window: &[u8],
    ) -> Result<Vec<u8>> {
        let data_start = address + header.encoded_len as u64;
        let data_end = data_start + u64::from(header.length);
        if data_end > size {
            return Err(ChunkstoreError::corrupted(
                &self.path,
                address,
                "chunk overruns log end",
            ));
        }
        let window_end = window_start + window.len() as u64;
        let mut payload = vec![0u8; header.length as usize];
        let mut copied = 0usize;
        if data_start < window_end {
            let from = (data_start - window_start) as usize;
            let to = (data_end.min(window_end) - window_start) as usize;
            payload[..to - from].copy_from_slice(&window[from..to]);
            copied = to - from;
        }
        if copied < payload.len() {
            self.read_fully(data_start + copied as u64, &mut payload[copied..])?;
        }
        Ok(payload)
    }

    /// Compacts into a sibling file and swaps it over the original.
    ///
    /// Returns the reopened log; `new_address` in each record refers to it.
    pub fn compact_in_place<K>(
        self,
        records: &mut [CompactionRecord<K>],
    ) -> Result<(ValueLog, CompactionStats)> {
        let path = self.path.clone();
        let options = self.options.clone();
        let staging = side_file(&path, ".compacting");
        remove_log_files(&staging)?;

        let stats = {
            let target = ValueLog::open(&staging, options.clone())?;
            let stats = self.compact(records, &target)?;
            target.dispose()?;
            stats
        };
        self.dispose()?;
        drop(self);

        if !staging.exists() {
            fs::File::create(&staging)?;
        }
        replace_log_files(&staging, &path, options.compression.is_some())?;
        let reopened = ValueLog::open(&path, options)?;
        tracing::info!(
            log.path = %path.display(),
            log.size = reopened.size(),
            "value log replaced by compacted copy"
        );
        Ok((reopened, stats))
    }
}

const COMPRESSED_SIDE_FILES: [&str; 2] = [".pages", ".tail"];

fn remove_log_files(path: &Path) -> Result<()> {
    for candidate in std::iter::once(path.to_path_buf())
        .chain(COMPRESSED_SIDE_FILES.iter().map(|suffix| side_file(path, suffix)))
    {
        if candidate.exists() {
            fs::remove_file(&candidate)?;
        }
    }
    Ok(())
}

fn replace_log_files(from: &Path, to: &Path, compressed: bool) -> Result<()> {
    if compressed {
        for suffix in COMPRESSED_SIDE_FILES {
            let source = side_file(from, suffix);
            let destination = side_file(to, suffix);
            if source.exists() {
                fs::rename(&source, &destination)?;
            } else if destination.exists() {
                fs::remove_file(&destination)?;
            }
        }
    }
    fs::rename(from, to)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::HandleCache;
    use std::sync::Arc;

    fn options(headerless: bool) -> LogOptions {
        LogOptions::builder()
            .headerless(headerless)
            .handles(Arc::new(HandleCache::new(4, 4)))
            .build()
    }

    #[test]
    fn chained_values_become_single_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = ValueLog::open(dir.path().join("src"), options(false)).expect("source");
        let target = ValueLog::open(dir.path().join("dst"), options(false)).expect("target");

        let mut a = 0;
        let mut b = 0;
        for round in 0..5u8 {
            a = source.append(&[b'a', round], a).expect("append a");
            b = source.append(&[b'b', round], b).expect("append b");
        }
        let expected_a = source.read(a).expect("read a").bytes;
        let expected_b = source.read(b).expect("read b").bytes;

        let mut records = vec![CompactionRecord::new("a", a), CompactionRecord::new("b", b)];
        let stats = source.compact(&mut records, &target).expect("compact");
        assert_eq!(stats.chunks_read, 10);
        assert_eq!(stats.chunks_written, 2);

        let a2 = target.read(records[0].new_address).expect("read a2");
        assert_eq!(a2.bytes, expected_a);
        assert_eq!(a2.chunk_count, 1);
        assert_eq!(target.read(records[1].new_address).expect("read b2").bytes, expected_b);
    }

    #[test]
    fn chained_log_cannot_target_itself() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = ValueLog::open(dir.path().join("src"), options(false)).expect("log");
        let tail = log.append(b"v", 0).expect("append");
        let mut records = vec![CompactionRecord::new(1u32, tail)];
        assert!(matches!(
            log.compact(&mut records, &log),
            Err(ChunkstoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn headerless_log_compacts_into_itself() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = ValueLog::open(dir.path().join("flat"), options(true)).expect("log");
        let first = log.append(b"first", 0).expect("append");
        let second = log.append(b"second", 0).expect("append");
        let mut records = vec![
            CompactionRecord::new(2u32, second),
            CompactionRecord::new(1u32, first),
        ];
        log.compact(&mut records, &log).expect("compact");
        assert!(records[1].new_address > second);
        assert_eq!(log.read(records[1].new_address).expect("read").bytes, b"first");
        assert_eq!(log.read(records[0].new_address).expect("read").bytes, b"second");
    }

    #[test]
    fn out_of_range_record_is_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = ValueLog::open(dir.path().join("src"), options(false)).expect("source");
        let target = ValueLog::open(dir.path().join("dst"), options(false)).expect("target");
        source.append(b"v", 0).expect("append");
        let mut records = vec![CompactionRecord::new((), source.size() + 1)];
        assert!(matches!(
            source.compact(&mut records, &target),
            Err(ChunkstoreError::CorruptedStorage { .. })
        ));
    }
}
