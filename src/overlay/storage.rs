//! Backend index storages the overlay writes through to.

use std::collections::HashMap;
use std::fs;
use std::hash::Hash;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use atomic_write_file::AtomicWriteFile;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ChunkstoreError, Result};
use crate::io::compressed::side_file;
use crate::log::{CompactionRecord, CompactionStats, LogOptions, ValueLog};

use super::container::ValueContainer;

/// Key → container storage.
pub trait IndexStorage<K, V>: Send + Sync {
    fn add_value(&self, key: &K, input_id: u32, value: V) -> Result<()>;
    fn remove_all_values(&self, key: &K, input_id: u32) -> Result<()>;
    /// Current container for `key`; empty when the key is unknown.
    fn read(&self, key: &K) -> Result<ValueContainer<V>>;
    fn clear(&self) -> Result<()>;
    fn clear_caches(&self) {}
    fn flush(&self) -> Result<()>;
    fn keys(&self) -> Result<Vec<K>>;
    fn keys_count_approximately(&self) -> usize;
}

/// Purely in-memory storage.
#[derive(Debug)]
pub struct MemoryIndexStorage<K, V> {
    map: Mutex<HashMap<K, ValueContainer<V>>>,
}

impl<K, V> Default for MemoryIndexStorage<K, V> {
    fn default() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> MemoryIndexStorage<K, V> {
    fn map(&self) -> MutexGuard<'_, HashMap<K, ValueContainer<V>>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> IndexStorage<K, V> for MemoryIndexStorage<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + PartialEq + Send,
{
    fn add_value(&self, key: &K, input_id: u32, value: V) -> Result<()> {
        self.map()
            .entry(key.clone())
            .or_default()
            .add_value(input_id, value);
        Ok(())
    }

    fn remove_all_values(&self, key: &K, input_id: u32) -> Result<()> {
        if let Some(container) = self.map().get_mut(key) {
            container.remove_associated_value(input_id);
        }
        Ok(())
    }

    fn read(&self, key: &K) -> Result<ValueContainer<V>> {
        Ok(self.map().get(key).cloned().unwrap_or_default())
    }

    fn clear(&self) -> Result<()> {
        self.map().clear();
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<K>> {
        Ok(self.map().keys().cloned().collect())
    }

    fn keys_count_approximately(&self) -> usize {
        self.map().len()
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum ContainerOp<V> {
    Add { input_id: u32, value: V },
    Remove { input_id: u32 },
}

struct LogIndexState<K> {
    log: Option<ValueLog>,
    tails: HashMap<K, u64>,
    dirty: bool,
}

/// Storage that keeps each key's container as a chain of add/remove
/// operations in a [`ValueLog`].
///
/// Fragmented chains are rewritten as a single snapshot chunk when read.
/// The key → tail table lives next to the log in `<path>.keys`.
pub struct LogIndexStorage<K, V> {
    path: PathBuf,
    options: LogOptions,
    state: Mutex<LogIndexState<K>>,
    _values: std::marker::PhantomData<fn() -> V>,
}

impl<K, V> std::fmt::Debug for LogIndexStorage<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogIndexStorage")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

impl<K, V> LogIndexStorage<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + PartialEq + Serialize + DeserializeOwned,
{
    pub fn open(path: impl AsRef<Path>, options: LogOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if options.headerless {
            return Err(ChunkstoreError::Config {
                reason: "log-backed index storage needs chained chunks".into(),
            });
        }
        let log = ValueLog::open(&path, options.clone())?;
        let keys_path = side_file(&path, ".keys");
        let tails: HashMap<K, u64> = if keys_path.exists() {
            let entries: Vec<(K, u64)> = serde_json::from_slice(&fs::read(&keys_path)?)?;
            entries.into_iter().collect()
        } else {
            if log.size() > 0 {
                tracing::warn!(
                    storage.path = %path.display(),
                    "key table missing for non-empty log; starting empty"
                );
            }
            HashMap::new()
        };
        Ok(Self {
            path,
            options,
            state: Mutex::new(LogIndexState {
                log: Some(log),
                tails,
                dirty: false,
            }),
            _values: std::marker::PhantomData,
        })
    }

    fn state(&self) -> MutexGuard<'_, LogIndexState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append_op(&self, key: &K, op: &ContainerOp<V>) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(op, bincode_config())?;
        let mut state = self.state();
        let prev = state.tails.get(key).copied().unwrap_or(0);
        let tail = live_log(&state.log)?.append(&bytes, prev)?;
        state.tails.insert(key.clone(), tail);
        state.dirty = true;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<ValueContainer<V>> {
        let mut container = ValueContainer::default();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let (op, used): (ContainerOp<V>, usize) =
                bincode::serde::decode_from_slice(&bytes[offset..], bincode_config())?;
            offset += used;
            match op {
                ContainerOp::Add { input_id, value } => container.add_value(input_id, value),
                ContainerOp::Remove { input_id } => {
                    container.remove_associated_value(input_id);
                }
            }
        }
        Ok(container)
    }

    fn encode_snapshot(container: &ValueContainer<V>) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for (input_id, value) in container.iter() {
            let op = ContainerOp::Add {
                input_id,
                value: value.clone(),
            };
            bytes.extend(bincode::serde::encode_to_vec(&op, bincode_config())?);
        }
        Ok(bytes)
    }

    /// Rewrites every chain into a fresh log and swaps it in.
    pub fn compact(&self) -> Result<CompactionStats> {
        let mut state = self.state();
        let mut records: Vec<CompactionRecord<K>> = state
            .tails
            .iter()
            .map(|(key, tail)| CompactionRecord::new(key.clone(), *tail))
            .collect();
        let log = state.log.take().ok_or_else(|| ChunkstoreError::InvalidState {
            reason: "value log unavailable".into(),
        })?;
        match log.compact_in_place(&mut records) {
            Ok((log, stats)) => {
                state.log = Some(log);
                state.tails = records
                    .into_iter()
                    .map(|record| (record.key, record.new_address))
                    .collect();
                state.dirty = true;
                self.persist_keys(&mut state)?;
                Ok(stats)
            }
            Err(err) => {
                tracing::error!(
                    storage.path = %self.path.display(),
                    error = %err,
                    "index storage compaction failed; reopening previous log"
                );
                state.log = Some(ValueLog::open(&self.path, self.options.clone())?);
                Err(err)
            }
        }
    }

    fn persist_keys(&self, state: &mut LogIndexState<K>) -> Result<()> {
        if !state.dirty {
            return Ok(());
        }
        live_log(&state.log)?.force()?;
        let entries: Vec<(&K, &u64)> = state.tails.iter().collect();
        let json = serde_json::to_vec(&entries)?;
        let mut file = AtomicWriteFile::options().open(side_file(&self.path, ".keys"))?;
        file.write_all(&json)?;
        file.commit()?;
        state.dirty = false;
        Ok(())
    }

    #[must_use]
    pub fn log_size(&self) -> u64 {
        self.state().log.as_ref().map_or(0, ValueLog::size)
    }
}

fn live_log(log: &Option<ValueLog>) -> Result<&ValueLog> {
    log.as_ref().ok_or_else(|| ChunkstoreError::InvalidState {
        reason: "value log unavailable".into(),
    })
}

impl<K, V> IndexStorage<K, V> for LogIndexStorage<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned + Send,
    V: Clone + PartialEq + Serialize + DeserializeOwned + Send,
{
    fn add_value(&self, key: &K, input_id: u32, value: V) -> Result<()> {
        self.append_op(key, &ContainerOp::Add { input_id, value })
    }

    fn remove_all_values(&self, key: &K, input_id: u32) -> Result<()> {
        if !self.state().tails.contains_key(key) {
            return Ok(());
        }
        self.append_op(key, &ContainerOp::Remove { input_id })
    }

    fn read(&self, key: &K) -> Result<ValueContainer<V>> {
        let mut state = self.state();
        let Some(tail) = state.tails.get(key).copied() else {
            return Ok(ValueContainer::default());
        };
        let log = live_log(&state.log)?;
        let result = log.read(tail)?;
        let container = Self::decode(&result.bytes)?;
        if log.should_compact_chunks(result.chunk_count) {
            let snapshot = Self::encode_snapshot(&container)?;
            let new_tail = if snapshot.is_empty() {
                None
            } else {
                Some(log.compact_chunks(&snapshot)?)
            };
            match new_tail {
                Some(new_tail) => state.tails.insert(key.clone(), new_tail),
                None => state.tails.remove(key),
            };
            state.dirty = true;
        }
        Ok(container)
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state();
        if let Some(log) = state.log.take() {
            log.dispose()?;
        }
        for suffix in ["", ".pages", ".tail", ".keys"] {
            let candidate = side_file(&self.path, suffix);
            if candidate.exists() {
                fs::remove_file(&candidate)?;
            }
        }
        state.tails.clear();
        state.dirty = false;
        state.log = Some(ValueLog::open(&self.path, self.options.clone())?);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state();
        self.persist_keys(&mut state)
    }

    fn keys(&self) -> Result<Vec<K>> {
        Ok(self.state().tails.keys().cloned().collect())
    }

    fn keys_count_approximately(&self) -> usize {
        self.state().tails.len()
    }
}

impl<K, V> Drop for LogIndexStorage<K, V> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.dirty {
            tracing::warn!(
                storage.path = %self.path.display(),
                "index storage dropped with unflushed key table"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::HandleCache;
    use std::sync::Arc;

    fn options() -> LogOptions {
        LogOptions::builder()
            .handles(Arc::new(HandleCache::new(4, 4)))
            .build()
    }

    #[test]
    fn operations_replay_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage: LogIndexStorage<String, u64> =
            LogIndexStorage::open(dir.path().join("idx"), options()).expect("open");
        let key = "fn main".to_string();
        storage.add_value(&key, 1, 10).expect("add");
        storage.add_value(&key, 2, 20).expect("add");
        storage.remove_all_values(&key, 1).expect("remove");
        storage.add_value(&key, 3, 30).expect("add");

        let container = storage.read(&key).expect("read");
        assert_eq!(container.input_ids().collect::<Vec<_>>(), vec![2, 3]);

        // the fragmented chain was replaced by a single snapshot chunk
        let size_after_defrag = storage.log_size();
        let again = storage.read(&key).expect("read again");
        assert_eq!(again, container);
        assert_eq!(storage.log_size(), size_after_defrag);
    }

    #[test]
    fn key_table_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("idx");
        let opts = options();
        {
            let storage: LogIndexStorage<String, String> =
                LogIndexStorage::open(&path, opts.clone()).expect("open");
            storage
                .add_value(&"k".to_string(), 7, "v".to_string())
                .expect("add");
            storage.flush().expect("flush");
        }
        let storage: LogIndexStorage<String, String> =
            LogIndexStorage::open(&path, opts).expect("reopen");
        assert_eq!(storage.keys().expect("keys"), vec!["k".to_string()]);
        assert_eq!(storage.read(&"k".to_string()).expect("read").values_for(7), &["v".to_string()]);
    }

    #[test]
    fn compaction_keeps_contents_and_shrinks_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage: LogIndexStorage<u32, u32> =
            LogIndexStorage::open(dir.path().join("idx"), options()).expect("open");
        for key in 0..4u32 {
            for input in 0..6u32 {
                storage.add_value(&key, input, key * 100 + input).expect("add");
                storage.remove_all_values(&key, input).expect("remove");
                storage.add_value(&key, input, key * 100 + input).expect("add");
            }
        }
        let before = storage.log_size();
        let stats = storage.compact().expect("compact");
        assert_eq!(stats.chunks_written, 4);
        assert!(storage.log_size() < before);
        for key in 0..4u32 {
            assert_eq!(storage.read(&key).expect("read").size(), 6);
        }
    }

    #[test]
    fn headerless_options_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result: Result<LogIndexStorage<u32, u32>> = LogIndexStorage::open(
            dir.path().join("idx"),
            LogOptions::builder().headerless(true).build(),
        );
        assert!(matches!(result, Err(ChunkstoreError::Config { .. })));
    }
}
