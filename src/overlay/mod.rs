//! In-memory staging layer in front of an [`IndexStorage`].
//!
//! With buffering off, writes go straight to the backend and any resident
//! container for the key forgets what it staged for that input. With buffering on,
//! writes land in per-key [`ChangeTrackingContainer`]s and the backend is left
//! alone until buffering is switched off and [`TransientOverlay::flush`] runs.
//! Reads always prefer a resident container.

pub mod container;
pub mod storage;

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::error::{ChunkstoreError, Result};

pub use container::{ChangeTrackingContainer, ValueContainer};
pub use storage::{IndexStorage, LogIndexStorage, MemoryIndexStorage};

/// Observer of buffering transitions and memory clears.
pub trait BufferingStateListener: Send + Sync {
    fn buffering_state_changed(&self, enabled: bool);
    fn memory_storage_cleared(&self);
}

pub struct TransientOverlay<K, V> {
    backend: Arc<dyn IndexStorage<K, V>>,
    memory: Mutex<HashMap<K, ChangeTrackingContainer<V>>>,
    buffering: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn BufferingStateListener>>>,
}

impl<K, V> std::fmt::Debug for TransientOverlay<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientOverlay")
            .field("buffering", &self.buffering.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<K, V> TransientOverlay<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    pub fn new(backend: Arc<dyn IndexStorage<K, V>>) -> Self {
        Self {
            backend,
            memory: Mutex::new(HashMap::new()),
            buffering: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn IndexStorage<K, V>> {
        &self.backend
    }

    pub fn add_listener(&self, listener: Arc<dyn BufferingStateListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn memory(&self) -> MutexGuard<'_, HashMap<K, ChangeTrackingContainer<V>>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, f: impl Fn(&dyn BufferingStateListener)) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            f(listener.as_ref());
        }
    }

    #[must_use]
    pub fn is_buffering_enabled(&self) -> bool {
        self.buffering.load(Ordering::Acquire)
    }

    /// Switches buffering; asking for the current state is an error.
    pub fn set_buffering_enabled(&self, enabled: bool) -> Result<()> {
        if self
            .buffering
            .compare_exchange(!enabled, enabled, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ChunkstoreError::InvalidState {
                reason: format!("buffering already {}", if enabled { "enabled" } else { "disabled" }),
            });
        }
        tracing::debug!(overlay.buffering = enabled, "buffering state changed");
        self.notify(|listener| listener.buffering_state_changed(enabled));
        Ok(())
    }

    pub fn add_value(&self, key: &K, input_id: u32, value: V) -> Result<()> {
        let mut memory = self.memory();
        if self.is_buffering_enabled() {
            memory
                .entry(key.clone())
                .or_default()
                .add_value(input_id, value);
            return Ok(());
        }
        // the backend write supersedes whatever was staged for this input
        if let Some(container) = memory.get_mut(key) {
            container.drop_associated_value(input_id);
        }
        drop(memory);
        self.backend.add_value(key, input_id, value)
    }

    pub fn remove_all_values(&self, key: &K, input_id: u32) -> Result<()> {
        let mut memory = self.memory();
        if self.is_buffering_enabled() {
            memory
                .entry(key.clone())
                .or_default()
                .remove_associated_value(input_id);
            return Ok(());
        }
        if let Some(container) = memory.get_mut(key) {
            container.drop_associated_value(input_id);
        }
        drop(memory);
        self.backend.remove_all_values(key, input_id)
    }

    pub fn read(&self, key: &K) -> Result<ValueContainer<V>> {
        let mut memory = self.memory();
        match memory.get_mut(key) {
            Some(container) => container.merged(|| self.backend.read(key)).cloned(),
            None => {
                drop(memory);
                self.backend.read(key)
            }
        }
    }

    /// Drops every resident container. Returns whether any existed.
    pub fn clear_memory_map(&self) -> bool {
        let modified = {
            let mut memory = self.memory();
            let modified = !memory.is_empty();
            memory.clear();
            modified
        };
        self.notify(|listener| listener.memory_storage_cleared());
        modified
    }

    /// Forgets the staged changes `input_id` made under `key`.
    pub fn clear_memory_map_for_id(&self, key: &K, input_id: u32) -> bool {
        match self.memory().get_mut(key) {
            Some(container) => {
                container.drop_associated_value(input_id);
                true
            }
            None => false,
        }
    }

    pub fn clear_caches(&self) {
        for container in self.memory().values_mut() {
            container.drop_merged_data();
        }
        self.backend.clear_caches();
    }

    pub fn clear(&self) -> Result<()> {
        self.clear_memory_map();
        self.backend.clear()
    }

    /// Writes staged changes through to the backend and flushes it.
    ///
    /// While buffering is on only the backend is flushed; staged changes stay
    /// resident. A container leaves memory only once its changes have been
    /// applied, so a backend failure keeps the rest staged for the next flush.
    pub fn flush(&self) -> Result<()> {
        if !self.is_buffering_enabled() {
            let mut memory = self.memory();
            let keys: Vec<K> = memory.keys().cloned().collect();
            let mut applied = 0usize;
            for key in keys {
                if let Some(container) = memory.get(&key) {
                    if container.has_changes() {
                        self.apply_staged(&key, container)?;
                        applied += 1;
                    }
                }
                memory.remove(&key);
            }
            drop(memory);
            if applied > 0 {
                tracing::debug!(overlay.applied_keys = applied, "flushed staged changes");
            }
        }
        self.backend.flush()
    }

    fn apply_staged(&self, key: &K, container: &ChangeTrackingContainer<V>) -> Result<()> {
        for input_id in container.invalidated() {
            self.backend.remove_all_values(key, input_id)?;
        }
        for (input_id, value) in container.added().iter() {
            self.backend.add_value(key, input_id, value.clone())?;
        }
        Ok(())
    }

    /// Keys with at least one value. Resident containers shadow the backend.
    pub fn keys(&self) -> Result<Vec<K>> {
        let mut keys = Vec::new();
        let mut shadowed = HashSet::new();
        {
            let mut memory = self.memory();
            for (key, container) in memory.iter_mut() {
                shadowed.insert(key.clone());
                if !container.merged(|| self.backend.read(key))?.is_empty() {
                    keys.push(key.clone());
                }
            }
        }
        keys.extend(
            self.backend
                .keys()?
                .into_iter()
                .filter(|key| !shadowed.contains(key)),
        );
        Ok(keys)
    }

    #[must_use]
    pub fn keys_count_approximately(&self) -> usize {
        self.memory().len() + self.backend.keys_count_approximately()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener {
        transitions: AtomicUsize,
        clears: AtomicUsize,
    }

    impl BufferingStateListener for CountingListener {
        fn buffering_state_changed(&self, _enabled: bool) {
            self.transitions.fetch_add(1, Ordering::SeqCst);
        }

        fn memory_storage_cleared(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Memory storage that rejects writes for one key while `failing` is set.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryIndexStorage<String, u32>,
        failing: Mutex<Option<String>>,
    }

    impl FlakyStorage {
        fn check(&self, key: &String) -> Result<()> {
            if self.failing.lock().expect("lock").as_ref() == Some(key) {
                return Err(ChunkstoreError::UnexpectedFailure {
                    reason: format!("write to {key} rejected"),
                });
            }
            Ok(())
        }
    }

    impl IndexStorage<String, u32> for FlakyStorage {
        fn add_value(&self, key: &String, input_id: u32, value: u32) -> Result<()> {
            self.check(key)?;
            self.inner.add_value(key, input_id, value)
        }

        fn remove_all_values(&self, key: &String, input_id: u32) -> Result<()> {
            self.check(key)?;
            self.inner.remove_all_values(key, input_id)
        }

        fn read(&self, key: &String) -> Result<ValueContainer<u32>> {
            self.inner.read(key)
        }

        fn clear(&self) -> Result<()> {
            self.inner.clear()
        }

        fn flush(&self) -> Result<()> {
            self.inner.flush()
        }

        fn keys(&self) -> Result<Vec<String>> {
            self.inner.keys()
        }

        fn keys_count_approximately(&self) -> usize {
            self.inner.keys_count_approximately()
        }
    }

    fn overlay() -> (Arc<MemoryIndexStorage<String, u32>>, TransientOverlay<String, u32>) {
        let backend = Arc::new(MemoryIndexStorage::default());
        let overlay = TransientOverlay::new(backend.clone() as Arc<dyn IndexStorage<String, u32>>);
        (backend, overlay)
    }

    #[test]
    fn buffered_writes_stay_out_of_backend_until_flush() {
        let (backend, overlay) = overlay();
        let key = "k".to_string();
        backend.add_value(&key, 1, 10).expect("seed");

        overlay.set_buffering_enabled(true).expect("enable");
        overlay.add_value(&key, 2, 20).expect("add");
        overlay.remove_all_values(&key, 1).expect("remove");

        assert_eq!(backend.read(&key).expect("backend").input_ids().collect::<Vec<_>>(), vec![1]);
        assert_eq!(overlay.read(&key).expect("overlay").input_ids().collect::<Vec<_>>(), vec![2]);

        // still buffering: flush leaves the backend alone
        overlay.flush().expect("flush");
        assert_eq!(backend.read(&key).expect("backend").size(), 1);

        overlay.set_buffering_enabled(false).expect("disable");
        overlay.flush().expect("flush");
        assert_eq!(backend.read(&key).expect("backend").input_ids().collect::<Vec<_>>(), vec![2]);
        assert_eq!(overlay.keys_count_approximately(), 1);
    }

    #[test]
    fn pass_through_write_refreshes_resident_view() {
        let (backend, overlay) = overlay();
        let key = "k".to_string();
        overlay.set_buffering_enabled(true).expect("enable");
        overlay.add_value(&key, 1, 10).expect("add");
        assert_eq!(overlay.read(&key).expect("read").size(), 1);

        overlay.set_buffering_enabled(false).expect("disable");
        overlay.add_value(&key, 2, 20).expect("add");
        assert_eq!(backend.read(&key).expect("backend").size(), 1);
        // resident container still wins and now includes the backend write
        let view = overlay.read(&key).expect("read");
        assert_eq!(view.input_ids().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn failed_flush_keeps_unapplied_changes_staged() {
        let backend = Arc::new(FlakyStorage::default());
        let overlay = TransientOverlay::new(backend.clone() as Arc<dyn IndexStorage<String, u32>>);
        let (alpha, beta, gamma) = ("alpha".to_string(), "beta".to_string(), "gamma".to_string());

        overlay.set_buffering_enabled(true).expect("enable");
        overlay.add_value(&alpha, 1, 10).expect("add");
        overlay.add_value(&beta, 2, 20).expect("add");
        overlay.add_value(&gamma, 3, 30).expect("add");
        overlay.set_buffering_enabled(false).expect("disable");

        *backend.failing.lock().expect("lock") = Some(beta.clone());
        assert!(matches!(
            overlay.flush(),
            Err(ChunkstoreError::UnexpectedFailure { .. })
        ));
        assert!(backend.read(&beta).expect("backend").is_empty());
        assert_eq!(overlay.read(&beta).expect("overlay").values_for(2), &[20]);

        *backend.failing.lock().expect("lock") = None;
        overlay.flush().expect("flush");
        assert_eq!(backend.read(&alpha).expect("backend").values_for(1), &[10]);
        assert_eq!(backend.read(&beta).expect("backend").values_for(2), &[20]);
        assert_eq!(backend.read(&gamma).expect("backend").values_for(3), &[30]);
        assert!(overlay.memory().is_empty());
    }

    #[test]
    fn pass_through_write_supersedes_staged_input() {
        let (backend, overlay) = overlay();
        let key = "k".to_string();
        overlay.set_buffering_enabled(true).expect("enable");
        overlay.add_value(&key, 1, 10).expect("add");
        overlay.add_value(&key, 2, 20).expect("add");
        overlay.set_buffering_enabled(false).expect("disable");

        overlay.remove_all_values(&key, 1).expect("remove");
        assert_eq!(overlay.read(&key).expect("read").input_ids().collect::<Vec<_>>(), vec![2]);

        overlay.flush().expect("flush");
        assert_eq!(backend.read(&key).expect("backend").input_ids().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn listeners_see_transitions_and_clears() {
        let (_backend, overlay) = overlay();
        let listener = Arc::new(CountingListener::default());
        overlay.add_listener(listener.clone());

        overlay.set_buffering_enabled(true).expect("enable");
        assert!(matches!(
            overlay.set_buffering_enabled(true),
            Err(ChunkstoreError::InvalidState { .. })
        ));
        overlay.add_value(&"a".to_string(), 1, 1).expect("add");
        assert!(overlay.clear_memory_map());
        assert!(!overlay.clear_memory_map());

        assert_eq!(listener.transitions.load(Ordering::SeqCst), 1);
        assert_eq!(listener.clears.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clearing_one_input_reports_presence() {
        let (_backend, overlay) = overlay();
        let key = "k".to_string();
        overlay.set_buffering_enabled(true).expect("enable");
        assert!(!overlay.clear_memory_map_for_id(&key, 1));
        overlay.add_value(&key, 1, 10).expect("add");
        assert!(overlay.clear_memory_map_for_id(&key, 1));
        assert!(overlay.read(&key).expect("read").is_empty());
    }

    #[test]
    fn keys_skip_emptied_resident_containers() {
        let (backend, overlay) = overlay();
        backend.add_value(&"gone".to_string(), 1, 1).expect("seed");
        backend.add_value(&"kept".to_string(), 1, 1).expect("seed");

        overlay.set_buffering_enabled(true).expect("enable");
        overlay.remove_all_values(&"gone".to_string(), 1).expect("remove");
        overlay.add_value(&"new".to_string(), 3, 3).expect("add");

        let mut keys = overlay.keys().expect("keys");
        keys.sort();
        assert_eq!(keys, vec!["kept".to_string(), "new".to_string()]);
    }
}
