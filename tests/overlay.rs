//! Transient buffering in front of log-backed index storage.

use std::sync::Arc;

use chunkstore_core::{
    HandleCache, IndexStorage, LogIndexStorage, LogOptions, TransientOverlay,
};
use tempfile::TempDir;

type Storage = LogIndexStorage<String, u32>;

fn open(dir: &TempDir) -> Arc<Storage> {
    let options = LogOptions::builder()
        .handles(Arc::new(HandleCache::new(4, 4)))
        .build();
    Arc::new(LogIndexStorage::open(dir.path().join("index"), options).unwrap())
}

fn key(name: &str) -> String {
    name.to_string()
}

#[test]
fn buffered_edits_reach_the_log_only_after_flush() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage.add_value(&key("alpha"), 1, 10).unwrap();
    storage.flush().unwrap();
    let size_before = storage.log_size();

    let overlay = TransientOverlay::new(Arc::clone(&storage) as Arc<dyn IndexStorage<String, u32>>);
    overlay.set_buffering_enabled(true).unwrap();
    overlay.add_value(&key("alpha"), 2, 20).unwrap();
    overlay.remove_all_values(&key("alpha"), 1).unwrap();
    overlay.add_value(&key("beta"), 3, 30).unwrap();

    let alpha = overlay.read(&key("alpha")).unwrap();
    assert_eq!(alpha.input_ids().collect::<Vec<_>>(), vec![2]);
    assert_eq!(storage.log_size(), size_before);
    assert!(storage.read(&key("beta")).unwrap().is_empty());

    // flushing while buffering leaves staged edits resident
    overlay.flush().unwrap();
    assert!(storage.read(&key("beta")).unwrap().is_empty());

    overlay.set_buffering_enabled(false).unwrap();
    overlay.flush().unwrap();
    assert_eq!(storage.read(&key("alpha")).unwrap().values_for(2), &[20]);
    assert!(storage.read(&key("alpha")).unwrap().values_for(1).is_empty());
    assert_eq!(storage.read(&key("beta")).unwrap().values_for(3), &[30]);

    drop(overlay);
    drop(storage);
    let reopened = open(&dir);
    let mut keys = reopened.keys().unwrap();
    keys.sort();
    assert_eq!(keys, vec![key("alpha"), key("beta")]);
    assert_eq!(reopened.read(&key("beta")).unwrap().values_for(3), &[30]);
}

#[test]
fn discarded_buffer_leaves_storage_untouched() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage.add_value(&key("alpha"), 1, 10).unwrap();

    let overlay = TransientOverlay::new(Arc::clone(&storage) as Arc<dyn IndexStorage<String, u32>>);
    overlay.set_buffering_enabled(true).unwrap();
    overlay.remove_all_values(&key("alpha"), 1).unwrap();
    assert!(overlay.read(&key("alpha")).unwrap().is_empty());
    assert!(overlay.keys().unwrap().is_empty());

    assert!(overlay.clear_memory_map());
    overlay.set_buffering_enabled(false).unwrap();
    overlay.flush().unwrap();
    assert_eq!(overlay.read(&key("alpha")).unwrap().values_for(1), &[10]);
    assert_eq!(overlay.keys().unwrap(), vec![key("alpha")]);
}

#[test]
fn unbuffered_writes_pass_through() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    let overlay = TransientOverlay::new(Arc::clone(&storage) as Arc<dyn IndexStorage<String, u32>>);

    for input in 0..20u32 {
        overlay.add_value(&key("gamma"), input, input * 2).unwrap();
    }
    overlay.remove_all_values(&key("gamma"), 5).unwrap();
    let container = storage.read(&key("gamma")).unwrap();
    assert_eq!(container.size(), 19);
    assert_eq!(overlay.read(&key("gamma")).unwrap(), container);
    assert!(overlay.set_buffering_enabled(false).is_err());
}

#[test]
fn pass_through_remove_is_not_undone_by_flush() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    let overlay = TransientOverlay::new(Arc::clone(&storage) as Arc<dyn IndexStorage<String, u32>>);

    overlay.set_buffering_enabled(true).unwrap();
    overlay.add_value(&key("delta"), 1, 10).unwrap();
    overlay.set_buffering_enabled(false).unwrap();
    overlay.remove_all_values(&key("delta"), 1).unwrap();
    assert!(overlay.read(&key("delta")).unwrap().values_for(1).is_empty());

    overlay.flush().unwrap();
    assert!(storage.read(&key("delta")).unwrap().values_for(1).is_empty());
    assert!(overlay.read(&key("delta")).unwrap().is_empty());

    drop(overlay);
    drop(storage);
    let reopened = open(&dir);
    assert!(reopened.read(&key("delta")).unwrap().is_empty());
}
