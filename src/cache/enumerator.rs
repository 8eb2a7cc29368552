//! Value ↔ id enumerators and a lock-striped cache in front of them.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::cache::slru::SlruMap;
use crate::constants::{ENUMERATOR_CACHE_SIZE, STRIPE_COUNT, STRIPE_MASK};
use crate::error::{ChunkstoreError, Result};
use crate::log::{LogOptions, ValueLog};

/// Id reserved for the absent value.
pub const NULL_ID: u32 = 0;

/// Bidirectional mapping between values and dense integer ids.
pub trait DataEnumerator<D>: Send + Sync {
    /// Returns the id of `value`, assigning a fresh one if it was never seen.
    fn enumerate(&self, value: Option<&D>) -> Result<u32>;

    fn value_of(&self, id: u32) -> Result<Option<D>>;
}

/// Hashing and equality used to key cached values.
pub trait KeyDescriptor<D>: Send + Sync {
    fn hash_code(&self, value: &D) -> i32;
    fn is_equal(&self, left: &D, right: &D) -> bool;
}

/// Uses the value's own `Hash`/`Eq` with a fixed-key hasher.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdKeyDescriptor;

impl<D: Hash + Eq> KeyDescriptor<D> for StdKeyDescriptor {
    fn hash_code(&self, value: &D) -> i32 {
        let hashed = std::hash::BuildHasherDefault::<std::collections::hash_map::DefaultHasher>::default()
            .hash_one(value);
        (hashed ^ (hashed >> 32)) as i32
    }

    fn is_equal(&self, left: &D, right: &D) -> bool {
        left == right
    }
}

/// Hashes byte-like values with blake3.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3KeyDescriptor;

impl<D: AsRef<[u8]>> KeyDescriptor<D> for Blake3KeyDescriptor {
    fn hash_code(&self, value: &D) -> i32 {
        let digest = blake3::hash(value.as_ref());
        let bytes = digest.as_bytes();
        i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn is_equal(&self, left: &D, right: &D) -> bool {
        left.as_ref() == right.as_ref()
    }
}

fn value_stripe(hash: i32) -> usize {
    (hash.wrapping_abs() & STRIPE_MASK) as usize
}

fn id_stripe(id: u32) -> usize {
    let mut h = id;
    h ^= (h >> 20) ^ (h >> 12);
    let mixed = (h ^ (h >> 7) ^ (h >> 4)) as i32;
    (mixed.wrapping_abs() & STRIPE_MASK) as usize
}

struct Stripe<D> {
    hash_to_id: SlruMap<i32, u32>,
    id_to_value: SlruMap<u32, D>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EnumeratorCacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Caches both directions of a [`DataEnumerator`] in independently locked stripes.
///
/// A hash hit is only trusted after the cached value for the candidate id
/// compares equal to the query, so hash collisions fall through to the base.
pub struct CachingEnumerator<D, E, K> {
    base: E,
    descriptor: K,
    stripes: Vec<Mutex<Stripe<D>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<D, E, K> std::fmt::Debug for CachingEnumerator<D, E, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingEnumerator")
            .field("stripes", &self.stripes.len())
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<D, E, K> CachingEnumerator<D, E, K>
where
    D: Clone + Send,
    E: DataEnumerator<D>,
    K: KeyDescriptor<D>,
{
    pub fn new(base: E, descriptor: K) -> Self {
        let per_stripe = ENUMERATOR_CACHE_SIZE / STRIPE_COUNT;
        let stripes = (0..STRIPE_COUNT)
            .map(|_| {
                Mutex::new(Stripe {
                    hash_to_id: SlruMap::new(per_stripe, per_stripe),
                    id_to_value: SlruMap::new(per_stripe, per_stripe),
                })
            })
            .collect();
        Self {
            base,
            descriptor,
            stripes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn stripe(&self, index: usize) -> MutexGuard<'_, Stripe<D>> {
        self.stripes[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn base(&self) -> &E {
        &self.base
    }

    #[must_use]
    pub fn stats(&self) -> EnumeratorCacheStats {
        EnumeratorCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Empties every stripe.
    pub fn clear(&self) {
        for index in 0..self.stripes.len() {
            let mut stripe = self.stripe(index);
            stripe.hash_to_id.clear();
            stripe.id_to_value.clear();
        }
    }

    fn cached_id(&self, value: &D, hash: i32) -> Option<u32> {
        let candidate = self.stripe(value_stripe(hash)).hash_to_id.get(&hash).copied()?;
        let mut stripe = self.stripe(id_stripe(candidate));
        let cached = stripe.id_to_value.get(&candidate)?;
        self.descriptor.is_equal(value, cached).then_some(candidate)
    }
}

impl<D, E, K> DataEnumerator<D> for CachingEnumerator<D, E, K>
where
    D: Clone + Send,
    E: DataEnumerator<D>,
    K: KeyDescriptor<D>,
{
    fn enumerate(&self, value: Option<&D>) -> Result<u32> {
        let Some(value) = value else {
            return self.base.enumerate(None);
        };
        let hash = self.descriptor.hash_code(value);
        if let Some(id) = self.cached_id(value, hash) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let id = self.base.enumerate(Some(value))?;
        self.stripe(value_stripe(hash)).hash_to_id.put(hash, id);
        self.stripe(id_stripe(id)).id_to_value.put(id, value.clone());
        Ok(id)
    }

    fn value_of(&self, id: u32) -> Result<Option<D>> {
        let index = id_stripe(id);
        if let Some(value) = self.stripe(index).id_to_value.get(&id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value.clone()));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let value = self.base.value_of(id)?;
        if let Some(value) = &value {
            self.stripe(index).id_to_value.put(id, value.clone());
        }
        Ok(value)
    }
}

/// Volatile enumerator backed by a hash map.
#[derive(Debug)]
pub struct MemoryEnumerator<D> {
    state: Mutex<MemoryState<D>>,
}

#[derive(Debug)]
struct MemoryState<D> {
    ids: HashMap<D, u32>,
    values: Vec<D>,
}

impl<D> Default for MemoryEnumerator<D> {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                ids: HashMap::new(),
                values: Vec::new(),
            }),
        }
    }
}

impl<D> MemoryEnumerator<D> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values
            .len()
    }
}

impl<D> DataEnumerator<D> for MemoryEnumerator<D>
where
    D: Eq + Hash + Clone + Send,
{
    fn enumerate(&self, value: Option<&D>) -> Result<u32> {
        let Some(value) = value else {
            return Ok(NULL_ID);
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = state.ids.get(value) {
            return Ok(*id);
        }
        state.values.push(value.clone());
        let id = u32::try_from(state.values.len()).map_err(|_| ChunkstoreError::InvalidState {
            reason: "enumerator id space exhausted".into(),
        })?;
        state.ids.insert(value.clone(), id);
        Ok(id)
    }

    fn value_of(&self, id: u32) -> Result<Option<D>> {
        if id == NULL_ID {
            return Ok(None);
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.values.get(id as usize - 1).cloned())
    }
}

/// Persistent byte-string enumerator stored in a headerless value log.
///
/// Ids are assigned in append order; the lookup tables are rebuilt by scanning
/// the log on open.
#[derive(Debug)]
pub struct LogEnumerator {
    log: ValueLog,
    state: Mutex<LogEnumeratorState>,
}

#[derive(Debug, Default)]
struct LogEnumeratorState {
    addresses: Vec<u64>,
    by_digest: HashMap<blake3::Hash, Vec<u32>>,
}

impl LogEnumerator {
    pub fn open(path: impl AsRef<Path>, options: LogOptions) -> Result<Self> {
        let options = LogOptions {
            headerless: true,
            ..options
        };
        let log = ValueLog::open(path, options)?;
        let mut state = LogEnumeratorState::default();
        for chunk in log.scan() {
            let chunk = chunk?;
            state.addresses.push(chunk.address);
            let id = state.addresses.len() as u32;
            state
                .by_digest
                .entry(blake3::hash(&chunk.payload))
                .or_default()
                .push(id);
        }
        tracing::debug!(
            enumerator.path = %log.path().display(),
            enumerator.ids = state.addresses.len(),
            "log enumerator loaded"
        );
        Ok(Self {
            log,
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .addresses
            .len()
    }

    pub fn force(&self) -> Result<()> {
        self.log.force()
    }
}

impl DataEnumerator<Vec<u8>> for LogEnumerator {
    fn enumerate(&self, value: Option<&Vec<u8>>) -> Result<u32> {
        let Some(value) = value else {
            return Ok(NULL_ID);
        };
        let digest = blake3::hash(value);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(candidates) = state.by_digest.get(&digest) {
            for &id in candidates {
                let address = state.addresses[id as usize - 1];
                if self.log.read(address)?.bytes == *value {
                    return Ok(id);
                }
            }
        }
        let address = self.log.append(value, 0)?;
        state.addresses.push(address);
        let id = u32::try_from(state.addresses.len()).map_err(|_| ChunkstoreError::InvalidState {
            reason: "enumerator id space exhausted".into(),
        })?;
        state.by_digest.entry(digest).or_default().push(id);
        Ok(id)
    }

    fn value_of(&self, id: u32) -> Result<Option<Vec<u8>>> {
        if id == NULL_ID {
            return Ok(None);
        }
        let address = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.addresses.get(id as usize - 1) {
                Some(address) => *address,
                None => return Ok(None),
            }
        };
        Ok(Some(self.log.read(address)?.bytes))
    }
}
