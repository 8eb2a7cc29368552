//! In-memory caches: the segmented LRU map and the striped enumerator cache.

pub mod enumerator;
pub mod slru;

pub use enumerator::{
    Blake3KeyDescriptor, CachingEnumerator, DataEnumerator, EnumeratorCacheStats, KeyDescriptor,
    LogEnumerator, MemoryEnumerator, NULL_ID, StdKeyDescriptor,
};
pub use slru::SlruMap;
