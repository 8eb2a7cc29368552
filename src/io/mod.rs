//! File-level plumbing beneath the value log.

pub mod compressed;
pub mod handles;
pub mod varint;

pub use compressed::{CompressedFile, CompressionKind, Lz4Compressor, PageCompressor, ZstdCompressor};
pub use handles::{CachedFile, HandleCache, SharedFile};
