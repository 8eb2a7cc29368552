//! Content digests handed to indexers and used by the log-backed enumerator.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::DIGEST_BUFFER_SIZE;
use crate::error::Result;

/// BLAKE3 digest of a file's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Streams `path` through SHA-256 without loading it whole.
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = File::open(path.as_ref())?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_digest_matches_in_memory_digest() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        let payload: Vec<u8> = (0..DIGEST_BUFFER_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        file.write_all(&payload).expect("write");
        file.flush().expect("flush");
        assert_eq!(sha256_file(file.path()).expect("digest"), sha256_hex(&payload));
    }

    #[test]
    fn content_hash_renders_hex() {
        let hash = ContentHash::of(b"hello");
        assert_eq!(hash.to_string().len(), 64);
        assert_eq!(hash, ContentHash::of(b"hello"));
        assert_ne!(hash, ContentHash::of(b"world"));
    }
}
