//! Page-compressed append-only file.
//!
//! Full pages of [`COMPRESSED_PAGE_SIZE`] bytes are compressed and appended to
//! the data file; their compressed lengths live in a `.pages` table and the
//! not-yet-full tail is kept in memory and persisted to `.tail` on `force`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use atomic_write_file::AtomicWriteFile;
use serde::{Deserialize, Serialize};

use crate::constants::COMPRESSED_PAGE_SIZE;
use crate::error::{ChunkstoreError, Result};

/// Pluggable block compressor for log pages.
pub trait PageCompressor: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    fn compress(&self, page: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    Zstd,
    Lz4,
}

impl CompressionKind {
    #[must_use]
    pub fn compressor(self) -> Box<dyn PageCompressor> {
        match self {
            Self::Zstd => Box::new(ZstdCompressor { level: 3 }),
            Self::Lz4 => Box::new(Lz4Compressor),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    pub level: i32,
}

impl PageCompressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, page: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(page, self.level).map_err(|err| ChunkstoreError::Compression {
            reason: err.to_string(),
        })
    }

    fn decompress(&self, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(compressed, expected_len).map_err(|err| {
            ChunkstoreError::Compression {
                reason: err.to_string(),
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Lz4Compressor;

impl PageCompressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, page: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress(page))
    }

    fn decompress(&self, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        lz4_flex::decompress(compressed, expected_len).map_err(|err| {
            ChunkstoreError::Compression {
                reason: err.to_string(),
            }
        })
    }
}

pub(crate) fn side_file(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[derive(Debug)]
pub struct CompressedFile {
    path: PathBuf,
    data: File,
    compressor: Box<dyn PageCompressor>,
    page_offsets: Vec<u64>,
    page_lengths: Vec<u32>,
    tail: Vec<u8>,
    cached_page: Option<(usize, Vec<u8>)>,
    tail_dirty: bool,
    writable: bool,
}

impl CompressedFile {
    pub fn open(path: &Path, compressor: Box<dyn PageCompressor>, writable: bool) -> Result<Self> {
        let mut data = if writable {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?
        } else {
            File::open(path)?
        };

        let page_lengths = read_page_table(&side_file(path, ".pages"))?;
        let mut page_offsets = Vec::with_capacity(page_lengths.len());
        let mut offset = 0u64;
        for length in &page_lengths {
            page_offsets.push(offset);
            offset += u64::from(*length);
        }
        let on_disk = data.metadata()?.len();
        if on_disk < offset {
            return Err(ChunkstoreError::corrupted(
                path,
                on_disk,
                "compressed data shorter than its page table",
            ));
        }
        if on_disk > offset && writable {
            // pages written after the last persisted table are unreachable
            data.set_len(offset)?;
        }
        data.seek(SeekFrom::Start(offset))?;

        let tail_path = side_file(path, ".tail");
        let tail = if tail_path.exists() {
            std::fs::read(&tail_path)?
        } else {
            Vec::new()
        };
        if tail.len() >= COMPRESSED_PAGE_SIZE {
            return Err(ChunkstoreError::corrupted(
                path,
                offset,
                "compressed tail exceeds page size",
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            data,
            compressor,
            page_offsets,
            page_lengths,
            tail,
            cached_page: None,
            tail_dirty: false,
            writable,
        })
    }

    #[must_use]
    pub fn compressor_name(&self) -> &'static str {
        self.compressor.name()
    }

    /// Uncompressed logical length.
    #[must_use]
    pub fn len(&self) -> u64 {
        (self.page_lengths.len() * COMPRESSED_PAGE_SIZE + self.tail.len()) as u64
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        if !self.writable {
            return Err(ChunkstoreError::ReadOnly {
                reason: format!("{} opened read-only", self.path.display()),
            });
        }
        let offset = self.len();
        self.tail.extend_from_slice(bytes);
        self.tail_dirty = true;
        while self.tail.len() >= COMPRESSED_PAGE_SIZE {
            let page: Vec<u8> = self.tail.drain(..COMPRESSED_PAGE_SIZE).collect();
            self.write_page(&page)?;
        }
        Ok(offset)
    }

    fn write_page(&mut self, page: &[u8]) -> Result<()> {
        let compressed = self.compressor.compress(page)?;
        let start = self
            .page_offsets
            .last()
            .zip(self.page_lengths.last())
            .map_or(0, |(offset, len)| offset + u64::from(*len));
        let length = u32::try_from(compressed.len()).map_err(|_| ChunkstoreError::Compression {
            reason: "compressed page larger than 4 GiB".into(),
        })?;
        self.data.seek(SeekFrom::Start(start))?;
        self.data.write_all(&compressed)?;
        self.page_offsets.push(start);
        self.page_lengths.push(length);
        Ok(())
    }

    fn page(&mut self, index: usize) -> Result<&[u8]> {
        let cached = matches!(&self.cached_page, Some((cached, _)) if *cached == index);
        if !cached {
            let offset = self.page_offsets[index];
            let mut compressed = vec![0u8; self.page_lengths[index] as usize];
            self.data.seek(SeekFrom::Start(offset))?;
            self.data.read_exact(&mut compressed)?;
            let page = self
                .compressor
                .decompress(&compressed, COMPRESSED_PAGE_SIZE)?;
            if page.len() != COMPRESSED_PAGE_SIZE {
                return Err(ChunkstoreError::corrupted(
                    &self.path,
                    offset,
                    "decompressed page has unexpected size",
                ));
            }
            self.cached_page = Some((index, page));
        }
        Ok(self
            .cached_page
            .as_ref()
            .map_or(&[][..], |(_, page)| page.as_slice()))
    }

    /// Fills as much of `buf` as exists at `offset`; returns the number of bytes read.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let paged_len = (self.page_lengths.len() * COMPRESSED_PAGE_SIZE) as u64;
        let mut filled = 0usize;
        let mut position = offset;
        while filled < buf.len() && position < paged_len {
            let index = (position / COMPRESSED_PAGE_SIZE as u64) as usize;
            let within = (position % COMPRESSED_PAGE_SIZE as u64) as usize;
            let page = self.page(index)?;
            let take = (page.len() - within).min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&page[within..within + take]);
            filled += take;
            position += take as u64;
        }
        if filled < buf.len() && position >= paged_len {
            let within = (position - paged_len) as usize;
            if within < self.tail.len() {
                let take = (self.tail.len() - within).min(buf.len() - filled);
                buf[filled..filled + take].copy_from_slice(&self.tail[within..within + take]);
                filled += take;
            }
        }
        Ok(filled)
    }

    /// Persists the page table and tail, then syncs the data file.
    pub fn force(&mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.data.sync_all()?;
        let mut table = Vec::with_capacity(self.page_lengths.len() * 4);
        for length in &self.page_lengths {
            table.extend_from_slice(&length.to_le_bytes());
        }
        write_atomically(&side_file(&self.path, ".pages"), &table)?;
        if self.tail_dirty {
            write_atomically(&side_file(&self.path, ".tail"), &self.tail)?;
            self.tail_dirty = false;
        }
        Ok(())
    }
}

fn read_page_table(path: &Path) -> Result<Vec<u32>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read(path)?;
    if raw.len() % 4 != 0 {
        return Err(ChunkstoreError::corrupted(
            path,
            raw.len() as u64,
            "page table length is not a multiple of 4",
        ));
    }
    Ok(raw
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = AtomicWriteFile::options().open(path)?;
    file.write_all(bytes)?;
    file.commit()?;
    Ok(())
}
