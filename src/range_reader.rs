//! Random access to stored objects through byte-range reads.
//!
//! An HDF5 container is navigated by following addresses, so the reader asks for many small
//! ranges (superblock, object headers, B-tree nodes) and a few large ones (chunks). Small reads
//! are served from a per-object cache of fixed size blocks, fetched on demand and coalesced
//! into one request per run of missing blocks. Reads of a block or more bypass the cache and
//! fetch exactly the requested range. No read ever asks storage for more than the blocks
//! covering the requested bytes.

use crate::error::H5LensError;
use crate::metrics::record_fetched;

use bytes::{Bytes, BytesMut};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Random access to the bytes of one stored object.
pub trait ByteSource: Send + Sync {
    /// Size of the object in bytes.
    fn size(&self) -> u64;

    /// Read `len` bytes starting at `offset`. The range lies within the object.
    fn read_range(&self, offset: u64, len: u64) -> Result<Bytes, H5LensError>;
}

/// Block cache settings for one opened object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockOptions {
    /// Size of a cached block in bytes
    pub block_size: u64,
    /// Number of blocks kept per object
    pub capacity: usize,
}

impl Default for BlockOptions {
    fn default() -> Self {
        BlockOptions {
            block_size: 64 * 1024,
            capacity: 256,
        }
    }
}

/// A [ByteSource] with a least-recently-used cache of fixed size blocks.
pub struct BlockReader {
    source: Box<dyn ByteSource>,
    block_size: u64,
    blocks: Mutex<LruCache<u64, Bytes>>,
    fetched: AtomicU64,
}

impl BlockReader {
    pub fn new(source: Box<dyn ByteSource>, options: BlockOptions) -> Self {
        let capacity = NonZeroUsize::new(options.capacity).unwrap_or(NonZeroUsize::MIN);
        BlockReader {
            source,
            block_size: options.block_size.max(1),
            blocks: Mutex::new(LruCache::new(capacity)),
            fetched: AtomicU64::new(0),
        }
    }

    /// Size of the object in bytes.
    pub fn size(&self) -> u64 {
        self.source.size()
    }

    /// Total bytes fetched from the source so far.
    pub fn fetched(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }

    /// Read `len` bytes at `offset`.
    pub fn read(&self, offset: u64, len: u64) -> Result<Bytes, H5LensError> {
        let end = offset.checked_add(len).filter(|end| *end <= self.size());
        if end.is_none() {
            return Err(H5LensError::Hdf5Format(format!(
                "read of {len} bytes at {offset} is beyond the end of the object ({} bytes)",
                self.size()
            )));
        }
        if len == 0 {
            return Ok(Bytes::new());
        }
        if len >= self.block_size {
            let data = self.fetch(offset, len)?;
            record_fetched("direct", len);
            return Ok(data);
        }
        self.read_blocks(offset, len)
    }

    /// Read up to `len` bytes at `offset`, stopping at the end of the object.
    pub fn read_at_most(&self, offset: u64, len: u64) -> Result<Bytes, H5LensError> {
        let len = len.min(self.size().saturating_sub(offset));
        self.read(offset, len)
    }

    fn fetch(&self, offset: u64, len: u64) -> Result<Bytes, H5LensError> {
        let data = self.source.read_range(offset, len)?;
        if data.len() as u64 != len {
            return Err(H5LensError::upstream(format!(
                "range {offset}+{len}: received {} bytes",
                data.len()
            )));
        }
        self.fetched.fetch_add(len, Ordering::Relaxed);
        Ok(data)
    }

    fn read_blocks(&self, offset: u64, len: u64) -> Result<Bytes, H5LensError> {
        let first = offset / self.block_size;
        let last = (offset + len - 1) / self.block_size;
        let mut blocks: Vec<Option<Bytes>> = {
            let mut cache = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
            (first..=last).map(|index| cache.get(&index).cloned()).collect()
        };

        // Fetch each run of missing blocks with one request.
        let mut slot = 0;
        while slot < blocks.len() {
            if blocks[slot].is_some() {
                slot += 1;
                continue;
            }
            let start = slot;
            while slot < blocks.len() && blocks[slot].is_none() {
                slot += 1;
            }
            let run_offset = (first + start as u64) * self.block_size;
            let run_end = ((first + slot as u64) * self.block_size).min(self.size());
            let data = self.fetch(run_offset, run_end - run_offset)?;
            record_fetched("block", run_end - run_offset);
            let block_size = self.block_size as usize;
            let mut cache = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
            for (n, block) in blocks[start..slot].iter_mut().enumerate() {
                let begin = n * block_size;
                let piece = data.slice(begin..(begin + block_size).min(data.len()));
                cache.put(first + (start + n) as u64, piece.clone());
                *block = Some(piece);
            }
        }

        let skip = (offset - first * self.block_size) as usize;
        let len = len as usize;
        let blocks: Vec<Bytes> = blocks.into_iter().flatten().collect();
        if let [block] = blocks.as_slice() {
            return Ok(block.slice(skip..skip + len));
        }
        let mut out = BytesMut::with_capacity(len);
        let mut skip = skip;
        for block in &blocks {
            let take = (block.len() - skip).min(len - out.len());
            out.extend_from_slice(&block[skip..skip + take]);
            skip = 0;
        }
        Ok(out.freeze())
    }
}

/// A [ByteSource] over bytes held in memory, recording every range asked of it.
#[derive(Debug, Default)]
pub struct MemorySource {
    data: Bytes,
    requests: Mutex<Vec<(u64, u64)>>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        MemorySource {
            data: data.into(),
            requests: Mutex::new(vec![]),
        }
    }

    /// `(offset, len)` of every read so far, in order.
    pub fn requests(&self) -> Vec<(u64, u64)> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ByteSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, offset: u64, len: u64) -> Result<Bytes, H5LensError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((offset, len));
        let start = usize::try_from(offset)?;
        let end = usize::try_from(offset + len)?;
        if end > self.data.len() {
            return Err(H5LensError::upstream(format!("range {offset}+{len}")));
        }
        Ok(self.data.slice(start..end))
    }
}

impl<S: ByteSource + ?Sized> ByteSource for std::sync::Arc<S> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_range(&self, offset: u64, len: u64) -> Result<Bytes, H5LensError> {
        (**self).read_range(offset, len)
    }
}
