//! Version 1 B-trees, symbol table nodes and local heaps.
//!
//! Groups written by the classic file format index their members with a version 1 B-tree of
//! symbol table nodes, naming them through a local heap. Chunked datasets of the same era index
//! their chunks with a version 1 B-tree keyed by chunk offset.

use super::decoder::{malformed, Decoder};
use super::messages::{Link, LinkTarget};
use super::raw::RawFile;
use crate::error::H5LensError;

use bytes::Bytes;

/// Deepest tree accepted.
const MAX_DEPTH: u8 = 64;

/// A local heap's data segment.
pub struct LocalHeap {
    data: Bytes,
}

impl LocalHeap {
    pub fn read(file: &RawFile, address: u64) -> Result<Self, H5LensError> {
        let sizes = file.sizes;
        let mut d = file.decoder(
            address,
            8 + 2 * u64::from(sizes.length) + u64::from(sizes.offset),
        )?;
        d.signature(b"HEAP")?;
        // Version and reserved bytes
        d.skip(4)?;
        let size = d.length(sizes)?;
        // Free list head
        d.length(sizes)?;
        let data_address = d
            .address(sizes)?
            .ok_or_else(|| malformed("local heap without data"))?;
        Ok(LocalHeap {
            data: file.read(data_address, size)?,
        })
    }

    /// The null terminated string at `offset`.
    pub fn string(&self, offset: u64) -> Result<String, H5LensError> {
        let offset = usize::try_from(offset)?;
        if offset >= self.data.len() {
            return Err(malformed(format!("local heap offset {offset} out of range")));
        }
        Decoder::new(self.data.slice(offset..)).cstring()
    }
}

/// One node of a version 1 B-tree.
struct Node {
    level: u8,
    keys: Vec<Bytes>,
    children: Vec<u64>,
}

fn read_node(
    file: &RawFile,
    address: u64,
    node_type: u8,
    key_size: usize,
) -> Result<Node, H5LensError> {
    let sizes = file.sizes;
    let offset_size = usize::from(sizes.offset);
    let header = 8 + 2 * offset_size;
    let mut d = file.decoder(address, header as u64)?;
    d.signature(b"TREE")?;
    let found = d.u8()?;
    if found != node_type {
        return Err(malformed(format!(
            "B-tree node type {found}, expected {node_type}"
        )));
    }
    let level = d.u8()?;
    let entries = usize::from(d.u16()?);
    let body = (entries + 1) * key_size + entries * offset_size;
    let mut d = file.decoder(address + header as u64, body as u64)?;
    let mut keys = Vec::with_capacity(entries + 1);
    let mut children = Vec::with_capacity(entries);
    for _ in 0..entries {
        keys.push(d.take(key_size)?);
        children.push(
            d.address(sizes)?
                .ok_or_else(|| malformed("B-tree child without an address"))?,
        );
    }
    keys.push(d.take(key_size)?);
    Ok(Node {
        level,
        keys,
        children,
    })
}

/// Members of a group indexed by a symbol table.
pub fn symbol_table_links(
    file: &RawFile,
    btree: u64,
    heap: u64,
) -> Result<Vec<Link>, H5LensError> {
    let heap = LocalHeap::read(file, heap)?;
    let key_size = usize::from(file.sizes.length);
    let mut links = vec![];
    let mut pending = vec![(btree, MAX_DEPTH)];
    while let Some((address, depth)) = pending.pop() {
        let node = read_node(file, address, 0, key_size)?;
        if node.level == 0 {
            for child in node.children {
                read_symbol_node(file, &heap, child, &mut links)?;
            }
        } else if depth == 0 {
            return Err(malformed("group B-tree is too deep"));
        } else {
            pending.extend(node.children.into_iter().rev().map(|c| (c, depth - 1)));
        }
    }
    Ok(links)
}

fn read_symbol_node(
    file: &RawFile,
    heap: &LocalHeap,
    address: u64,
    links: &mut Vec<Link>,
) -> Result<(), H5LensError> {
    let sizes = file.sizes;
    let mut d = file.decoder(address, 8)?;
    d.signature(b"SNOD")?;
    // Version and reserved byte
    d.skip(2)?;
    let count = u64::from(d.u16()?);
    let entry_size = 2 * u64::from(sizes.offset) + 24;
    let mut d = file.decoder(address + 8, count * entry_size)?;
    for _ in 0..count {
        let name = heap.string(d.length(sizes)?)?;
        let header = d.address(sizes)?;
        let cache_type = d.u32()?;
        d.skip(4)?;
        let mut scratch = Decoder::new(d.take(16)?);
        let target = match (cache_type, header) {
            (2, _) => LinkTarget::Soft(heap.string(u64::from(scratch.u32()?))?),
            (_, Some(header)) => LinkTarget::Hard(header),
            (_, None) => return Err(malformed(format!("symbol {name} has no object header"))),
        };
        links.push(Link { name, target });
    }
    Ok(())
}

/// Location and filter state of one stored chunk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkLocation {
    pub address: u64,
    /// Stored size in bytes
    pub size: u64,
    /// Filters skipped for this chunk
    pub filter_mask: u32,
}

/// A decoded chunk key: stored size, filter mask and the offset of the chunk's first element.
fn chunk_key(key: &Bytes, rank: usize) -> Result<(u32, u32, Vec<u64>), H5LensError> {
    let mut d = Decoder::new(key.clone());
    let size = d.u32()?;
    let mask = d.u32()?;
    let mut offset = Vec::with_capacity(rank);
    for _ in 0..rank {
        offset.push(d.u64()?);
    }
    Ok((size, mask, offset))
}

/// Find the chunks of a version 1 chunk B-tree whose first element lies between `low` and
/// `high` in every axis. Subtrees entirely outside that range in index order are not read.
pub fn chunks_in(
    file: &RawFile,
    root: u64,
    rank: usize,
    low: &[u64],
    high: &[u64],
) -> Result<Vec<(Vec<u64>, ChunkLocation)>, H5LensError> {
    let key_size = 8 + 8 * (rank + 1);
    let mut found = vec![];
    let mut pending = vec![(root, MAX_DEPTH)];
    while let Some((address, depth)) = pending.pop() {
        let node = read_node(file, address, 1, key_size)?;
        let count = node.children.len();
        for (n, child) in node.children.iter().enumerate() {
            let (size, filter_mask, offset) = chunk_key(&node.keys[n], rank)?;
            if node.level == 0 {
                let inside = offset
                    .iter()
                    .zip(low.iter().zip(high))
                    .all(|(o, (l, h))| l <= o && o <= h);
                if inside {
                    found.push((
                        offset,
                        ChunkLocation {
                            address: *child,
                            size: u64::from(size),
                            filter_mask,
                        },
                    ));
                }
                continue;
            }
            if offset.as_slice() > high {
                continue;
            }
            if n + 1 < count {
                let (_, _, next) = chunk_key(&node.keys[n + 1], rank)?;
                if next.as_slice() < low {
                    continue;
                }
            }
            if depth == 0 {
                return Err(malformed("chunk B-tree is too deep"));
            }
            pending.push((*child, depth - 1));
        }
    }
    Ok(found)
}
