//! Writes small HDF5 files for tests, in the classic format (symbol tables, version 1 headers
//! and B-trees) and the latest format (link messages, version 2 headers and the newer chunk
//! indexes).
//!
//! Checksums are written as zeros.

use super::decoder::{encoded_width, pad8};
use super::filters::shuffle::test_utils::shuffle;
use super::filters::{FilterPipeline, DEFLATE, FLETCHER32, SHUFFLE};
use super::object_header::{
    ATTRIBUTE, ATTRIBUTE_INFO, CONTINUATION, DATASPACE, DATATYPE, FILL_VALUE, FILTER_PIPELINE,
    LAYOUT, LINK, LINK_INFO, SYMBOL_TABLE,
};

use bytes::Bytes;
use flate2::read::ZlibEncoder;
use flate2::Compression;
use std::io::Read;

/// Size of a stored variable length element with eight byte addresses.
pub const VLEN_SIZE: usize = 16;

const UNDEFINED: u64 = u64::MAX;

/// Space kept at the start of the file for the superblock.
const SUPERBLOCK_SPACE: usize = 96;

/// Messages kept in the first block of an object header. The rest go to a continuation block.
const FIRST_BLOCK_MESSAGES: usize = 3;

/// Entries per symbol table node and per version 1 B-tree node.
const NODE_ENTRIES: usize = 8;

const HEAP_WIDTH: u64 = 4;
const HEAP_MAX_DIRECT: u64 = 64 * 1024;
const HEAP_ID_LEN: usize = 8;
/// Signature, version, heap header address and block offset of a direct block.
const HEAP_BLOCK_PREFIX: u64 = 5 + 8 + 4;
const DENSE_BLOCK_SIZE: u64 = 512;
const DENSE_NODE_SIZE: u32 = 512;

const EA_MAX_BITS: u8 = 32;
const EA_INDEX_ENTRIES: u8 = 4;
const EA_MIN_ENTRIES: u8 = 16;
const EA_MIN_POINTERS: u8 = 4;
const EA_PAGE_BITS: u8 = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flavour {
    Classic,
    Latest,
}

/// A stored chunk as recorded by a chunk index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoredChunk {
    pub address: u64,
    pub size: u64,
    pub filter_mask: u32,
}

/// Target of a symbol table entry.
#[derive(Clone, Debug)]
pub enum Entry {
    Hard(u64),
    Soft(String),
}

/// Chunk index of a chunked dataset.
#[derive(Clone, Debug)]
pub enum Index {
    BTreeV1,
    Single,
    Implicit,
    FixedArray { page_bits: u8 },
    ExtensibleArray,
    BTreeV2 { node_size: u32 },
}

fn uint(value: u64, width: usize) -> Vec<u8> {
    value.to_le_bytes()[..width].to_vec()
}

fn address(value: Option<u64>) -> [u8; 8] {
    value.unwrap_or(UNDEFINED).to_le_bytes()
}

fn cstring(name: &str) -> Vec<u8> {
    let mut out = name.as_bytes().to_vec();
    out.push(0);
    out
}

/// Null terminated and padded to a multiple of eight bytes.
fn padded_name(name: &str) -> Vec<u8> {
    let mut out = cstring(name);
    out.resize(pad8(out.len()), 0);
    out
}

/// Element size recorded in an encoded datatype.
fn datatype_size(datatype: &[u8]) -> usize {
    u32::from_le_bytes(datatype[4..8].try_into().unwrap()) as usize
}

pub fn int_type(size: u32, signed: bool) -> Vec<u8> {
    let mut out = vec![0x10, if signed { 0x08 } else { 0 }, 0, 0];
    out.extend(size.to_le_bytes());
    out.extend(0_u16.to_le_bytes());
    out.extend((size as u16 * 8).to_le_bytes());
    out
}

pub fn float_type(size: u32) -> Vec<u8> {
    let (exponent_location, exponent_size, mantissa_size, bias): (u8, u8, u8, u32) = match size {
        2 => (10, 5, 10, 15),
        4 => (23, 8, 23, 127),
        _ => (52, 11, 52, 1023),
    };
    let mut out = vec![0x11, 0x20, (size * 8 - 1) as u8, 0];
    out.extend(size.to_le_bytes());
    out.extend(0_u16.to_le_bytes());
    out.extend((size as u16 * 8).to_le_bytes());
    out.extend([exponent_location, exponent_size, 0, mantissa_size]);
    out.extend(bias.to_le_bytes());
    out
}

pub fn string_type(size: u32, padding: u8, utf8: bool) -> Vec<u8> {
    let mut out = vec![0x13, padding | (u8::from(utf8) << 4), 0, 0];
    out.extend(size.to_le_bytes());
    out
}

pub fn vlen_string_type(utf8: bool) -> Vec<u8> {
    let mut out = vec![0x19, 0x01, u8::from(utf8), 0];
    out.extend((VLEN_SIZE as u32).to_le_bytes());
    out.extend(int_type(1, false));
    out
}

pub fn enum_type(names: &[&str], version: u8) -> Vec<u8> {
    let mut out = vec![(version << 4) | 8, names.len() as u8, 0, 0];
    out.extend(1_u32.to_le_bytes());
    out.extend(int_type(1, true));
    for name in names {
        out.extend(if version >= 3 {
            cstring(name)
        } else {
            padded_name(name)
        });
    }
    out.extend((0..names.len()).map(|value| value as u8));
    out
}

/// The enumeration h5py writes for booleans.
pub fn bool_type() -> Vec<u8> {
    enum_type(&["FALSE", "TRUE"], 3)
}

pub fn compound_type(version: u8, members: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let size: usize = members.iter().map(|(_, datatype)| datatype_size(datatype)).sum();
    let mut out = vec![(version << 4) | 6, members.len() as u8, 0, 0];
    out.extend((size as u32).to_le_bytes());
    let mut offset = 0;
    for (name, datatype) in members {
        match version {
            1 => {
                out.extend(padded_name(name));
                out.extend((offset as u32).to_le_bytes());
                // Rank, reserved, permutation, reserved and four dimensions
                out.extend([0; 1 + 3 + 4 + 4 + 16]);
            }
            2 => {
                out.extend(padded_name(name));
                out.extend((offset as u32).to_le_bytes());
            }
            _ => {
                out.extend(cstring(name));
                out.extend(uint(offset as u64, encoded_width(size as u64)));
            }
        }
        out.extend(datatype);
        offset += datatype_size(datatype);
    }
    out
}

/// Complex numbers as h5py writes them.
pub fn complex_type(version: u8) -> Vec<u8> {
    compound_type(version, &[("r", float_type(8)), ("i", float_type(8))])
}

pub fn array_type(dims: &[u32], base: Vec<u8>) -> Vec<u8> {
    let count: u32 = dims.iter().product();
    let mut out = vec![0x3a, 0, 0, 0];
    out.extend((count * datatype_size(&base) as u32).to_le_bytes());
    out.push(dims.len() as u8);
    for dim in dims {
        out.extend(dim.to_le_bytes());
    }
    out.extend(base);
    out
}

pub fn dataspace(version: u8, dims: &[u64], max_dims: Option<&[Option<u64>]>) -> Vec<u8> {
    let flags = u8::from(max_dims.is_some());
    let rank = dims.len() as u8;
    let mut out = match version {
        1 => vec![1, rank, flags, 0, 0, 0, 0, 0],
        _ => vec![2, rank, flags, u8::from(!dims.is_empty())],
    };
    for dim in dims {
        out.extend(dim.to_le_bytes());
    }
    for max in max_dims.unwrap_or_default() {
        out.extend(address(*max));
    }
    out
}

pub fn fill_value(value: Option<&Bytes>) -> Vec<u8> {
    // Early allocation, fill written when set
    match value {
        Some(value) => {
            let mut out = vec![2, 2, 2, 1];
            out.extend((value.len() as u32).to_le_bytes());
            out.extend(value);
            out
        }
        None => vec![2, 2, 2, 0],
    }
}

pub fn hard_link(name: &str, target: u64) -> Vec<u8> {
    let mut out = vec![1, 0, name.len() as u8];
    out.extend(name.as_bytes());
    out.extend(target.to_le_bytes());
    out
}

pub fn soft_link(name: &str, target: &str) -> Vec<u8> {
    let mut out = vec![1, 0x08, 1, name.len() as u8];
    out.extend(name.as_bytes());
    out.extend((target.len() as u16).to_le_bytes());
    out.extend(target.as_bytes());
    out
}

/// Link info message. Attribute info messages share its layout.
pub fn link_info(dense: Option<(u64, u64)>) -> Vec<u8> {
    let mut out = vec![0, 0];
    out.extend(address(dense.map(|(heap, _)| heap)));
    out.extend(address(dense.map(|(_, name_index)| name_index)));
    out
}

fn attribute(flavour: Flavour, name: &str, datatype: &[u8], shape: &[u64], data: &[u8]) -> Vec<u8> {
    let (version, space) = match flavour {
        Flavour::Classic => (1, dataspace(1, shape, None)),
        Flavour::Latest => (3, dataspace(2, shape, None)),
    };
    let name = cstring(name);
    let mut out = vec![version, 0];
    for part in [&name[..], datatype, &space] {
        out.extend((part.len() as u16).to_le_bytes());
    }
    if version == 1 {
        for part in [&name[..], datatype, &space] {
            out.extend(part);
            out.resize(pad8(out.len()), 0);
        }
    } else {
        // ASCII name
        out.push(0);
        out.extend(name);
        out.extend(datatype);
        out.extend(space);
    }
    out.extend(data);
    out
}

pub fn filter_pipeline(version: u8, filters: &[(u16, Vec<u32>)]) -> Vec<u8> {
    let mut out = vec![version, filters.len() as u8];
    if version == 1 {
        out.extend([0; 6]);
    }
    for (id, values) in filters {
        out.extend(id.to_le_bytes());
        if version == 1 || *id >= 256 {
            out.extend(0_u16.to_le_bytes());
        }
        // Flags
        out.extend(0_u16.to_le_bytes());
        out.extend((values.len() as u16).to_le_bytes());
        for value in values {
            out.extend(value.to_le_bytes());
        }
        if version == 1 && values.len() % 2 == 1 {
            out.extend([0; 4]);
        }
    }
    out
}

/// Apply a pipeline as a writer would. Fletcher32 appends a zero checksum.
pub fn apply_filters(pipeline: &FilterPipeline, data: &[u8], element_size: usize) -> Vec<u8> {
    let mut data = data.to_vec();
    for filter in &pipeline.0 {
        data = match filter.id {
            SHUFFLE => {
                let size = filter
                    .client_data
                    .first()
                    .map_or(element_size, |size| *size as usize);
                shuffle(&Bytes::from(std::mem::take(&mut data)), size).to_vec()
            }
            DEFLATE => {
                let level = filter.client_data.first().copied().unwrap_or(6);
                let mut compressed = vec![];
                ZlibEncoder::new(&data[..], Compression::new(level))
                    .read_to_end(&mut compressed)
                    .unwrap();
                compressed
            }
            FLETCHER32 => {
                let mut checked = std::mem::take(&mut data);
                checked.extend([0; 4]);
                checked
            }
            other => panic!("no test encoder for filter {other}"),
        };
    }
    data
}

pub fn compact_layout(data: &[u8]) -> Vec<u8> {
    let mut out = vec![3, 0];
    out.extend((data.len() as u16).to_le_bytes());
    out.extend(data);
    out
}

pub fn contiguous_layout(at: Option<u64>, size: u64) -> Vec<u8> {
    let mut out = vec![3, 1];
    out.extend(address(at));
    out.extend(size.to_le_bytes());
    out
}

/// Chunked layout message: version 3 for version 1 B-trees, version 4 otherwise.
pub fn chunked_layout(
    chunk: &[u64],
    element_size: u32,
    index: &Index,
    at: Option<u64>,
    filtered: Option<(u64, u32)>,
) -> Vec<u8> {
    let rank = chunk.len() as u8 + 1;
    if let Index::BTreeV1 = index {
        let mut out = vec![3, 2, rank];
        out.extend(address(at));
        for extent in chunk {
            out.extend((*extent as u32).to_le_bytes());
        }
        out.extend(element_size.to_le_bytes());
        return out;
    }
    let flags = if filtered.is_some() { 0x02 } else { 0 };
    let mut out = vec![4, 2, flags, rank, 4];
    for extent in chunk {
        out.extend((*extent as u32).to_le_bytes());
    }
    out.extend(element_size.to_le_bytes());
    match index {
        Index::Single => {
            out.push(1);
            if let Some((size, mask)) = filtered {
                out.extend(size.to_le_bytes());
                out.extend(mask.to_le_bytes());
            }
        }
        Index::Implicit => out.push(2),
        Index::FixedArray { page_bits } => out.extend([3, *page_bits]),
        Index::ExtensibleArray => out.extend([
            4,
            EA_MAX_BITS,
            EA_INDEX_ENTRIES,
            EA_MIN_POINTERS,
            EA_MIN_ENTRIES,
            EA_PAGE_BITS,
        ]),
        Index::BTreeV2 { node_size } => {
            out.push(5);
            out.extend(node_size.to_le_bytes());
            out.extend([100, 40]);
        }
        Index::BTreeV1 => unreachable!(),
    }
    out.extend(address(at));
    out
}

fn chunk_entry(chunk: Option<&StoredChunk>, filtered: bool) -> Vec<u8> {
    let mut out = address(chunk.map(|chunk| chunk.address)).to_vec();
    if filtered {
        out.extend((chunk.map_or(0, |chunk| chunk.size) as u32).to_le_bytes());
        out.extend(chunk.map_or(0, |chunk| chunk.filter_mask).to_le_bytes());
    }
    out
}

/// Every position of a grid, slowest axis first.
fn grid_positions(extents: &[u64]) -> Vec<Vec<u64>> {
    let mut positions = vec![vec![]];
    for extent in extents {
        positions = positions
            .into_iter()
            .flat_map(|prefix: Vec<u64>| {
                (0..*extent).map(move |n| {
                    let mut position = prefix.clone();
                    position.push(n);
                    position
                })
            })
            .collect();
    }
    positions
}

/// Record capacity of version 2 B-tree nodes, computed as readers do.
struct TreeShape {
    node_size: usize,
    count_width: usize,
    /// Per depth: records in a full node, records below a full node and the width of that total
    levels: Vec<(usize, u64, usize)>,
}

impl TreeShape {
    fn new(node_size: usize, record_size: usize, records: usize) -> Self {
        let leaf = (node_size - 10) / record_size;
        let count_width = encoded_width(leaf as u64);
        let mut levels = vec![(leaf, leaf as u64, 0)];
        while levels[levels.len() - 1].1 < records as u64 {
            let depth = levels.len();
            let below = levels[depth - 1];
            let pointer = 8 + count_width + if depth > 1 { below.2 } else { 0 };
            let max = (node_size.saturating_sub(10 + pointer)) / (record_size + pointer);
            assert!(max > 0, "{node_size} byte nodes cannot hold {records} records");
            let capacity = (max as u64 + 1) * below.1 + max as u64;
            levels.push((max, capacity, encoded_width(capacity)));
        }
        TreeShape {
            node_size,
            count_width,
            levels,
        }
    }
}

/// Ids of objects stored in a fractal heap.
pub struct HeapObjects {
    pub address: u64,
    pub ids: Vec<Vec<u8>>,
}

pub struct LocalHeapInfo {
    pub address: u64,
    /// Offset of each string
    pub offsets: Vec<u64>,
}

fn heap_header(start_block_size: u64, root: Option<u64>, rows: u16, objects: usize) -> Vec<u8> {
    let mut out = b"FRHP".to_vec();
    out.push(0);
    out.extend((HEAP_ID_LEN as u16).to_le_bytes());
    // No filters, no flags
    out.extend([0, 0, 0]);
    out.extend(4096_u32.to_le_bytes());
    out.extend(0_u64.to_le_bytes());
    out.extend(UNDEFINED.to_le_bytes());
    out.extend(0_u64.to_le_bytes());
    out.extend(UNDEFINED.to_le_bytes());
    for value in [0, 0, 0, objects as u64, 0, 0, 0, 0] {
        out.extend(value.to_le_bytes());
    }
    out.extend((HEAP_WIDTH as u16).to_le_bytes());
    out.extend(start_block_size.to_le_bytes());
    out.extend(HEAP_MAX_DIRECT.to_le_bytes());
    // Heap offsets are four bytes wide.
    out.extend(32_u16.to_le_bytes());
    out.extend(1_u16.to_le_bytes());
    out.extend(address(root));
    out.extend(rows.to_le_bytes());
    out.extend([0; 4]);
    out
}

/// An HDF5 file under construction. Structures are appended and addressed by their offset.
pub struct Buffer {
    data: Vec<u8>,
    base: u64,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer {
            data: vec![0; SUPERBLOCK_SPACE],
            base: 0,
        }
    }
}

impl Buffer {
    fn push(&mut self, bytes: &[u8]) -> u64 {
        let at = self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        at
    }

    fn patch(&mut self, at: u64, bytes: &[u8]) {
        let at = at as usize;
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Write the superblock and return the file.
    pub fn finish_with_root(mut self, root: u64, flavour: Flavour) -> Vec<u8> {
        let eof = self.data.len() as u64;
        let mut superblock = b"\x89HDF\r\n\x1a\n".to_vec();
        match flavour {
            Flavour::Classic => {
                superblock.extend([0, 0, 0, 0, 0, 8, 8, 0]);
                // Leaf and internal node K, flags
                superblock.extend(4_u16.to_le_bytes());
                superblock.extend(16_u16.to_le_bytes());
                superblock.extend(0_u32.to_le_bytes());
                for value in [self.base, UNDEFINED, eof, UNDEFINED] {
                    superblock.extend(value.to_le_bytes());
                }
                // Root symbol table entry
                superblock.extend(0_u64.to_le_bytes());
                superblock.extend(root.to_le_bytes());
                superblock.extend([0; 8 + 16]);
            }
            Flavour::Latest => {
                superblock.extend([2, 8, 8, 0]);
                for value in [self.base, UNDEFINED, eof, root] {
                    superblock.extend(value.to_le_bytes());
                }
                superblock.extend([0; 4]);
            }
        }
        self.patch(0, &superblock);
        self.data
    }

    pub fn object_header_v1(&mut self, messages: &[(u16, Vec<u8>)]) -> u64 {
        let flagged: Vec<(u16, Vec<u8>, u8)> = messages
            .iter()
            .map(|(kind, data)| (*kind, data.clone(), 0))
            .collect();
        self.object_header_v1_flags(&flagged)
    }

    pub fn object_header_v1_flags(&mut self, messages: &[(u16, Vec<u8>, u8)]) -> u64 {
        let encode = |kind: u16, data: &[u8], flags: u8| {
            let padded = pad8(data.len());
            let mut out = kind.to_le_bytes().to_vec();
            out.extend((padded as u16).to_le_bytes());
            out.extend([flags, 0, 0, 0]);
            out.extend(data);
            out.resize(8 + padded, 0);
            out
        };
        let split = messages.len().min(FIRST_BLOCK_MESSAGES);
        let (first, rest) = messages.split_at(split);
        let mut body: Vec<u8> = first
            .iter()
            .flat_map(|(kind, data, flags)| encode(*kind, data, *flags))
            .collect();
        let mut count = first.len();
        if !rest.is_empty() {
            let block: Vec<u8> = rest
                .iter()
                .flat_map(|(kind, data, flags)| encode(*kind, data, *flags))
                .collect();
            let at = self.push(&block);
            let mut continuation = at.to_le_bytes().to_vec();
            continuation.extend((block.len() as u64).to_le_bytes());
            body.extend(encode(CONTINUATION, &continuation, 0));
            count += rest.len() + 1;
        }
        let mut header = vec![1, 0];
        header.extend((count as u16).to_le_bytes());
        header.extend(1_u32.to_le_bytes());
        header.extend((body.len() as u32).to_le_bytes());
        header.extend([0; 4]);
        header.extend(body);
        self.push(&header)
    }

    pub fn object_header_v2(&mut self, messages: &[(u16, Vec<u8>)]) -> u64 {
        let encode = |kind: u16, data: &[u8]| {
            let mut out = vec![kind as u8];
            out.extend((data.len() as u16).to_le_bytes());
            out.push(0);
            out.extend(data);
            out
        };
        let split = messages.len().min(FIRST_BLOCK_MESSAGES);
        let (first, rest) = messages.split_at(split);
        let mut body: Vec<u8> = first
            .iter()
            .flat_map(|(kind, data)| encode(*kind, data))
            .collect();
        if !rest.is_empty() {
            let mut block = b"OCHK".to_vec();
            for (kind, data) in rest {
                block.extend(encode(*kind, data));
            }
            block.extend([0; 4]);
            let at = self.push(&block);
            let mut continuation = at.to_le_bytes().to_vec();
            continuation.extend((block.len() as u64).to_le_bytes());
            body.extend(encode(CONTINUATION, &continuation));
        }
        let mut header = b"OHDR".to_vec();
        // Version, then a four byte chunk size
        header.extend([2, 0x02]);
        header.extend((body.len() as u32).to_le_bytes());
        header.extend(body);
        header.extend([0; 4]);
        self.push(&header)
    }

    /// A local heap holding the empty string at offset zero, then `strings`.
    pub fn local_heap(&mut self, strings: &[&str]) -> LocalHeapInfo {
        let mut segment = vec![0; 8];
        let mut offsets = vec![];
        for string in strings {
            offsets.push(segment.len() as u64);
            segment.extend(padded_name(string));
        }
        let data = self.push(&segment);
        let mut header = b"HEAP".to_vec();
        header.extend([0; 4]);
        header.extend((segment.len() as u64).to_le_bytes());
        header.extend(UNDEFINED.to_le_bytes());
        header.extend(data.to_le_bytes());
        LocalHeapInfo {
            address: self.push(&header),
            offsets,
        }
    }

    /// A group symbol table. Returns the B-tree and local heap addresses.
    pub fn symbol_table(&mut self, entries: &[(String, Entry)]) -> (u64, u64) {
        let mut entries: Vec<&(String, Entry)> = entries.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut strings: Vec<&str> = vec![];
        for (name, entry) in &entries {
            strings.push(name.as_str());
            if let Entry::Soft(target) = entry {
                strings.push(target.as_str());
            }
        }
        let heap = self.local_heap(&strings);
        let mut offsets = heap.offsets.iter().copied();
        let mut symbols = vec![];
        for (_, entry) in &entries {
            let name = offsets.next().unwrap();
            let mut symbol = name.to_le_bytes().to_vec();
            match entry {
                Entry::Hard(target) => {
                    symbol.extend(target.to_le_bytes());
                    symbol.extend([0; 8 + 16]);
                }
                Entry::Soft(_) => {
                    let target = offsets.next().unwrap();
                    symbol.extend(UNDEFINED.to_le_bytes());
                    symbol.extend(2_u32.to_le_bytes());
                    symbol.extend([0; 4]);
                    symbol.extend((target as u32).to_le_bytes());
                    symbol.extend([0; 12]);
                }
            }
            symbols.push((name, symbol));
        }
        let mut nodes = vec![];
        for node in symbols.chunks(NODE_ENTRIES) {
            let mut snod = b"SNOD".to_vec();
            snod.extend([1, 0]);
            snod.extend((node.len() as u16).to_le_bytes());
            for (_, symbol) in node {
                snod.extend(symbol);
            }
            nodes.push((node[node.len() - 1].0, self.push(&snod)));
        }
        // Each child is followed by the heap offset of its last name.
        let mut tree = b"TREE".to_vec();
        tree.extend([0, 0]);
        tree.extend((nodes.len() as u16).to_le_bytes());
        tree.extend(UNDEFINED.to_le_bytes());
        tree.extend(UNDEFINED.to_le_bytes());
        tree.extend(0_u64.to_le_bytes());
        for (last, child) in &nodes {
            tree.extend(child.to_le_bytes());
            tree.extend(last.to_le_bytes());
        }
        (self.push(&tree), heap.address)
    }

    /// A version 1 chunk B-tree, keyed by the offset of each chunk's first element.
    pub fn chunk_btree_v1(&mut self, chunks: &[(Vec<u64>, StoredChunk)], rank: usize) -> u64 {
        let mut chunks = chunks.to_vec();
        chunks.sort_by(|a, b| a.0.cmp(&b.0));
        let key = |offset: &[u64], chunk: Option<&StoredChunk>| {
            let mut out = (chunk.map_or(0, |chunk| chunk.size) as u32).to_le_bytes().to_vec();
            out.extend(chunk.map_or(0, |chunk| chunk.filter_mask).to_le_bytes());
            for value in offset {
                out.extend(value.to_le_bytes());
            }
            out.extend(0_u64.to_le_bytes());
            out
        };
        let last = chunks.last().map_or(vec![0; rank], |(offset, _)| offset.clone());
        let end = key(&last, None);
        let mut nodes: Vec<(Vec<u8>, u64)> = chunks
            .iter()
            .map(|(offset, chunk)| (key(offset, Some(chunk)), chunk.address))
            .collect();
        let mut level = 0;
        loop {
            nodes = self.chunk_tree_level(level, &nodes, &end);
            if nodes.len() == 1 {
                return nodes[0].1;
            }
            level += 1;
        }
    }

    /// Write one level of a chunk B-tree. Returns the first key and address of each node.
    fn chunk_tree_level(&mut self, level: u8, entries: &[(Vec<u8>, u64)], end: &[u8]) -> Vec<(Vec<u8>, u64)> {
        let mut written = vec![];
        let groups: Vec<&[(Vec<u8>, u64)]> = if entries.is_empty() {
            vec![&[]]
        } else {
            entries.chunks(NODE_ENTRIES).collect()
        };
        for (n, group) in groups.iter().enumerate() {
            let next = entries
                .get((n + 1) * NODE_ENTRIES)
                .map_or(end, |(key, _)| key.as_slice());
            let mut node = b"TREE".to_vec();
            node.extend([1, level]);
            node.extend((group.len() as u16).to_le_bytes());
            node.extend(UNDEFINED.to_le_bytes());
            node.extend(UNDEFINED.to_le_bytes());
            for (key, child) in group.iter() {
                node.extend(key);
                node.extend(child.to_le_bytes());
            }
            node.extend(next);
            let first = group.first().map_or(end.to_vec(), |(key, _)| key.clone());
            written.push((first, self.push(&node)));
        }
        written
    }

    /// A version 2 B-tree holding `records`, which must already be in key order.
    pub fn btree_v2(&mut self, record_type: u8, record_size: usize, records: &[Vec<u8>], node_size: u32) -> u64 {
        assert!(records.iter().all(|record| record.len() == record_size));
        let shape = TreeShape::new(node_size as usize, record_size, records.len());
        let depth = shape.levels.len() - 1;
        let (root, count) = if records.is_empty() {
            (None, 0)
        } else {
            let (at, count) = self.btree_v2_node(&shape, record_type, records, depth);
            (Some(at), count)
        };
        let mut header = b"BTHD".to_vec();
        header.extend([0, record_type]);
        header.extend(node_size.to_le_bytes());
        header.extend((record_size as u16).to_le_bytes());
        header.extend((depth as u16).to_le_bytes());
        header.extend([100, 40]);
        header.extend(address(root));
        header.extend((count as u16).to_le_bytes());
        header.extend((records.len() as u64).to_le_bytes());
        header.extend([0; 4]);
        self.push(&header)
    }

    /// Write a subtree. Returns its address and the number of records in its top node.
    fn btree_v2_node(&mut self, shape: &TreeShape, record_type: u8, records: &[Vec<u8>], depth: usize) -> (u64, usize) {
        if depth == 0 {
            let mut node = b"BTLF".to_vec();
            node.extend([0, record_type]);
            for record in records {
                node.extend(record);
            }
            node.extend([0; 4]);
            node.resize(shape.node_size, 0);
            return (self.push(&node), records.len());
        }
        let below = shape.levels[depth - 1];
        // Fewest children that hold every record, the separators between them included.
        let children = (records.len() + 1).div_ceil(below.1 as usize + 1).max(1);
        let spread = records.len() + 1 - children;
        let mut separators = vec![];
        let mut pointers = vec![];
        let mut next = 0;
        for n in 0..children {
            let len = spread / children + usize::from(n < spread % children);
            let (at, count) =
                self.btree_v2_node(shape, record_type, &records[next..next + len], depth - 1);
            let mut pointer = at.to_le_bytes().to_vec();
            pointer.extend(uint(count as u64, shape.count_width));
            if depth > 1 {
                pointer.extend(uint(len as u64, below.2));
            }
            pointers.push(pointer);
            next += len;
            if n + 1 < children {
                separators.push(records[next].clone());
                next += 1;
            }
        }
        let mut node = b"BTIN".to_vec();
        node.extend([0, record_type]);
        for record in &separators {
            node.extend(record);
        }
        for pointer in &pointers {
            node.extend(pointer);
        }
        node.extend([0; 4]);
        assert!(node.len() <= shape.node_size);
        node.resize(shape.node_size, 0);
        (self.push(&node), separators.len())
    }

    /// A fractal heap holding `objects` in direct blocks, starting at `start_block_size` bytes
    /// and doubling by row. An indirect root block is written when more than one block is used.
    pub fn fractal_heap(&mut self, objects: &[Vec<u8>], start_block_size: u64) -> HeapObjects {
        let header = self.push(&heap_header(start_block_size, None, 0, objects.len()));
        let block_size = |row: u64| {
            if row == 0 {
                start_block_size
            } else {
                start_block_size << (row - 1)
            }
        };
        let row_start = |row: u64| {
            if row == 0 {
                0
            } else {
                (start_block_size * HEAP_WIDTH) << (row - 1)
            }
        };
        let heap_offset =
            |block: u64| row_start(block / HEAP_WIDTH) + (block % HEAP_WIDTH) * block_size(block / HEAP_WIDTH);

        let mut placed = vec![];
        let mut ids = vec![];
        let (mut block, mut used) = (0, HEAP_BLOCK_PREFIX);
        for object in objects {
            let len = object.len() as u64;
            loop {
                let size = block_size(block / HEAP_WIDTH);
                assert!(HEAP_BLOCK_PREFIX + len <= HEAP_MAX_DIRECT, "object of {len} bytes");
                if used + len <= size {
                    break;
                }
                block += 1;
                used = HEAP_BLOCK_PREFIX;
            }
            let mut id = vec![0];
            id.extend(uint(heap_offset(block) + used, 4));
            id.extend(uint(len, 2));
            id.resize(HEAP_ID_LEN, 0);
            ids.push(id);
            placed.push((block, used, object));
            used += len;
        }

        let mut children = vec![];
        for n in 0..=block {
            let mut contents = b"FHDB".to_vec();
            contents.push(0);
            contents.extend(header.to_le_bytes());
            contents.extend(uint(heap_offset(n), 4));
            contents.resize(block_size(n / HEAP_WIDTH) as usize, 0);
            for (_, at, object) in placed.iter().filter(|(b, _, _)| *b == n) {
                let at = *at as usize;
                contents[at..at + object.len()].copy_from_slice(object);
            }
            children.push(self.push(&contents));
        }
        let (root, rows) = if block == 0 {
            (children[0], 0)
        } else {
            let rows = block / HEAP_WIDTH + 1;
            let mut indirect = b"FHIB".to_vec();
            indirect.push(0);
            indirect.extend(header.to_le_bytes());
            indirect.extend(uint(0, 4));
            for n in 0..rows * HEAP_WIDTH {
                indirect.extend(address(children.get(n as usize).copied()));
            }
            indirect.extend([0; 4]);
            (self.push(&indirect), rows as u16)
        };
        self.patch(header, &heap_header(start_block_size, Some(root), rows, objects.len()));
        HeapObjects {
            address: header,
            ids,
        }
    }

    /// A global heap collection holding `strings`. Returns their stored variable length
    /// elements, back to back.
    pub fn global_heap(&mut self, strings: &[&str]) -> Vec<u8> {
        let mut objects = vec![];
        let mut indices = vec![];
        let mut index = 0_u16;
        for string in strings {
            if string.is_empty() {
                indices.push(0);
                continue;
            }
            index += 1;
            objects.extend(index.to_le_bytes());
            // Reference count and reserved bytes
            objects.extend([1, 0, 0, 0, 0, 0]);
            objects.extend((string.len() as u64).to_le_bytes());
            let mut data = string.as_bytes().to_vec();
            data.resize(pad8(data.len()), 0);
            objects.extend(data);
            indices.push(index);
        }
        // Free space
        objects.extend([0; 16]);
        let mut collection = b"GCOL".to_vec();
        collection.extend([1, 0, 0, 0]);
        collection.extend((16 + objects.len() as u64).to_le_bytes());
        collection.extend(objects);
        let at = self.push(&collection);
        let mut elements = vec![];
        for (string, index) in strings.iter().zip(indices) {
            elements.extend((string.len() as u32).to_le_bytes());
            elements.extend(at.to_le_bytes());
            elements.extend(u32::from(index).to_le_bytes());
        }
        elements
    }

    /// A fixed array chunk index. Entries are in linear chunk order.
    pub fn fixed_array(&mut self, entries: &[Option<StoredChunk>], filtered: bool, page_bits: u8) -> u64 {
        let header = self.push(&[0; 28]);
        let client = u8::from(filtered);
        let entry_size = if filtered { 16 } else { 8 };
        let mut block = b"FADB".to_vec();
        block.extend([0, client]);
        block.extend(header.to_le_bytes());
        let page = 1_usize << page_bits;
        if entries.len() > page {
            let pages: Vec<&[Option<StoredChunk>]> = entries.chunks(page).collect();
            let mut bitmap = vec![0_u8; pages.len().div_ceil(8)];
            for (n, page) in pages.iter().enumerate() {
                if page.iter().any(Option::is_some) {
                    bitmap[n / 8] |= 0x80 >> (n % 8);
                }
            }
            block.extend(bitmap);
            block.extend([0; 4]);
            for entries in pages {
                for n in 0..page {
                    block.extend(chunk_entry(entries.get(n).and_then(Option::as_ref), filtered));
                }
                block.extend([0; 4]);
            }
        } else {
            for entry in entries {
                block.extend(chunk_entry(entry.as_ref(), filtered));
            }
            block.extend([0; 4]);
        }
        let data_block = self.push(&block);
        let mut fahd = b"FAHD".to_vec();
        fahd.extend([0, client, entry_size, page_bits]);
        fahd.extend((entries.len() as u64).to_le_bytes());
        fahd.extend(data_block.to_le_bytes());
        fahd.extend([0; 4]);
        self.patch(header, &fahd);
        header
    }

    /// An extensible array chunk index. Entries are in linear chunk order.
    pub fn extensible_array(&mut self, entries: &[Option<StoredChunk>], filtered: bool) -> u64 {
        let header = self.push(&[0; 72]);
        let client = u8::from(filtered);
        let block_header = |signature: &[u8; 4], offset: Option<u64>| {
            let mut out = signature.to_vec();
            out.extend([0, client]);
            out.extend(header.to_le_bytes());
            if let Some(offset) = offset {
                out.extend(uint(offset, usize::from(EA_MAX_BITS).div_ceil(8)));
            }
            out
        };
        let index_entries = usize::from(EA_INDEX_ENTRIES);
        let rest = entries.get(index_entries..).unwrap_or(&[]);
        let index_super_blocks = 2 * EA_MIN_POINTERS.ilog2() as usize;
        let super_block_count = 1 + usize::from(EA_MAX_BITS) - EA_MIN_ENTRIES.ilog2() as usize;
        let mut index_data_blocks = vec![None; 2 * (usize::from(EA_MIN_POINTERS) - 1)];
        let mut super_blocks = vec![None; super_block_count - index_super_blocks];
        let (mut start, mut slot) = (0, 0);
        for n in 0..super_block_count {
            if start >= rest.len() {
                break;
            }
            let data_blocks = 1_usize << (n / 2);
            let block_entries = (1_usize << n.div_ceil(2)) * usize::from(EA_MIN_ENTRIES);
            let mut addresses = vec![];
            for _ in 0..data_blocks {
                if start < rest.len() {
                    let mut block = block_header(b"EADB", Some((index_entries + start) as u64));
                    for i in start..start + block_entries {
                        block.extend(chunk_entry(rest.get(i).and_then(Option::as_ref), filtered));
                    }
                    block.extend([0; 4]);
                    addresses.push(Some(self.push(&block)));
                } else {
                    addresses.push(None);
                }
                start += block_entries;
            }
            if n < index_super_blocks {
                for at in addresses {
                    index_data_blocks[slot] = at;
                    slot += 1;
                }
            } else {
                let mut block = block_header(b"EASB", Some(0));
                for at in &addresses {
                    block.extend(address(*at));
                }
                block.extend([0; 4]);
                super_blocks[n - index_super_blocks] = Some(self.push(&block));
            }
        }
        let mut index_block = block_header(b"EAIB", None);
        for n in 0..index_entries {
            index_block.extend(chunk_entry(entries.get(n).and_then(Option::as_ref), filtered));
        }
        for at in index_data_blocks.iter().chain(&super_blocks) {
            index_block.extend(address(*at));
        }
        index_block.extend([0; 4]);
        let index_block = self.push(&index_block);

        let mut eahd = b"EAHD".to_vec();
        eahd.extend([
            0,
            client,
            if filtered { 16 } else { 8 },
            EA_MAX_BITS,
            EA_INDEX_ENTRIES,
            EA_MIN_ENTRIES,
            EA_MIN_POINTERS,
            EA_PAGE_BITS,
        ]);
        for value in [0, 0, 0, 0, entries.len() as u64, entries.len() as u64] {
            eahd.extend(value.to_le_bytes());
        }
        eahd.extend(index_block.to_le_bytes());
        eahd.extend([0; 4]);
        self.patch(header, &eahd);
        header
    }

    /// A version 2 B-tree chunk index, keyed by scaled chunk offset.
    pub fn chunk_btree_v2(&mut self, chunks: &[(Vec<u64>, StoredChunk)], filtered: bool, node_size: u32) -> u64 {
        let mut chunks = chunks.to_vec();
        chunks.sort_by(|a, b| a.0.cmp(&b.0));
        let rank = chunks.first().map_or(0, |(scaled, _)| scaled.len());
        let records: Vec<Vec<u8>> = chunks
            .iter()
            .map(|(scaled, chunk)| {
                let mut record = chunk.address.to_le_bytes().to_vec();
                if filtered {
                    record.extend((chunk.size as u32).to_le_bytes());
                    record.extend(chunk.filter_mask.to_le_bytes());
                }
                for value in scaled {
                    record.extend(value.to_le_bytes());
                }
                record
            })
            .collect();
        let record_size = 8 + if filtered { 8 } else { 0 } + 8 * rank;
        let record_type = if filtered { 11 } else { 10 };
        self.btree_v2(record_type, record_size, &records, node_size)
    }

    fn group(&mut self, spec: &GroupSpec, flavour: Flavour) -> u64 {
        let mut targets = vec![];
        for (name, child) in &spec.children {
            let target = match child {
                Child::Group(group) => Entry::Hard(self.group(group, flavour)),
                Child::Dataset(dataset) => Entry::Hard(self.dataset(dataset, flavour)),
                Child::Soft(target) => Entry::Soft(target.clone()),
            };
            targets.push((name.clone(), target));
        }
        let attributes: Vec<Vec<u8>> = spec
            .attributes
            .iter()
            .map(|a| attribute(flavour, &a.name, &a.datatype, &a.shape, &a.data))
            .collect();
        if flavour == Flavour::Classic {
            let (btree, heap) = self.symbol_table(&targets);
            let mut table = btree.to_le_bytes().to_vec();
            table.extend(heap.to_le_bytes());
            let mut messages = vec![(SYMBOL_TABLE, table)];
            messages.extend(attributes.into_iter().map(|a| (ATTRIBUTE, a)));
            return self.object_header_v1(&messages);
        }
        let links: Vec<Vec<u8>> = targets
            .iter()
            .map(|(name, target)| match target {
                Entry::Hard(at) => hard_link(name, *at),
                Entry::Soft(path) => soft_link(name, path),
            })
            .collect();
        let mut messages = vec![];
        if spec.dense {
            // Records carry their position in place of a name hash.
            let heap = self.fractal_heap(&links, DENSE_BLOCK_SIZE);
            let records: Vec<Vec<u8>> = heap
                .ids
                .iter()
                .enumerate()
                .map(|(n, id)| {
                    let mut record = (n as u32).to_le_bytes().to_vec();
                    record.extend(id);
                    record
                })
                .collect();
            let tree = self.btree_v2(5, 4 + HEAP_ID_LEN, &records, DENSE_NODE_SIZE);
            messages.push((LINK_INFO, link_info(Some((heap.address, tree)))));

            let heap = self.fractal_heap(&attributes, DENSE_BLOCK_SIZE);
            let records: Vec<Vec<u8>> = heap
                .ids
                .iter()
                .enumerate()
                .map(|(n, id)| {
                    let mut record = id.clone();
                    record.push(0);
                    record.extend((n as u32).to_le_bytes());
                    record.extend((n as u32).to_le_bytes());
                    record
                })
                .collect();
            let tree = self.btree_v2(8, HEAP_ID_LEN + 9, &records, DENSE_NODE_SIZE);
            messages.push((ATTRIBUTE_INFO, link_info(Some((heap.address, tree)))));
        } else {
            messages.push((LINK_INFO, link_info(None)));
            messages.extend(links.into_iter().map(|link| (LINK, link)));
            messages.extend(attributes.into_iter().map(|a| (ATTRIBUTE, a)));
        }
        self.object_header_v2(&messages)
    }

    fn dataset(&mut self, spec: &DatasetSpec, flavour: Flavour) -> u64 {
        let element_size = datatype_size(&spec.datatype);
        let version = if flavour == Flavour::Classic { 1 } else { 2 };
        let max_dims: Option<Vec<Option<u64>>> = match &spec.storage {
            Storage::Chunked {
                index: Index::ExtensibleArray,
                ..
            } => Some(
                spec.shape
                    .iter()
                    .enumerate()
                    .map(|(axis, dim)| (axis > 0).then_some(*dim))
                    .collect(),
            ),
            Storage::Chunked {
                index: Index::BTreeV2 { .. },
                ..
            } => Some(vec![None; spec.shape.len()]),
            _ => None,
        };
        let layout = match &spec.storage {
            Storage::Compact => compact_layout(&spec.data),
            Storage::Contiguous => {
                let at = self.push(&spec.data);
                contiguous_layout(Some(at), spec.data.len() as u64)
            }
            Storage::Chunked { chunk, index } => self.chunks(spec, chunk, index, element_size),
        };
        let mut messages = vec![
            (DATASPACE, dataspace(version, &spec.shape, max_dims.as_deref())),
            (DATATYPE, spec.datatype.clone()),
            (FILL_VALUE, fill_value(spec.fill.as_ref())),
            (LAYOUT, layout),
        ];
        if !spec.filters.is_empty() {
            messages.push((FILTER_PIPELINE, filter_pipeline(version, &spec.filters)));
        }
        match flavour {
            Flavour::Classic => self.object_header_v1(&messages),
            Flavour::Latest => self.object_header_v2(&messages),
        }
    }

    /// Write the chunks of a dataset and their index. Returns the layout message.
    fn chunks(&mut self, spec: &DatasetSpec, chunk: &[u64], index: &Index, element_size: usize) -> Vec<u8> {
        let pipeline = FilterPipeline::decode(&Bytes::from(filter_pipeline(2, &spec.filters))).unwrap();
        let filtered = !spec.filters.is_empty();
        let fill = spec
            .fill
            .as_ref()
            .map_or_else(|| vec![0; element_size], |fill| fill.to_vec());
        let grid: Vec<u64> = spec.shape.iter().zip(chunk).map(|(d, c)| d.div_ceil(*c)).collect();
        let mut stored: Vec<(Vec<u64>, Option<StoredChunk>)> = vec![];
        for scaled in grid_positions(&grid) {
            if spec.missing.contains(&scaled) {
                stored.push((scaled, None));
                continue;
            }
            let mut raw = vec![];
            for within in grid_positions(chunk) {
                let element: Vec<u64> = within
                    .iter()
                    .zip(scaled.iter().zip(chunk))
                    .map(|(w, (s, c))| s * c + w)
                    .collect();
                if element.iter().zip(&spec.shape).all(|(e, d)| e < d) {
                    let linear = element
                        .iter()
                        .zip(&spec.shape)
                        .fold(0, |acc, (e, d)| acc * d + e) as usize;
                    raw.extend(&spec.data[linear * element_size..(linear + 1) * element_size]);
                } else {
                    raw.extend(&fill);
                }
            }
            let data = apply_filters(&pipeline, &raw, element_size);
            let at = self.push(&data);
            let location = StoredChunk {
                address: at,
                size: data.len() as u64,
                filter_mask: 0,
            };
            stored.push((scaled, Some(location)));
        }
        let written: Vec<(Vec<u64>, StoredChunk)> = stored
            .iter()
            .filter_map(|(scaled, chunk)| chunk.map(|chunk| (scaled.clone(), chunk)))
            .collect();
        let entries: Vec<Option<StoredChunk>> = stored.iter().map(|(_, chunk)| *chunk).collect();
        let first = written.first().map(|(_, chunk)| *chunk);
        let (at, single) = match index {
            Index::BTreeV1 => {
                let offsets: Vec<(Vec<u64>, StoredChunk)> = written
                    .iter()
                    .map(|(scaled, stored)| {
                        (scaled.iter().zip(chunk).map(|(s, c)| s * c).collect(), *stored)
                    })
                    .collect();
                (Some(self.chunk_btree_v1(&offsets, chunk.len())), None)
            }
            Index::Single => (
                first.map(|chunk| chunk.address),
                first
                    .filter(|_| filtered)
                    .map(|chunk| (chunk.size, chunk.filter_mask)),
            ),
            Index::Implicit => (first.map(|chunk| chunk.address), None),
            Index::FixedArray { page_bits } => {
                (Some(self.fixed_array(&entries, filtered, *page_bits)), None)
            }
            Index::ExtensibleArray => (Some(self.extensible_array(&entries, filtered)), None),
            Index::BTreeV2 { node_size } => {
                (Some(self.chunk_btree_v2(&written, filtered, *node_size)), None)
            }
        };
        chunked_layout(chunk, element_size as u32, index, at, single)
    }
}

#[derive(Clone, Debug)]
struct AttributeSpec {
    name: String,
    datatype: Vec<u8>,
    shape: Vec<u64>,
    data: Vec<u8>,
}

#[derive(Clone, Debug)]
enum Child {
    Group(GroupSpec),
    Dataset(DatasetSpec),
    Soft(String),
}

/// A group to write: its attributes and children, in insertion order.
#[derive(Clone, Debug, Default)]
pub struct GroupSpec {
    attributes: Vec<AttributeSpec>,
    children: Vec<(String, Child)>,
    dense: bool,
}

impl GroupSpec {
    pub fn with_attribute(mut self, name: &str, datatype: Vec<u8>, shape: &[u64], data: &[u8]) -> Self {
        self.attributes.push(AttributeSpec {
            name: name.to_string(),
            datatype,
            shape: shape.to_vec(),
            data: data.to_vec(),
        });
        self
    }

    pub fn with_group(mut self, name: &str, group: GroupSpec) -> Self {
        self.children.push((name.to_string(), Child::Group(group)));
        self
    }

    pub fn with_dataset(mut self, name: &str, dataset: DatasetSpec) -> Self {
        self.children.push((name.to_string(), Child::Dataset(dataset)));
        self
    }

    pub fn with_soft_link(mut self, name: &str, target: &str) -> Self {
        self.children.push((name.to_string(), Child::Soft(target.to_string())));
        self
    }

    /// Store links and attributes in fractal heaps. Only the latest format does this.
    pub fn dense(mut self) -> Self {
        self.dense = true;
        self
    }
}

#[derive(Clone, Debug)]
enum Storage {
    Compact,
    Contiguous,
    Chunked { chunk: Vec<u64>, index: Index },
}

/// A dataset to write, with its elements in row-major order.
#[derive(Clone, Debug)]
pub struct DatasetSpec {
    datatype: Vec<u8>,
    shape: Vec<u64>,
    data: Vec<u8>,
    storage: Storage,
    filters: Vec<(u16, Vec<u32>)>,
    fill: Option<Bytes>,
    missing: Vec<Vec<u64>>,
}

impl DatasetSpec {
    fn new(datatype: Vec<u8>, shape: &[u64], data: &[u8], storage: Storage) -> Self {
        DatasetSpec {
            datatype,
            shape: shape.to_vec(),
            data: data.to_vec(),
            storage,
            filters: vec![],
            fill: None,
            missing: vec![],
        }
    }

    pub fn contiguous(datatype: Vec<u8>, shape: &[u64], data: &[u8]) -> Self {
        Self::new(datatype, shape, data, Storage::Contiguous)
    }

    pub fn compact(datatype: Vec<u8>, shape: &[u64], data: &[u8]) -> Self {
        Self::new(datatype, shape, data, Storage::Compact)
    }

    pub fn chunked(datatype: Vec<u8>, shape: &[u64], data: &[u8], chunk: &[u64], index: Index) -> Self {
        let storage = Storage::Chunked {
            chunk: chunk.to_vec(),
            index,
        };
        Self::new(datatype, shape, data, storage)
    }

    pub fn with_filters(mut self, filters: &[(u16, Vec<u32>)]) -> Self {
        self.filters = filters.to_vec();
        self
    }

    pub fn with_fill(mut self, fill: Bytes) -> Self {
        self.fill = Some(fill);
        self
    }

    /// Leave chunks unwritten, by scaled offset.
    pub fn with_missing_chunks(mut self, missing: &[Vec<u64>]) -> Self {
        self.missing = missing.to_vec();
        self
    }
}

/// Writes a whole file from a root [GroupSpec].
pub struct FileWriter {
    flavour: Flavour,
    root: GroupSpec,
    base: u64,
}

impl FileWriter {
    pub fn new(flavour: Flavour) -> Self {
        FileWriter {
            flavour,
            root: GroupSpec::default(),
            base: 0,
        }
    }

    pub fn with_root(mut self, root: GroupSpec) -> Self {
        self.root = root;
        self
    }

    /// Record a base address, for files placed after a user block of that size.
    pub fn with_base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.finish_into(Buffer::default())
    }

    /// Write the tree after the structures `buffer` already holds.
    pub fn finish_into(self, mut buffer: Buffer) -> Vec<u8> {
        buffer.base = self.base;
        let root = buffer.group(&self.root, self.flavour);
        buffer.finish_with_root(root, self.flavour)
    }
}
