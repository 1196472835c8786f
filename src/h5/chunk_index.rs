//! Locating the stored chunks of a chunked dataset.
//!
//! Chunks are addressed by their scaled offset: the offset of their first element divided by
//! the chunk extent in each axis. Each index kind maps scaled offsets to stored chunks without
//! reading the parts of the index that cover chunks nobody asked for.

use super::btree::{self, ChunkLocation};
use super::btree2::BTree2;
use super::decoder::{malformed, Decoder};
use super::layout::ChunkIndexKind;
use super::raw::RawFile;
use crate::error::H5LensError;

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};

/// Record type of version 2 B-trees indexing unfiltered chunks.
const BTREE2_CHUNKS: u8 = 10;
/// Record type of version 2 B-trees indexing filtered chunks.
const BTREE2_FILTERED_CHUNKS: u8 = 11;

/// Chunk geometry of a dataset.
#[derive(Clone, Debug)]
pub struct ChunkGrid {
    /// Chunk extent of each axis
    pub chunk: Vec<u64>,
    pub dims: Vec<u64>,
    /// Maximum extent of each axis, `None` when unlimited
    pub max_dims: Option<Vec<Option<u64>>>,
    pub element_size: usize,
    /// Whether the dataset has a filter pipeline
    pub filtered: bool,
}

impl ChunkGrid {
    /// Size of an unfiltered chunk in bytes.
    pub fn chunk_bytes(&self) -> u64 {
        self.chunk.iter().product::<u64>() * self.element_size as u64
    }

    /// Number of chunks along each axis, at the maximum extent when one is fixed.
    fn max_chunks(&self) -> Vec<Option<u64>> {
        self.chunk
            .iter()
            .enumerate()
            .map(|(axis, chunk)| {
                let extent = match &self.max_dims {
                    Some(max_dims) => max_dims.get(axis).copied().flatten()?,
                    None => self.dims[axis],
                };
                Some(extent.div_ceil(*chunk))
            })
            .collect()
    }

    /// Position of a chunk in index order, with `order` listing the axes slowest first.
    fn linear(&self, scaled: &[u64], order: &[usize]) -> u64 {
        let max_chunks = self.max_chunks();
        let mut index = 0;
        for axis in order {
            let extent = max_chunks[*axis].unwrap_or(1);
            index = index * extent + scaled[*axis];
        }
        index
    }

    fn natural_order(&self) -> Vec<usize> {
        (0..self.chunk.len()).collect()
    }
}

/// Find the stored chunks among `wanted`, by scaled offset.
///
/// Chunks that were never written are absent from the result.
pub fn locate(
    file: &RawFile,
    kind: &ChunkIndexKind,
    address: u64,
    grid: &ChunkGrid,
    wanted: &[Vec<u64>],
) -> Result<HashMap<Vec<u64>, ChunkLocation>, H5LensError> {
    let mut found = HashMap::new();
    if wanted.is_empty() {
        return Ok(found);
    }
    let chunk_bytes = grid.chunk_bytes();
    match kind {
        ChunkIndexKind::Single { filtered } => {
            let (size, filter_mask) = filtered.unwrap_or((chunk_bytes, 0));
            let origin = vec![0; grid.chunk.len()];
            if wanted.contains(&origin) {
                found.insert(
                    origin,
                    ChunkLocation {
                        address,
                        size,
                        filter_mask,
                    },
                );
            }
        }
        ChunkIndexKind::Implicit => {
            let order = grid.natural_order();
            for scaled in wanted {
                let location = ChunkLocation {
                    address: address + grid.linear(scaled, &order) * chunk_bytes,
                    size: chunk_bytes,
                    filter_mask: 0,
                };
                found.insert(scaled.clone(), location);
            }
        }
        ChunkIndexKind::FixedArray => {
            let array = FixedArray::open(file, address)?;
            let order = grid.natural_order();
            for scaled in wanted {
                let entry = array.entry(file, grid.linear(scaled, &order))?;
                if let Some(location) = entry
                    .map(|raw| decode_entry(file, raw, grid, chunk_bytes))
                    .transpose()?
                    .flatten()
                {
                    found.insert(scaled.clone(), location);
                }
            }
        }
        ChunkIndexKind::ExtensibleArray => {
            let array = ExtensibleArray::open(file, address)?;
            let order = extensible_order(grid);
            for scaled in wanted {
                let entry = array.entry(file, grid.linear(scaled, &order))?;
                if let Some(location) = entry
                    .map(|raw| decode_entry(file, raw, grid, chunk_bytes))
                    .transpose()?
                    .flatten()
                {
                    found.insert(scaled.clone(), location);
                }
            }
        }
        ChunkIndexKind::BTreeV1 => {
            let (low, high) = bounds(wanted);
            let low: Vec<u64> = low.iter().zip(&grid.chunk).map(|(s, c)| s * c).collect();
            let high: Vec<u64> = high.iter().zip(&grid.chunk).map(|(s, c)| s * c).collect();
            let wanted: HashSet<&Vec<u64>> = wanted.iter().collect();
            for (offset, location) in btree::chunks_in(file, address, grid.chunk.len(), &low, &high)?
            {
                let scaled: Vec<u64> = offset.iter().zip(&grid.chunk).map(|(o, c)| o / c).collect();
                if wanted.contains(&scaled) {
                    found.insert(scaled, location);
                }
            }
        }
        ChunkIndexKind::BTreeV2 => {
            let tree = BTree2::open(file, address)?;
            let filtered = match tree.record_type {
                BTREE2_CHUNKS => false,
                BTREE2_FILTERED_CHUNKS => true,
                other => {
                    return Err(malformed(format!("B-tree record type {other} for chunks")))
                }
            };
            let rank = grid.chunk.len();
            let offset_size = usize::from(file.sizes.offset);
            let size_width = tree
                .record_size
                .checked_sub(offset_size + 4 + 8 * rank)
                .filter(|_| filtered)
                .unwrap_or(0);
            let decode = |record: &Bytes| -> Result<(Vec<u64>, Option<ChunkLocation>), H5LensError> {
                let mut d = Decoder::new(record.clone());
                let address = d.address(file.sizes)?;
                let (size, filter_mask) = if filtered {
                    (d.uint(size_width)?, d.u32()?)
                } else {
                    (chunk_bytes, 0)
                };
                let mut scaled = Vec::with_capacity(rank);
                for _ in 0..rank {
                    scaled.push(d.u64()?);
                }
                let location = address.map(|address| ChunkLocation {
                    address,
                    size,
                    filter_mask,
                });
                Ok((scaled, location))
            };
            let (low, high) = bounds(wanted);
            // Undecodable bounds keep the subtree, so the error surfaces below.
            let records = tree.records(file, |before, after| {
                let past_low = after
                    .map(|record| decode(record).map_or(true, |(scaled, _)| scaled >= low))
                    .unwrap_or(true);
                let before_high = before
                    .map(|record| decode(record).map_or(true, |(scaled, _)| scaled <= high))
                    .unwrap_or(true);
                past_low && before_high
            })?;
            let wanted: HashSet<&Vec<u64>> = wanted.iter().collect();
            for record in &records {
                if let (scaled, Some(location)) = decode(record)? {
                    if wanted.contains(&scaled) {
                        found.insert(scaled, location);
                    }
                }
            }
        }
    }
    Ok(found)
}

/// Smallest and largest scaled offset in each axis.
fn bounds(wanted: &[Vec<u64>]) -> (Vec<u64>, Vec<u64>) {
    let rank = wanted.first().map_or(0, Vec::len);
    let mut low = vec![u64::MAX; rank];
    let mut high = vec![0; rank];
    for scaled in wanted {
        for axis in 0..rank {
            low[axis] = low[axis].min(scaled[axis]);
            high[axis] = high[axis].max(scaled[axis]);
        }
    }
    (low, high)
}

/// Axis order of an extensible array index: the unlimited axis varies slowest.
fn extensible_order(grid: &ChunkGrid) -> Vec<usize> {
    let unlimited = grid
        .max_dims
        .as_ref()
        .and_then(|max_dims| max_dims.iter().position(Option::is_none))
        .unwrap_or(0);
    std::iter::once(unlimited)
        .chain((0..grid.chunk.len()).filter(|axis| *axis != unlimited))
        .collect()
}

/// Decode a fixed or extensible array element. Returns `None` for an unwritten chunk.
fn decode_entry(
    file: &RawFile,
    raw: Bytes,
    grid: &ChunkGrid,
    chunk_bytes: u64,
) -> Result<Option<ChunkLocation>, H5LensError> {
    let offset_size = usize::from(file.sizes.offset);
    let entry_size = raw.len();
    let mut d = Decoder::new(raw);
    let Some(address) = d.address(file.sizes)? else {
        return Ok(None);
    };
    let (size, filter_mask) = if grid.filtered {
        let width = entry_size
            .checked_sub(offset_size + 4)
            .ok_or_else(|| malformed(format!("chunk index entry of {entry_size} bytes")))?;
        (d.uint(width)?, d.u32()?)
    } else {
        (chunk_bytes, 0)
    };
    Ok(Some(ChunkLocation {
        address,
        size,
        filter_mask,
    }))
}

/// A fixed array chunk index.
struct FixedArray {
    entry_size: usize,
    entries: u64,
    data_block: Option<u64>,
    /// Elements per page, when the data block is paged
    page_entries: Option<u64>,
}

impl FixedArray {
    fn open(file: &RawFile, address: u64) -> Result<Self, H5LensError> {
        let sizes = file.sizes;
        let mut d = file.decoder(
            address,
            8 + u64::from(sizes.length) + u64::from(sizes.offset) + 4,
        )?;
        d.signature(b"FAHD")?;
        // Version and client
        d.skip(2)?;
        let entry_size = usize::from(d.u8()?);
        let page_bits = d.u8()?;
        let entries = d.length(sizes)?;
        let data_block = d.address(sizes)?;
        let page = 1_u64
            .checked_shl(u32::from(page_bits))
            .unwrap_or(u64::MAX);
        Ok(FixedArray {
            entry_size,
            entries,
            data_block,
            page_entries: (entries > page).then_some(page),
        })
    }

    /// The stored element at `index`, or `None` when it lies in an unwritten page.
    fn entry(&self, file: &RawFile, index: u64) -> Result<Option<Bytes>, H5LensError> {
        if index >= self.entries {
            return Err(malformed(format!(
                "chunk {index} is beyond a fixed array of {}",
                self.entries
            )));
        }
        let Some(block) = self.data_block else {
            return Ok(None);
        };
        let entry = self.entry_size as u64;
        let prefix = 6 + u64::from(file.sizes.offset);
        let mut d = file.decoder(block, prefix)?;
        d.signature(b"FADB")?;
        let address = match self.page_entries {
            None => block + prefix + index * entry,
            Some(page_entries) => {
                let pages = self.entries.div_ceil(page_entries);
                let bitmap_len = pages.div_ceil(8);
                let page = index / page_entries;
                let bitmap = file.read(block + prefix, bitmap_len)?;
                if bitmap[(page / 8) as usize] & (0x80 >> (page % 8)) == 0 {
                    return Ok(None);
                }
                let pages_start = block + prefix + bitmap_len + 4;
                pages_start + page * (page_entries * entry + 4) + (index % page_entries) * entry
            }
        };
        Ok(Some(file.read(address, entry)?))
    }
}

/// Extent of the data blocks belonging to one extensible array super block.
#[derive(Clone, Copy, Debug)]
struct SuperBlockInfo {
    data_blocks: u64,
    block_entries: u64,
    start_index: u64,
    start_block: u64,
}

/// An extensible array chunk index.
struct ExtensibleArray {
    entry_size: usize,
    /// Width of the block offsets in super and data block headers
    offset_width: usize,
    index_entries: u64,
    page_entries: u64,
    /// Super blocks whose data block addresses live in the index block
    index_super_blocks: usize,
    index_data_blocks: usize,
    super_blocks: Vec<SuperBlockInfo>,
    index_block: Option<u64>,
}

impl ExtensibleArray {
    fn open(file: &RawFile, address: u64) -> Result<Self, H5LensError> {
        let sizes = file.sizes;
        let mut d = file.decoder(
            address,
            12 + 6 * u64::from(sizes.length) + u64::from(sizes.offset) + 4,
        )?;
        d.signature(b"EAHD")?;
        // Version and client
        d.skip(2)?;
        let entry_size = usize::from(d.u8()?);
        let max_bits = d.u8()?;
        let index_entries = u64::from(d.u8()?);
        let min_entries = u64::from(d.u8()?);
        let min_pointers = u64::from(d.u8()?);
        let page_bits = d.u8()?;
        for _ in 0..6 {
            d.length(sizes)?;
        }
        let index_block = d.address(sizes)?;
        if !min_entries.is_power_of_two() || !min_pointers.is_power_of_two() {
            return Err(malformed("extensible array block sizes are not powers of two"));
        }
        let count = 1 + usize::from(max_bits).saturating_sub(min_entries.ilog2() as usize);
        let mut super_blocks = Vec::with_capacity(count);
        let (mut start_index, mut start_block) = (0, 0);
        for n in 0..count as u32 {
            let info = SuperBlockInfo {
                data_blocks: 1 << (n / 2),
                block_entries: (1 << n.div_ceil(2)) * min_entries,
                start_index,
                start_block,
            };
            start_index += info.data_blocks * info.block_entries;
            start_block += info.data_blocks;
            super_blocks.push(info);
        }
        Ok(ExtensibleArray {
            entry_size,
            offset_width: (usize::from(max_bits) + 7) / 8,
            index_entries,
            page_entries: 1_u64.checked_shl(u32::from(page_bits)).unwrap_or(u64::MAX),
            index_super_blocks: 2 * min_pointers.ilog2() as usize,
            index_data_blocks: 2 * (min_pointers as usize - 1),
            super_blocks,
            index_block,
        })
    }

    fn entry(&self, file: &RawFile, index: u64) -> Result<Option<Bytes>, H5LensError> {
        let sizes = file.sizes;
        let offset_size = u64::from(sizes.offset);
        let entry = self.entry_size as u64;
        let Some(index_block) = self.index_block else {
            return Ok(None);
        };
        let prefix = 6 + offset_size;
        if index < self.index_entries {
            let mut d = file.decoder(index_block, prefix)?;
            d.signature(b"EAIB")?;
            return Ok(Some(file.read(index_block + prefix + index * entry, entry)?));
        }
        let index = index - self.index_entries;
        let min_entries = self.super_blocks[0].block_entries;
        let super_block = (index / min_entries + 1).ilog2() as usize;
        let info = self
            .super_blocks
            .get(super_block)
            .ok_or_else(|| malformed(format!("chunk {index} is beyond the extensible array")))?;
        if info.block_entries > self.page_entries {
            return Err(malformed("paged extensible array data blocks are not supported"));
        }
        let within = index - info.start_index;
        let addresses = index_block + prefix + self.index_entries * entry;
        let data_block = if super_block < self.index_super_blocks {
            let slot = info.start_block + within / info.block_entries;
            file.decoder(addresses + slot * offset_size, offset_size)?
                .address(sizes)?
        } else {
            let slot = (super_block - self.index_super_blocks) as u64;
            let pointer = addresses + (self.index_data_blocks as u64 + slot) * offset_size;
            let Some(block) = file.decoder(pointer, offset_size)?.address(sizes)? else {
                return Ok(None);
            };
            let header = prefix + self.offset_width as u64;
            let mut d = file.decoder(block, header)?;
            d.signature(b"EASB")?;
            let slot = within / info.block_entries;
            file.decoder(block + header + slot * offset_size, offset_size)?
                .address(sizes)?
        };
        let Some(data_block) = data_block else {
            return Ok(None);
        };
        let header = prefix + self.offset_width as u64;
        let mut d = file.decoder(data_block, header)?;
        d.signature(b"EADB")?;
        let position = within % info.block_entries;
        Ok(Some(file.read(data_block + header + position * entry, entry)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h5::writer::{Buffer, Flavour, StoredChunk};
    use crate::range_reader::{BlockOptions, BlockReader, MemorySource};

    fn open(data: Vec<u8>) -> RawFile {
        RawFile::open(BlockReader::new(
            Box::new(MemorySource::new(data)),
            BlockOptions::default(),
        ))
        .unwrap()
    }

    fn grid(dims: &[u64], chunk: &[u64], max_dims: Option<Vec<Option<u64>>>, filtered: bool) -> ChunkGrid {
        ChunkGrid {
            chunk: chunk.to_vec(),
            dims: dims.to_vec(),
            max_dims,
            element_size: 4,
            filtered,
        }
    }

    /// Every chunk of a 2D grid, in index order, with a distinct fake address.
    fn all_chunks(rows: u64, cols: u64) -> Vec<(Vec<u64>, StoredChunk)> {
        (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .map(|(r, c)| {
                (
                    vec![r, c],
                    StoredChunk {
                        address: 10_000 + 100 * r + c,
                        size: 40 + r + c,
                        filter_mask: (r % 2) as u32,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn linear_positions() {
        let g = grid(&[10, 10], &[4, 3], None, false);
        assert_eq!(vec![Some(3), Some(4)], g.max_chunks());
        assert_eq!(7, g.linear(&[1, 3], &g.natural_order()));
        let g = grid(&[10, 10], &[4, 3], Some(vec![Some(20), None]), false);
        assert_eq!(vec![1, 0], extensible_order(&g));
        // The unlimited axis varies slowest.
        assert_eq!(3 * 5 + 1, g.linear(&[1, 3], &extensible_order(&g)));
    }

    #[test]
    fn single_and_implicit() {
        let mut w = Buffer::default();
        let root = w.object_header_v2(&[]);
        let file = open(w.finish_with_root(root, Flavour::Latest));
        let g = grid(&[4, 4], &[4, 4], None, false);
        let found = locate(&file, &ChunkIndexKind::Single { filtered: None }, 800, &g, &[vec![0, 0]]).unwrap();
        assert_eq!(64, found[&vec![0, 0]].size);
        let filtered = ChunkIndexKind::Single {
            filtered: Some((20, 1)),
        };
        let found = locate(&file, &filtered, 800, &g, &[vec![0, 0]]).unwrap();
        assert_eq!((20, 1), (found[&vec![0, 0]].size, found[&vec![0, 0]].filter_mask));

        let g = grid(&[8, 8], &[4, 4], None, false);
        let found = locate(&file, &ChunkIndexKind::Implicit, 1000, &g, &[vec![1, 1], vec![0, 1]]).unwrap();
        assert_eq!(1000 + 3 * 64, found[&vec![1, 1]].address);
        assert_eq!(1000 + 64, found[&vec![0, 1]].address);
    }

    #[test]
    fn fixed_array() {
        for (page_bits, filtered) in [(10, false), (10, true), (2, true)] {
            let mut w = Buffer::default();
            // One chunk was never written.
            let entries: Vec<Option<StoredChunk>> = all_chunks(5, 6)
                .into_iter()
                .map(|(scaled, chunk)| (scaled != vec![2, 2]).then_some(chunk))
                .collect();
            let address = w.fixed_array(&entries, filtered, page_bits);
            let root = w.object_header_v2(&[]);
            let file = open(w.finish_with_root(root, Flavour::Latest));
            let g = grid(&[20, 18], &[4, 3], None, filtered);
            let wanted = vec![vec![0, 0], vec![2, 2], vec![4, 5], vec![3, 1]];
            let found = locate(&file, &ChunkIndexKind::FixedArray, address, &g, &wanted).unwrap();
            assert_eq!(3, found.len(), "page bits {page_bits}");
            assert!(!found.contains_key(&vec![2, 2]));
            let chunk = found[&vec![4, 5]];
            assert_eq!(10_000 + 405, chunk.address);
            if filtered {
                assert_eq!((49, 0), (chunk.size, chunk.filter_mask));
                assert_eq!(1, found[&vec![3, 1]].filter_mask);
            } else {
                assert_eq!(g.chunk_bytes(), chunk.size);
            }
        }
    }

    #[test]
    fn extensible_array() {
        let mut w = Buffer::default();
        // 300 chunks along the unlimited axis reach super blocks beyond the index block.
        let entries: Vec<Option<StoredChunk>> = (0..300)
            .map(|n| {
                (n != 150).then_some(StoredChunk {
                    address: 50_000 + n,
                    size: 16,
                    filter_mask: 0,
                })
            })
            .collect();
        let address = w.extensible_array(&entries, false);
        let root = w.object_header_v2(&[]);
        let file = open(w.finish_with_root(root, Flavour::Latest));
        let g = grid(&[1200], &[4], Some(vec![None]), false);
        let wanted: Vec<Vec<u64>> = [0, 3, 5, 40, 150, 299].iter().map(|n| vec![*n]).collect();
        let found = locate(&file, &ChunkIndexKind::ExtensibleArray, address, &g, &wanted).unwrap();
        assert_eq!(5, found.len());
        for n in [0, 3, 5, 40, 299] {
            assert_eq!(50_000 + n, found[&vec![n]].address);
        }
    }

    #[test]
    fn btree_v2_index() {
        for filtered in [false, true] {
            let mut w = Buffer::default();
            let chunks = all_chunks(12, 12);
            let address = w.chunk_btree_v2(&chunks, filtered, 256);
            let root = w.object_header_v2(&[]);
            let file = open(w.finish_with_root(root, Flavour::Latest));
            let g = grid(&[48, 48], &[4, 4], Some(vec![None, None]), filtered);
            let wanted = vec![vec![5, 7], vec![5, 8], vec![6, 7]];
            let found = locate(&file, &ChunkIndexKind::BTreeV2, address, &g, &wanted).unwrap();
            assert_eq!(3, found.len());
            assert_eq!(10_000 + 508, found[&vec![5, 8]].address);
            if filtered {
                assert_eq!(53, found[&vec![6, 7]].size);
            }
        }
    }

    #[test]
    fn btree_v1_index() {
        let mut w = Buffer::default();
        let chunks: Vec<(Vec<u64>, StoredChunk)> = all_chunks(6, 6)
            .into_iter()
            .map(|(scaled, chunk)| (vec![scaled[0] * 4, scaled[1] * 4], chunk))
            .collect();
        let address = w.chunk_btree_v1(&chunks, 2);
        let root = w.object_header_v1(&[]);
        let file = open(w.finish_with_root(root, Flavour::Classic));
        let g = grid(&[24, 24], &[4, 4], None, true);
        let wanted = vec![vec![1, 1], vec![5, 0]];
        let found = locate(&file, &ChunkIndexKind::BTreeV1, address, &g, &wanted).unwrap();
        assert_eq!(10_000 + 500, found[&vec![5, 0]].address);
        assert_eq!(1, found[&vec![5, 0]].filter_mask);
        assert_eq!(2, found.len());
    }
}
