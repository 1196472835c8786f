//! Fractal heaps, which hold densely stored links and attributes.

use super::decoder::{encoded_width, malformed, Decoder};
use super::raw::RawFile;
use crate::error::H5LensError;

use bytes::Bytes;

/// Extended tiny object lengths take a second byte once heap ids exceed this.
const TINY_LEN_SHORT: usize = 16;

/// Indirect blocks followed before a lookup is rejected.
const MAX_DEPTH: usize = 32;

fn log2(value: u64) -> u32 {
    value.checked_ilog2().unwrap_or(0)
}

/// An opened fractal heap.
#[derive(Debug)]
pub struct FractalHeap {
    address: u64,
    id_len: usize,
    /// Width of a heap offset within heap ids and block headers
    offset_width: usize,
    /// Width of an object length within heap ids
    length_width: usize,
    table_width: u64,
    start_block_size: u64,
    max_direct_rows: u64,
    root: Option<u64>,
    root_rows: u64,
}

impl FractalHeap {
    pub fn open(file: &RawFile, address: u64) -> Result<Self, H5LensError> {
        let sizes = file.sizes;
        let mut d = file.decoder_at_most(address, 256)?;
        d.signature(b"FRHP")?;
        let version = d.u8()?;
        if version != 0 {
            return Err(malformed(format!("fractal heap version {version}")));
        }
        let id_len = usize::from(d.u16()?);
        let filter_len = d.u16()?;
        // Flags
        d.skip(1)?;
        let max_managed = u64::from(d.u32()?);
        // Next huge id, huge object B-tree, free space, free space manager, managed space,
        // allocated space, iterator offset, managed objects, huge and tiny sizes and counts.
        d.length(sizes)?;
        d.address(sizes)?;
        d.length(sizes)?;
        d.address(sizes)?;
        for _ in 0..8 {
            d.length(sizes)?;
        }
        let table_width = u64::from(d.u16()?);
        let start_block_size = d.length(sizes)?;
        let max_direct = d.length(sizes)?;
        let max_heap_bits = d.u16()?;
        // Starting rows of the root indirect block
        d.skip(2)?;
        let root = d.address(sizes)?;
        let root_rows = u64::from(d.u16()?);
        if filter_len > 0 {
            return Err(malformed("filtered fractal heaps are not supported"));
        }
        if !table_width.is_power_of_two() || !start_block_size.is_power_of_two() {
            return Err(malformed(format!(
                "fractal heap with width {table_width} and {start_block_size} byte blocks"
            )));
        }
        let max_direct_bits = usize::try_from(log2(max_direct))?;
        Ok(FractalHeap {
            address,
            id_len,
            offset_width: (usize::from(max_heap_bits) + 7) / 8,
            length_width: ((max_direct_bits + 7) / 8).min(encoded_width(max_managed)),
            table_width,
            start_block_size,
            max_direct_rows: u64::from(log2(max_direct)).saturating_sub(u64::from(log2(start_block_size))) + 2,
            root,
            root_rows,
        })
    }

    /// Fetch the object named by a heap id.
    pub fn object(&self, file: &RawFile, id: &[u8]) -> Result<Bytes, H5LensError> {
        let Some(first) = id.first() else {
            return Err(malformed("empty fractal heap id"));
        };
        match (first >> 4) & 0x03 {
            0 => {
                let mut d = Decoder::new(Bytes::copy_from_slice(&id[1..]));
                let offset = d.uint(self.offset_width)?;
                let len = d.uint(self.length_width)?;
                let address = self.locate(file, offset)?;
                file.read(address, len)
            }
            2 => {
                let (len, start) = if self.id_len.saturating_sub(1) > TINY_LEN_SHORT {
                    let high = usize::from(first & 0x0f) << 8;
                    (high + usize::from(id.get(1).copied().unwrap_or(0)) + 1, 2)
                } else {
                    (usize::from(first & 0x0f) + 1, 1)
                };
                id.get(start..start + len)
                    .map(Bytes::copy_from_slice)
                    .ok_or_else(|| malformed("tiny object longer than its heap id"))
            }
            1 => Err(malformed("huge fractal heap objects are not supported")),
            kind => Err(malformed(format!("fractal heap id type {kind}"))),
        }
    }

    /// Size of the blocks in a row of the doubling table.
    fn row_block_size(&self, row: u64) -> u64 {
        if row == 0 {
            self.start_block_size
        } else {
            self.start_block_size << (row - 1)
        }
    }

    /// File address of the managed object at heap offset `offset`.
    fn locate(&self, file: &RawFile, offset: u64) -> Result<u64, H5LensError> {
        let root = self
            .root
            .ok_or_else(|| malformed("fractal heap has no blocks"))?;
        if self.root_rows == 0 {
            return Ok(root + offset);
        }
        let sizes = file.sizes;
        let first_row_bits = u64::from(log2(self.start_block_size) + log2(self.table_width));
        let prefix = 5 + u64::from(sizes.offset) + self.offset_width as u64;
        let (mut block, mut block_offset, mut rows) = (root, 0, self.root_rows);
        for _ in 0..MAX_DEPTH {
            let relative = offset - block_offset;
            let (row, column) = if relative < self.start_block_size * self.table_width {
                (0, relative / self.start_block_size)
            } else {
                let row = u64::from(log2(relative)) - first_row_bits + 1;
                let row_start = 1_u64 << log2(relative);
                (row, (relative - row_start) / self.row_block_size(row))
            };
            if row >= rows {
                return Err(malformed(format!(
                    "heap offset {offset} is beyond an indirect block of {rows} rows"
                )));
            }
            let entry = row * self.table_width + column;
            let mut d = file.decoder(
                block + prefix + entry * u64::from(sizes.offset),
                u64::from(sizes.offset),
            )?;
            let child = d
                .address(sizes)?
                .ok_or_else(|| malformed(format!("heap offset {offset} is not allocated")))?;
            let row_start = if row == 0 {
                0
            } else {
                (self.start_block_size * self.table_width) << (row - 1)
            };
            let child_offset = block_offset + row_start + column * self.row_block_size(row);
            if row < self.max_direct_rows {
                return Ok(child + (offset - child_offset));
            }
            block = child;
            block_offset = child_offset;
            rows = u64::from(log2(self.row_block_size(row))) - first_row_bits + 1;
        }
        Err(malformed(format!(
            "fractal heap at {} is too deep",
            self.address
        )))
    }
}
