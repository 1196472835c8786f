//! Data layout messages.

use super::decoder::{malformed, Decoder, Sizes};
use crate::error::H5LensError;

use bytes::Bytes;

/// Index locating the chunks of a chunked dataset.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChunkIndexKind {
    /// Version 1 B-tree keyed by chunk offsets
    BTreeV1,
    /// The dataset is one chunk. Filtered chunks record their stored size and filter mask.
    Single { filtered: Option<(u64, u32)> },
    /// Chunks allocated back to back in index order
    Implicit,
    FixedArray,
    ExtensibleArray,
    BTreeV2,
}

/// Storage of a dataset's elements.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Layout {
    /// Elements stored in the layout message itself
    Compact(Bytes),
    /// Elements stored in one block. `None` until the dataset is written.
    Contiguous { address: Option<u64>, size: u64 },
    Chunked {
        /// Chunk extent of each axis
        chunk: Vec<u64>,
        index: ChunkIndexKind,
        /// Address of the index, `None` when no chunk has been written
        address: Option<u64>,
    },
}

impl Layout {
    pub fn decode(data: &Bytes, sizes: Sizes) -> Result<Self, H5LensError> {
        let mut d = Decoder::new(data.clone());
        let version = d.u8()?;
        match version {
            1 | 2 => decode_v1(&mut d, sizes),
            3 | 4 | 5 => decode_v3(&mut d, sizes, version),
            _ => Err(malformed(format!("layout version {version}"))),
        }
    }

    /// Chunk extents, for chunked layouts.
    pub fn chunk_shape(&self) -> Option<&[u64]> {
        match self {
            Layout::Chunked { chunk, .. } => Some(chunk),
            _ => None,
        }
    }
}

fn decode_v1(d: &mut Decoder, sizes: Sizes) -> Result<Layout, H5LensError> {
    let rank = usize::from(d.u8()?);
    let class = d.u8()?;
    d.skip(5)?;
    let address = if class == 0 { None } else { d.address(sizes)? };
    let mut dims = Vec::with_capacity(rank);
    for _ in 0..rank {
        dims.push(u64::from(d.u32()?));
    }
    match class {
        0 => {
            let size = usize::try_from(d.u32()?)?;
            Ok(Layout::Compact(d.take(size)?))
        }
        1 => Ok(Layout::Contiguous {
            address,
            size: dims.iter().product(),
        }),
        2 => {
            // The last axis is the element size.
            dims.pop();
            Ok(Layout::Chunked {
                chunk: dims,
                index: ChunkIndexKind::BTreeV1,
                address,
            })
        }
        _ => Err(malformed(format!("layout class {class}"))),
    }
}

fn decode_v3(d: &mut Decoder, sizes: Sizes, version: u8) -> Result<Layout, H5LensError> {
    let class = d.u8()?;
    match class {
        0 => {
            let size = usize::from(d.u16()?);
            Ok(Layout::Compact(d.take(size)?))
        }
        1 => Ok(Layout::Contiguous {
            address: d.address(sizes)?,
            size: d.length(sizes)?,
        }),
        2 if version == 3 => {
            let rank = usize::from(d.u8()?);
            let address = d.address(sizes)?;
            let mut chunk = Vec::with_capacity(rank);
            for _ in 0..rank {
                chunk.push(u64::from(d.u32()?));
            }
            chunk.pop();
            Ok(Layout::Chunked {
                chunk,
                index: ChunkIndexKind::BTreeV1,
                address,
            })
        }
        2 => {
            let flags = d.u8()?;
            let rank = usize::from(d.u8()?);
            let width = usize::from(d.u8()?);
            let mut chunk = Vec::with_capacity(rank);
            for _ in 0..rank {
                chunk.push(d.uint(width)?);
            }
            chunk.pop();
            let index = match d.u8()? {
                1 => {
                    let filtered = if flags & 0x02 != 0 {
                        Some((d.length(sizes)?, d.u32()?))
                    } else {
                        None
                    };
                    ChunkIndexKind::Single { filtered }
                }
                2 => ChunkIndexKind::Implicit,
                3 => {
                    // Page bits
                    d.skip(1)?;
                    ChunkIndexKind::FixedArray
                }
                4 => {
                    // Creation parameters, repeated in the array header
                    d.skip(5)?;
                    ChunkIndexKind::ExtensibleArray
                }
                5 => {
                    // Node size, split and merge percentages
                    d.skip(6)?;
                    ChunkIndexKind::BTreeV2
                }
                other => return Err(malformed(format!("chunk index type {other}"))),
            };
            Ok(Layout::Chunked {
                chunk,
                index,
                address: d.address(sizes)?,
            })
        }
        3 => Err(malformed("virtual datasets are not supported")),
        _ => Err(malformed(format!("layout class {class}"))),
    }
}
