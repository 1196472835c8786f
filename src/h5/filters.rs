//! Filter pipelines applied to stored chunks.

pub mod shuffle;

use super::decoder::{malformed, Decoder};
use crate::error::H5LensError;
use crate::models::FilterInfo;

use bytes::Bytes;
use zune_inflate::{DeflateDecoder, DeflateOptions};

pub const DEFLATE: u16 = 1;
pub const SHUFFLE: u16 = 2;
pub const FLETCHER32: u16 = 3;

/// One filter of a pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Filter {
    pub id: u16,
    pub name: Option<String>,
    pub client_data: Vec<u32>,
}

impl Filter {
    /// Describe the filter for clients.
    pub fn info(&self) -> FilterInfo {
        let name = match self.id {
            DEFLATE => "gzip",
            SHUFFLE => "shuffle",
            FLETCHER32 => "fletcher32",
            4 => "szip",
            5 => "nbit",
            6 => "scaleoffset",
            32000 => "lzf",
            32001 => "blosc",
            32004 => "lz4",
            32008 => "bitshuffle",
            32015 => "zstd",
            _ => "",
        };
        let name = match (name, &self.name) {
            ("", Some(given)) if !given.is_empty() => given.clone(),
            ("", _) => format!("filter-{}", self.id),
            (known, _) => known.to_string(),
        };
        let level = match self.id {
            DEFLATE => self.client_data.first().copied(),
            _ => None,
        };
        FilterInfo {
            id: u32::from(self.id),
            name,
            level,
        }
    }
}

/// The filters applied to every chunk of a dataset, in the order they were applied on write.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FilterPipeline(pub Vec<Filter>);

impl FilterPipeline {
    /// Decode a filter pipeline message.
    pub fn decode(data: &Bytes) -> Result<Self, H5LensError> {
        let mut d = Decoder::new(data.clone());
        let version = d.u8()?;
        let count = usize::from(d.u8()?);
        match version {
            1 => d.skip(6)?,
            2 => (),
            _ => return Err(malformed(format!("filter pipeline version {version}"))),
        }
        let mut filters = Vec::with_capacity(count);
        for _ in 0..count {
            let id = d.u16()?;
            let name_len = if version == 1 || id >= 256 {
                usize::from(d.u16()?)
            } else {
                0
            };
            // Flags
            d.skip(2)?;
            let values = usize::from(d.u16()?);
            let name = if name_len > 0 {
                Some(d.fixed_string(name_len)?)
            } else {
                None
            };
            let mut client_data = Vec::with_capacity(values);
            for _ in 0..values {
                client_data.push(d.u32()?);
            }
            if version == 1 && values % 2 == 1 {
                d.skip(4)?;
            }
            filters.push(Filter {
                id,
                name,
                client_data,
            });
        }
        Ok(FilterPipeline(filters))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn info(&self) -> Vec<FilterInfo> {
        self.0.iter().map(Filter::info).collect()
    }

    /// Undo the pipeline for one stored chunk.
    ///
    /// Filters are undone in reverse order. Bit `n` of `mask` set means filter `n` was skipped
    /// for this chunk.
    pub fn decode_chunk(
        &self,
        mut data: Bytes,
        mask: u32,
        element_size: usize,
        chunk_bytes: usize,
    ) -> Result<Bytes, H5LensError> {
        for (n, filter) in self.0.iter().enumerate().rev() {
            if n < 32 && mask & (1 << n) != 0 {
                continue;
            }
            data = match filter.id {
                DEFLATE => {
                    let options = DeflateOptions::default().set_size_hint(chunk_bytes);
                    let mut decoder = DeflateDecoder::new_with_options(&data, options);
                    decoder.decode_zlib()?.into()
                }
                SHUFFLE => {
                    let size = filter
                        .client_data
                        .first()
                        .map_or(element_size, |size| *size as usize);
                    shuffle::deshuffle(&data, size)
                }
                FLETCHER32 => {
                    if data.len() < 4 {
                        return Err(malformed("chunk too short for its checksum"));
                    }
                    data.slice(..data.len() - 4)
                }
                _ => {
                    return Err(malformed(format!(
                        "unsupported filter {}",
                        filter.info().name
                    )))
                }
            };
        }
        Ok(data)
    }
}
