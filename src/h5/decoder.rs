//! Checked little-endian decoding of HDF5 structures.

use crate::error::H5LensError;

use bytes::{Buf, Bytes};

/// Widths of file addresses and lengths, fixed by the superblock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Sizes {
    pub offset: u8,
    pub length: u8,
}

impl Default for Sizes {
    fn default() -> Self {
        Sizes {
            offset: 8,
            length: 8,
        }
    }
}

/// Error for a structure which does not decode.
pub fn malformed(what: impl std::fmt::Display) -> H5LensError {
    H5LensError::Hdf5Format(what.to_string())
}

/// Round up to a multiple of eight.
pub fn pad8(len: usize) -> usize {
    len.div_ceil(8) * 8
}

/// Number of bytes needed to encode values up to `max`.
pub fn encoded_width(max: u64) -> usize {
    if max == 0 {
        1
    } else {
        (max.ilog2() / 8 + 1) as usize
    }
}

/// Cursor over the bytes of one structure. Every read is bounds checked.
#[derive(Clone, Debug)]
pub struct Decoder {
    data: Bytes,
    len: usize,
}

impl Decoder {
    pub fn new(data: Bytes) -> Self {
        let len = data.len();
        Decoder { data, len }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.len - self.data.remaining()
    }

    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    fn need(&self, n: usize) -> Result<(), H5LensError> {
        if self.data.remaining() < n {
            return Err(malformed(format!(
                "structure truncated at byte {}: needed {} more bytes, {} left",
                self.position(),
                n,
                self.data.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, H5LensError> {
        self.need(1)?;
        Ok(self.data.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, H5LensError> {
        self.need(2)?;
        Ok(self.data.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32, H5LensError> {
        self.need(4)?;
        Ok(self.data.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64, H5LensError> {
        self.need(8)?;
        Ok(self.data.get_u64_le())
    }

    /// An unsigned integer `width` bytes wide.
    pub fn uint(&mut self, width: usize) -> Result<u64, H5LensError> {
        if width > 8 {
            return Err(malformed(format!("{width} byte integer")));
        }
        self.need(width)?;
        Ok(self.data.get_uint_le(width))
    }

    /// A file address. The undefined address (all bits set) decodes to `None`.
    pub fn address(&mut self, sizes: Sizes) -> Result<Option<u64>, H5LensError> {
        let width = usize::from(sizes.offset);
        let value = self.uint(width)?;
        let undefined = if width == 8 {
            u64::MAX
        } else {
            (1_u64 << (8 * width)) - 1
        };
        Ok((value != undefined).then_some(value))
    }

    /// A file length.
    pub fn length(&mut self, sizes: Sizes) -> Result<u64, H5LensError> {
        self.uint(usize::from(sizes.length))
    }

    pub fn skip(&mut self, n: usize) -> Result<(), H5LensError> {
        self.need(n)?;
        self.data.advance(n);
        Ok(())
    }

    pub fn take(&mut self, n: usize) -> Result<Bytes, H5LensError> {
        self.need(n)?;
        Ok(self.data.split_to(n))
    }

    /// Check a four byte structure signature.
    pub fn signature(&mut self, expected: &[u8; 4]) -> Result<(), H5LensError> {
        let found = self.take(4)?;
        if found.as_ref() != expected {
            return Err(malformed(format!(
                "expected signature {}, found {:?}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(&found)
            )));
        }
        Ok(())
    }

    /// A null terminated string. The terminator is consumed.
    pub fn cstring(&mut self) -> Result<String, H5LensError> {
        let Some(end) = self.data.iter().position(|b| *b == 0) else {
            return Err(malformed("unterminated string"));
        };
        let text = self.data.split_to(end);
        self.data.advance(1);
        Ok(String::from_utf8_lossy(&text).into_owned())
    }

    /// A null terminated string padded to a multiple of eight bytes.
    pub fn padded_name(&mut self) -> Result<String, H5LensError> {
        let start = self.position();
        let name = self.cstring()?;
        let used = self.position() - start;
        self.skip(pad8(used) - used)?;
        Ok(name)
    }

    /// A string of `len` bytes, dropping any null padding.
    pub fn fixed_string(&mut self, len: usize) -> Result<String, H5LensError> {
        let raw = self.take(len)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}
