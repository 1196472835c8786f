//! Addressed access to the bytes of an HDF5 file, and the superblock which anchors it.

use super::decoder::{malformed, Decoder, Sizes};
use crate::error::H5LensError;
use crate::range_reader::BlockReader;

use bytes::Bytes;

const SIGNATURE: &[u8; 8] = b"\x89HDF\r\n\x1a\n";

/// An HDF5 file read through a [BlockReader].
///
/// Addresses are relative to the base address recorded in the superblock.
pub struct RawFile {
    reader: BlockReader,
    base: u64,
    pub sizes: Sizes,
    /// Object header address of the root group
    pub root: u64,
    pub superblock_version: u8,
}

impl RawFile {
    /// Locate and decode the superblock.
    ///
    /// The superblock sits at byte 0, or after a user block at 512, 1024, 2048 and so on.
    pub fn open(reader: BlockReader) -> Result<Self, H5LensError> {
        let mut position = 0;
        while position + 8 <= reader.size() {
            if reader.read(position, 8)?.as_ref() == SIGNATURE {
                let data = reader.read_at_most(position, 128)?;
                return Self::from_superblock(reader, data);
            }
            position = if position == 0 { 512 } else { position * 2 };
        }
        Err(malformed("no HDF5 superblock found"))
    }

    fn from_superblock(reader: BlockReader, data: Bytes) -> Result<Self, H5LensError> {
        let mut d = Decoder::new(data);
        d.skip(8)?;
        let version = d.u8()?;
        let (sizes, base, root) = match version {
            0 | 1 => {
                d.skip(4)?;
                let sizes = Sizes {
                    offset: d.u8()?,
                    length: d.u8()?,
                };
                check_sizes(sizes)?;
                // Reserved, leaf and internal node K, consistency flags
                d.skip(1 + 2 + 2 + 4)?;
                if version == 1 {
                    d.skip(4)?;
                }
                let base = d.address(sizes)?.unwrap_or(0);
                // Free space, end of file and driver addresses
                d.address(sizes)?;
                d.address(sizes)?;
                d.address(sizes)?;
                // Root group symbol table entry: link name offset, then object header address.
                d.address(sizes)?;
                let root = d.address(sizes)?;
                (sizes, base, root)
            }
            2 | 3 => {
                let sizes = Sizes {
                    offset: d.u8()?,
                    length: d.u8()?,
                };
                check_sizes(sizes)?;
                d.skip(1)?;
                let base = d.address(sizes)?.unwrap_or(0);
                // Extension and end of file addresses
                d.address(sizes)?;
                d.address(sizes)?;
                let root = d.address(sizes)?;
                (sizes, base, root)
            }
            _ => return Err(malformed(format!("superblock version {version}"))),
        };
        let root = root.ok_or_else(|| malformed("root group has no object header"))?;
        tracing::debug!(
            "HDF5 superblock version {} with {} byte addresses",
            version,
            sizes.offset
        );
        Ok(RawFile {
            reader,
            base,
            sizes,
            root,
            superblock_version: version,
        })
    }

    /// Read `len` bytes at a file address.
    pub fn read(&self, address: u64, len: u64) -> Result<Bytes, H5LensError> {
        self.reader.read(self.absolute(address)?, len)
    }

    /// Read up to `len` bytes at a file address, stopping at the end of the file.
    pub fn read_at_most(&self, address: u64, len: u64) -> Result<Bytes, H5LensError> {
        self.reader.read_at_most(self.absolute(address)?, len)
    }

    /// A [Decoder] over `len` bytes at a file address.
    pub fn decoder(&self, address: u64, len: u64) -> Result<Decoder, H5LensError> {
        Ok(Decoder::new(self.read(address, len)?))
    }

    /// A [Decoder] over up to `len` bytes at a file address.
    pub fn decoder_at_most(&self, address: u64, len: u64) -> Result<Decoder, H5LensError> {
        Ok(Decoder::new(self.read_at_most(address, len)?))
    }

    /// Total bytes fetched from storage so far.
    pub fn fetched(&self) -> u64 {
        self.reader.fetched()
    }

    fn absolute(&self, address: u64) -> Result<u64, H5LensError> {
        self.base
            .checked_add(address)
            .ok_or_else(|| malformed(format!("address {address} overflows")))
    }
}

fn check_sizes(sizes: Sizes) -> Result<(), H5LensError> {
    for size in [sizes.offset, sizes.length] {
        if !matches!(size, 2 | 4 | 8) {
            return Err(malformed(format!("{size} byte addresses are not supported")));
        }
    }
    Ok(())
}
