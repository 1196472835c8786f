//! Global heap collections, which hold variable length strings.

use super::decoder::{malformed, pad8, Decoder};
use super::raw::RawFile;
use crate::error::H5LensError;

use bytes::Bytes;
use hashbrown::HashMap;

/// Objects of one collection by index.
type Collection = HashMap<u16, Bytes>;

fn read_collection(file: &RawFile, address: u64) -> Result<Collection, H5LensError> {
    let sizes = file.sizes;
    let mut d = file.decoder(address, 8 + u64::from(sizes.length))?;
    d.signature(b"GCOL")?;
    let version = d.u8()?;
    if version != 1 {
        return Err(malformed(format!("global heap version {version}")));
    }
    d.skip(3)?;
    let size = d.length(sizes)?;
    let header = d.position() as u64;
    if size < header {
        return Err(malformed(format!("global heap of {size} bytes")));
    }
    let mut d = file.decoder(address + header, size - header)?;
    let mut objects = HashMap::new();
    let object_header = 8 + usize::from(sizes.length);
    while d.remaining() >= object_header {
        let index = d.u16()?;
        if index == 0 {
            // Free space runs to the end of the collection.
            break;
        }
        // Reference count and reserved bytes
        d.skip(6)?;
        let len = usize::try_from(d.length(sizes)?)?;
        let data = d.take(len)?;
        d.skip((pad8(len) - len).min(d.remaining()))?;
        objects.insert(index, data);
    }
    Ok(objects)
}

/// Reads variable length elements, caching each collection it visits.
pub struct GlobalHeapReader<'a> {
    file: &'a RawFile,
    collections: HashMap<u64, Collection>,
}

impl<'a> GlobalHeapReader<'a> {
    pub fn new(file: &'a RawFile) -> Self {
        GlobalHeapReader {
            file,
            collections: HashMap::new(),
        }
    }

    /// Resolve a stored variable length element: a length, a collection address and an index.
    pub fn element(&mut self, stored: &[u8]) -> Result<Bytes, H5LensError> {
        let sizes = self.file.sizes;
        let mut d = Decoder::new(Bytes::copy_from_slice(stored));
        let len = usize::try_from(d.u32()?)?;
        let address = d.address(sizes)?;
        let index = d.u32()?;
        let Some(address) = address.filter(|_| len > 0) else {
            return Ok(Bytes::new());
        };
        if !self.collections.contains_key(&address) {
            let collection = read_collection(self.file, address)?;
            self.collections.insert(address, collection);
        }
        let object = u16::try_from(index)
            .ok()
            .and_then(|index| self.collections.get(&address)?.get(&index))
            .ok_or_else(|| {
                malformed(format!("global heap object {index} missing at {address}"))
            })?;
        Ok(object.slice(..len.min(object.len())))
    }
}
