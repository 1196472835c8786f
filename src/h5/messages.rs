//! Dataspace, fill value, link and attribute messages.

use super::datatype::Datatype;
use super::decoder::{malformed, pad8, Decoder, Sizes};
use super::object_header::{resolve_shared, DATASPACE, DATATYPE};
use super::raw::RawFile;
use crate::error::H5LensError;

use bytes::Bytes;

/// Extent of a dataset or attribute.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Dataspace {
    pub dims: Vec<u64>,
    /// Maximum extent of each axis, `None` when unlimited
    pub max_dims: Option<Vec<Option<u64>>>,
}

impl Dataspace {
    pub fn decode(d: &mut Decoder, sizes: Sizes) -> Result<Self, H5LensError> {
        let version = d.u8()?;
        let rank = usize::from(d.u8()?);
        let flags = d.u8()?;
        let null = match version {
            1 => {
                d.skip(5)?;
                false
            }
            2 => d.u8()? == 2,
            _ => return Err(malformed(format!("dataspace version {version}"))),
        };
        if null {
            // An empty extent is reported as a single axis with no elements.
            return Ok(Dataspace {
                dims: vec![0],
                max_dims: None,
            });
        }
        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(d.length(sizes)?);
        }
        let max_dims = if flags & 0x01 != 0 {
            let unlimited = if sizes.length == 8 {
                u64::MAX
            } else {
                (1_u64 << (8 * sizes.length)) - 1
            };
            let mut max_dims = Vec::with_capacity(rank);
            for _ in 0..rank {
                let max = d.length(sizes)?;
                max_dims.push((max != unlimited).then_some(max));
            }
            Some(max_dims)
        } else {
            None
        };
        Ok(Dataspace { dims, max_dims })
    }

    /// Number of elements.
    pub fn len(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Axis extents as `usize`.
    pub fn shape(&self) -> Result<Vec<usize>, H5LensError> {
        self.dims
            .iter()
            .map(|dim| Ok(usize::try_from(*dim)?))
            .collect()
    }
}

/// Decode a fill value message, old or new. Returns `None` when no value is defined.
pub fn decode_fill_value(kind: u16, data: &Bytes) -> Result<Option<Bytes>, H5LensError> {
    let mut d = Decoder::new(data.clone());
    let defined = if kind == super::object_header::FILL_VALUE_OLD {
        true
    } else {
        let version = d.u8()?;
        match version {
            1 | 2 => {
                // Allocation and write times
                d.skip(2)?;
                let defined = d.u8()? != 0;
                version == 1 || defined
            }
            3 => d.u8()? & 0x20 != 0,
            _ => return Err(malformed(format!("fill value version {version}"))),
        }
    };
    if !defined || d.remaining() < 4 {
        return Ok(None);
    }
    let size = usize::try_from(d.u32()?)?;
    if size == 0 {
        return Ok(None);
    }
    Ok(Some(d.take(size)?))
}

/// Where a link points.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkTarget {
    /// Object header address
    Hard(u64),
    /// Path within the same file
    Soft(String),
    /// Object in another file
    External,
}

/// A named link from a group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Link {
    pub name: String,
    pub target: LinkTarget,
}

impl Link {
    /// Decode a link message.
    pub fn decode(data: Bytes, sizes: Sizes) -> Result<Self, H5LensError> {
        let mut d = Decoder::new(data);
        let version = d.u8()?;
        if version != 1 {
            return Err(malformed(format!("link version {version}")));
        }
        let flags = d.u8()?;
        let link_type = if flags & 0x08 != 0 { d.u8()? } else { 0 };
        if flags & 0x04 != 0 {
            // Creation order
            d.skip(8)?;
        }
        if flags & 0x10 != 0 {
            // Character set
            d.skip(1)?;
        }
        let name_len = usize::try_from(d.uint(1 << (flags & 0x03))?)?;
        let name = String::from_utf8_lossy(&d.take(name_len)?).into_owned();
        let target = match link_type {
            0 => LinkTarget::Hard(
                d.address(sizes)?
                    .ok_or_else(|| malformed(format!("hard link {name} has no address")))?,
            ),
            1 => {
                let len = usize::from(d.u16()?);
                LinkTarget::Soft(String::from_utf8_lossy(&d.take(len)?).into_owned())
            }
            _ => LinkTarget::External,
        };
        Ok(Link { name, target })
    }
}

/// Location of densely stored links or attributes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DenseStorage {
    /// Fractal heap holding the encoded messages
    pub heap: u64,
    /// Version 2 B-tree indexing them by name
    pub name_index: u64,
}

/// Decode a link info or attribute info message. Returns `None` for compact storage.
pub fn decode_dense_storage(
    data: &Bytes,
    sizes: Sizes,
    attributes: bool,
) -> Result<Option<DenseStorage>, H5LensError> {
    let mut d = Decoder::new(data.clone());
    let version = d.u8()?;
    if version != 0 {
        return Err(malformed(format!("storage info version {version}")));
    }
    let flags = d.u8()?;
    if flags & 0x01 != 0 {
        // Maximum creation index
        d.skip(if attributes { 2 } else { 8 })?;
    }
    let heap = d.address(sizes)?;
    let name_index = d.address(sizes)?;
    Ok(match (heap, name_index) {
        (Some(heap), Some(name_index)) => Some(DenseStorage { heap, name_index }),
        _ => None,
    })
}

/// A raw attribute: its name, type, extent and stored elements.
#[derive(Clone, Debug)]
pub struct RawAttribute {
    pub name: String,
    pub datatype: Datatype,
    pub dataspace: Dataspace,
    pub data: Bytes,
}

impl RawAttribute {
    /// Decode an attribute message.
    pub fn decode(file: &RawFile, data: Bytes) -> Result<Self, H5LensError> {
        let sizes = file.sizes;
        let mut d = Decoder::new(data);
        let version = d.u8()?;
        let flags = if version == 1 {
            d.skip(1)?;
            0
        } else {
            d.u8()?
        };
        let name_len = usize::from(d.u16()?);
        let datatype_len = usize::from(d.u16()?);
        let dataspace_len = usize::from(d.u16()?);
        let padded = |len: usize| if version == 1 { pad8(len) } else { len };
        match version {
            1 | 2 => (),
            3 => d.skip(1)?,
            _ => return Err(malformed(format!("attribute version {version}"))),
        }
        let name = Decoder::new(d.take(padded(name_len))?).fixed_string(name_len)?;
        let mut datatype_raw = d.take(padded(datatype_len))?;
        if flags & 0x01 != 0 {
            datatype_raw = resolve_shared(file, DATATYPE, &datatype_raw)?;
        }
        let mut dataspace_raw = d.take(padded(dataspace_len))?;
        if flags & 0x02 != 0 {
            dataspace_raw = resolve_shared(file, DATASPACE, &dataspace_raw)?;
        }
        let datatype = Datatype::decode(&mut Decoder::new(datatype_raw), sizes.offset)?;
        let dataspace = Dataspace::decode(&mut Decoder::new(dataspace_raw), sizes)?;
        let len = usize::try_from(dataspace.len())?
            .checked_mul(datatype.stored_size(sizes.offset))
            .ok_or_else(|| malformed(format!("attribute {name} is too large")))?;
        let data = d.take(len)?;
        Ok(RawAttribute {
            name,
            datatype,
            dataspace,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h5::object_header::{FILL_VALUE, FILL_VALUE_OLD};
    use crate::h5::writer;

    #[test]
    fn dataspaces() {
        let sizes = Sizes::default();
        let decode = |raw: Vec<u8>| Dataspace::decode(&mut Decoder::new(Bytes::from(raw)), sizes);
        let simple = decode(writer::dataspace(1, &[3, 4], None)).unwrap();
        assert_eq!(vec![3, 4], simple.dims);
        assert_eq!(12, simple.len());
        let scalar = decode(writer::dataspace(2, &[], None)).unwrap();
        assert_eq!(Vec::<u64>::new(), scalar.dims);
        assert_eq!(1, scalar.len());
        let growing = decode(writer::dataspace(2, &[5], Some(&[None]))).unwrap();
        assert_eq!(Some(vec![None]), growing.max_dims);
        let fixed = decode(writer::dataspace(1, &[5], Some(&[Some(10)]))).unwrap();
        assert_eq!(Some(vec![Some(10)]), fixed.max_dims);
        let null = decode(vec![2, 0, 0, 2]).unwrap();
        assert_eq!(vec![0], null.dims);
        assert_eq!(0, null.len());
        assert!(decode(vec![3, 0, 0, 0]).is_err());
    }

    #[test]
    fn fill_values() {
        let value = Bytes::from_static(&[1, 2, 3, 4]);
        let raw = Bytes::from(writer::fill_value(Some(&value)));
        assert_eq!(Some(value.clone()), decode_fill_value(FILL_VALUE, &raw).unwrap());
        let raw = Bytes::from(writer::fill_value(None));
        assert_eq!(None, decode_fill_value(FILL_VALUE, &raw).unwrap());
        let raw = Bytes::from_static(&[3, 0x20, 4, 0, 0, 0, 9, 9, 9, 9]);
        assert_eq!(
            Some(Bytes::from_static(&[9, 9, 9, 9])),
            decode_fill_value(FILL_VALUE, &raw).unwrap()
        );
        let raw = Bytes::from_static(&[2, 0, 0, 0, 7, 7]);
        assert_eq!(
            Some(Bytes::from_static(&[7, 7])),
            decode_fill_value(FILL_VALUE_OLD, &raw).unwrap()
        );
        let raw = Bytes::from_static(&[0, 0, 0, 0]);
        assert_eq!(None, decode_fill_value(FILL_VALUE_OLD, &raw).unwrap());
    }

    #[test]
    fn links() {
        let sizes = Sizes::default();
        let hard = Link::decode(Bytes::from(writer::hard_link("data", 800)), sizes).unwrap();
        assert_eq!(
            Link {
                name: "data".to_string(),
                target: LinkTarget::Hard(800)
            },
            hard
        );
        let soft = Link::decode(Bytes::from(writer::soft_link("alias", "/grid/data")), sizes).unwrap();
        assert_eq!(LinkTarget::Soft("/grid/data".to_string()), soft.target);
        let external = Link::decode(Bytes::from_static(&[1, 0x08, 64, 1, b'x', 0, 0]), sizes).unwrap();
        assert_eq!(LinkTarget::External, external.target);
    }

    #[test]
    fn dense_storage() {
        let sizes = Sizes::default();
        let compact = Bytes::from(writer::link_info(None));
        assert_eq!(None, decode_dense_storage(&compact, sizes, false).unwrap());
        let dense = Bytes::from(writer::link_info(Some((100, 200))));
        assert_eq!(
            Some(DenseStorage {
                heap: 100,
                name_index: 200
            }),
            decode_dense_storage(&dense, sizes, false).unwrap()
        );
    }
}
