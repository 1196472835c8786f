//! Datatype messages.

use super::decoder::{encoded_width, malformed, Decoder};
use crate::error::H5LensError;
use crate::models::{DType, DTypeClass, Endianness};

/// Padding of fixed length strings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StringPadding {
    NullTerminated,
    NullPadded,
    SpacePadded,
}

impl StringPadding {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x0f {
            0 => StringPadding::NullTerminated,
            2 => StringPadding::SpacePadded,
            _ => StringPadding::NullPadded,
        }
    }

    /// Strip the padding from a stored string.
    pub fn trim<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        match self {
            StringPadding::NullTerminated => {
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                &raw[..end]
            }
            StringPadding::NullPadded => {
                let end = raw.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
                &raw[..end]
            }
            StringPadding::SpacePadded => {
                let end = raw.iter().rposition(|b| *b != b' ').map_or(0, |i| i + 1);
                &raw[..end]
            }
        }
    }
}

/// A member of a compound type.
#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    pub name: String,
    pub offset: usize,
    pub datatype: Datatype,
}

/// An HDF5 datatype.
#[derive(Clone, Debug, PartialEq)]
pub enum Datatype {
    Integer {
        size: usize,
        signed: bool,
        big_endian: bool,
    },
    Float {
        size: usize,
        big_endian: bool,
    },
    Time {
        size: usize,
    },
    String {
        size: usize,
        padding: StringPadding,
        utf8: bool,
    },
    Bitfield {
        size: usize,
    },
    Opaque {
        size: usize,
    },
    Compound {
        size: usize,
        members: Vec<Member>,
    },
    Reference {
        size: usize,
    },
    Enum {
        base: Box<Datatype>,
        names: Vec<String>,
        values: Vec<Vec<u8>>,
    },
    VarString {
        padding: StringPadding,
        utf8: bool,
    },
    Sequence {
        base: Box<Datatype>,
    },
    Array {
        dims: Vec<u32>,
        base: Box<Datatype>,
    },
}

/// Size of a variable length element: a length, a global heap collection and an index.
pub fn vlen_size(offset_size: u8) -> usize {
    4 + usize::from(offset_size) + 4
}

impl Datatype {
    /// Decode a datatype message.
    pub fn decode(d: &mut Decoder, offset_size: u8) -> Result<Self, H5LensError> {
        let class_and_version = d.u8()?;
        let class = class_and_version & 0x0f;
        let version = class_and_version >> 4;
        let bits = d.uint(3)? as u32;
        let size = usize::try_from(d.u32()?)?;
        let datatype = match class {
            0 => {
                // Bit offset and precision
                d.skip(4)?;
                Datatype::Integer {
                    size,
                    signed: bits & 0x08 != 0,
                    big_endian: bits & 0x01 != 0,
                }
            }
            1 => {
                // Bit offset, precision, exponent and mantissa layout, exponent bias
                d.skip(12)?;
                Datatype::Float {
                    size,
                    big_endian: bits & 0x01 != 0,
                }
            }
            2 => {
                d.skip(2)?;
                Datatype::Time { size }
            }
            3 => Datatype::String {
                size,
                padding: StringPadding::from_bits(bits),
                utf8: (bits >> 4) & 0x0f == 1,
            },
            4 => {
                d.skip(4)?;
                Datatype::Bitfield { size }
            }
            5 => {
                // Null padded tag
                d.skip((bits & 0xff) as usize)?;
                Datatype::Opaque { size }
            }
            6 => {
                let count = (bits & 0xffff) as usize;
                let mut members = Vec::with_capacity(count);
                for _ in 0..count {
                    members.push(decode_member(d, version, size, offset_size)?);
                }
                Datatype::Compound { size, members }
            }
            7 => Datatype::Reference { size },
            8 => {
                let count = (bits & 0xffff) as usize;
                let base = Datatype::decode(d, offset_size)?;
                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    names.push(if version >= 3 {
                        d.cstring()?
                    } else {
                        d.padded_name()?
                    });
                }
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(d.take(base.size())?.to_vec());
                }
                Datatype::Enum {
                    base: Box::new(base),
                    names,
                    values,
                }
            }
            9 => {
                let base = Datatype::decode(d, offset_size)?;
                if bits & 0x0f == 1 {
                    Datatype::VarString {
                        padding: StringPadding::from_bits(bits >> 4),
                        utf8: (bits >> 8) & 0x0f == 1,
                    }
                } else {
                    Datatype::Sequence {
                        base: Box::new(base),
                    }
                }
            }
            10 => {
                let rank = usize::from(d.u8()?);
                if version < 3 {
                    d.skip(3)?;
                }
                let mut dims = Vec::with_capacity(rank);
                for _ in 0..rank {
                    dims.push(d.u32()?);
                }
                if version < 3 {
                    // Permutation indices
                    d.skip(4 * rank)?;
                }
                let base = Datatype::decode(d, offset_size)?;
                Datatype::Array {
                    dims,
                    base: Box::new(base),
                }
            }
            _ => return Err(malformed(format!("datatype class {class}"))),
        };
        Ok(datatype)
    }

    /// Size of one stored element in bytes.
    pub fn size(&self) -> usize {
        match self {
            Datatype::Integer { size, .. }
            | Datatype::Float { size, .. }
            | Datatype::Time { size }
            | Datatype::String { size, .. }
            | Datatype::Bitfield { size }
            | Datatype::Opaque { size }
            | Datatype::Compound { size, .. }
            | Datatype::Reference { size } => *size,
            Datatype::Enum { base, .. } => base.size(),
            // Length, collection address and index, with eight byte addresses.
            Datatype::VarString { .. } | Datatype::Sequence { .. } => vlen_size(8),
            Datatype::Array { dims, base } => {
                dims.iter().map(|d| *d as usize).product::<usize>() * base.size()
            }
        }
    }

    /// Size of one stored element in a file with `offset_size` byte addresses.
    pub fn stored_size(&self, offset_size: u8) -> usize {
        match self {
            Datatype::VarString { .. } | Datatype::Sequence { .. } => vlen_size(offset_size),
            _ => self.size(),
        }
    }

    /// Whether this is the enumeration h5py writes for booleans.
    pub fn is_boolean(&self) -> bool {
        match self {
            Datatype::Enum { base, names, values } => {
                base.size() == 1
                    && names.len() == 2
                    && names[0] == "FALSE"
                    && names[1] == "TRUE"
                    && values[0] == [0]
                    && values[1] == [1]
            }
            _ => false,
        }
    }

    /// The `(real, imaginary)` float members of a complex compound.
    pub fn complex_parts(&self) -> Option<(&Member, &Member)> {
        let Datatype::Compound { members, .. } = self else {
            return None;
        };
        match members.as_slice() {
            [r, i]
                if r.name == "r"
                    && i.name == "i"
                    && matches!(r.datatype, Datatype::Float { .. })
                    && r.datatype == i.datatype =>
            {
                Some((r, i))
            }
            _ => None,
        }
    }

    /// Describe the type for clients.
    pub fn to_dtype(&self) -> DType {
        let order = |big_endian: bool, size: usize| {
            if size == 1 {
                Endianness::NotApplicable
            } else if big_endian {
                Endianness::Big
            } else {
                Endianness::Little
            }
        };
        match self {
            Datatype::Integer {
                size,
                signed,
                big_endian,
            } => DType {
                endianness: order(*big_endian, *size),
                ..DType::integer(*size, *signed)
            },
            Datatype::Float { size, big_endian } => DType {
                endianness: order(*big_endian, *size),
                ..DType::float(*size)
            },
            Datatype::Enum { .. } if self.is_boolean() => DType::boolean(),
            Datatype::Enum { base, .. } => DType {
                signed: Some(matches!(**base, Datatype::Integer { signed: true, .. })),
                ..DType::other(DTypeClass::Enum, base.size())
            },
            Datatype::Compound { size, members } => match self.complex_parts() {
                Some((real, _)) => DType {
                    endianness: match real.datatype {
                        Datatype::Float {
                            big_endian: true, ..
                        } => Endianness::Big,
                        _ => Endianness::Little,
                    },
                    ..DType::complex(*size)
                },
                None => DType::compound(
                    *size,
                    members.iter().map(|member| member.name.clone()).collect(),
                ),
            },
            Datatype::String { size, .. } => DType::string(*size, false),
            Datatype::VarString { .. } => DType::string(0, true),
            Datatype::Sequence { .. } | Datatype::Array { .. } => {
                DType::other(DTypeClass::Array, self.size())
            }
            Datatype::Reference { size } => DType::other(DTypeClass::Reference, *size),
            Datatype::Opaque { size } => DType::other(DTypeClass::Opaque, *size),
            Datatype::Time { size } | Datatype::Bitfield { size } => {
                DType::other(DTypeClass::Unknown, *size)
            }
        }
    }
}

fn decode_member(
    d: &mut Decoder,
    version: u8,
    compound_size: usize,
    offset_size: u8,
) -> Result<Member, H5LensError> {
    let member = match version {
        1 => {
            let name = d.padded_name()?;
            let offset = usize::try_from(d.u32()?)?;
            let rank = usize::from(d.u8()?);
            // Reserved, permutation, reserved
            d.skip(3 + 4 + 4)?;
            let mut dims = vec![];
            for n in 0..4 {
                let dim = d.u32()?;
                if n < rank {
                    dims.push(dim);
                }
            }
            let base = Datatype::decode(d, offset_size)?;
            let datatype = if dims.is_empty() {
                base
            } else {
                Datatype::Array {
                    dims,
                    base: Box::new(base),
                }
            };
            Member {
                name,
                offset,
                datatype,
            }
        }
        2 => Member {
            name: d.padded_name()?,
            offset: usize::try_from(d.u32()?)?,
            datatype: Datatype::decode(d, offset_size)?,
        },
        3 => Member {
            name: d.cstring()?,
            offset: usize::try_from(d.uint(encoded_width(compound_size as u64))?)?,
            datatype: Datatype::decode(d, offset_size)?,
        },
        _ => return Err(malformed(format!("compound datatype version {version}"))),
    };
    Ok(member)
}
