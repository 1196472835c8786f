//! Data types and associated functions and methods

use crate::array::Block;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// HDF5 datatype class
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DTypeClass {
    Integer,
    Float,
    Boolean,
    Complex,
    String,
    Compound,
    Enum,
    Array,
    Reference,
    Opaque,
    Unknown,
}

/// Byte order of stored elements
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Endianness {
    Little,
    Big,
    /// Single byte or non-numeric types
    NotApplicable,
}

impl Endianness {
    /// NumPy byte order character.
    fn code(self) -> char {
        match self {
            Endianness::Little => '<',
            Endianness::Big => '>',
            Endianness::NotApplicable => '|',
        }
    }
}

/// Coarse classification of a dataset's element type.
///
/// Computed once when a dataset is opened and used to route requests.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DataKind {
    Numeric,
    String,
    Compound,
    Unsupported,
}

/// Datatype descriptor as exposed by HDF5 type metadata.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct DType {
    /// Datatype class
    pub class: DTypeClass,
    /// Size of one element in bytes
    pub size: usize,
    /// Signedness, for integers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed: Option<bool>,
    /// Byte order
    pub endianness: Endianness,
    /// Whether strings are variable length
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variable_length: Option<bool>,
    /// Member names, for compound types
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl DType {
    fn new(class: DTypeClass, size: usize, endianness: Endianness) -> Self {
        DType {
            class,
            size,
            signed: None,
            endianness,
            variable_length: None,
            fields: vec![],
        }
    }

    /// A little-endian integer type.
    pub fn integer(size: usize, signed: bool) -> Self {
        let endianness = if size == 1 {
            Endianness::NotApplicable
        } else {
            Endianness::Little
        };
        DType {
            signed: Some(signed),
            ..Self::new(DTypeClass::Integer, size, endianness)
        }
    }

    /// A little-endian IEEE float type.
    pub fn float(size: usize) -> Self {
        Self::new(DTypeClass::Float, size, Endianness::Little)
    }

    pub fn boolean() -> Self {
        Self::new(DTypeClass::Boolean, 1, Endianness::NotApplicable)
    }

    /// A complex type of two floats, `size` bytes in total.
    pub fn complex(size: usize) -> Self {
        Self::new(DTypeClass::Complex, size, Endianness::Little)
    }

    /// A byte string type. Variable length strings have no fixed size.
    pub fn string(size: usize, variable_length: bool) -> Self {
        DType {
            variable_length: Some(variable_length),
            ..Self::new(DTypeClass::String, size, Endianness::NotApplicable)
        }
    }

    pub fn compound(size: usize, fields: Vec<String>) -> Self {
        DType {
            fields,
            ..Self::new(DTypeClass::Compound, size, Endianness::NotApplicable)
        }
    }

    /// A type this crate describes but cannot read.
    pub fn other(class: DTypeClass, size: usize) -> Self {
        Self::new(class, size, Endianness::NotApplicable)
    }

    /// Returns the coarse [DataKind] for this type.
    pub fn kind(&self) -> DataKind {
        match self.class {
            DTypeClass::Integer
            | DTypeClass::Float
            | DTypeClass::Boolean
            | DTypeClass::Enum
            | DTypeClass::Complex => DataKind::Numeric,
            DTypeClass::String => DataKind::String,
            DTypeClass::Compound => DataKind::Compound,
            DTypeClass::Array | DTypeClass::Reference | DTypeClass::Opaque | DTypeClass::Unknown => {
                DataKind::Unsupported
            }
        }
    }

    /// Whether elements are real numbers that can be plotted and reduced.
    pub fn is_real(&self) -> bool {
        self.kind() == DataKind::Numeric && self.class != DTypeClass::Complex
    }

    /// Whether elements can be read into a [Block].
    pub fn is_readable(&self) -> bool {
        matches!(self.kind(), DataKind::Numeric | DataKind::String)
    }
}

impl std::fmt::Display for DType {
    /// Formats the type as a NumPy type string, e.g. `<f8` or `|S10`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let order = self.endianness.code();
        match self.class {
            DTypeClass::Integer | DTypeClass::Enum => {
                let letter = if self.signed == Some(false) { 'u' } else { 'i' };
                write!(f, "{}{}{}", order, letter, self.size)
            }
            DTypeClass::Float => write!(f, "{}f{}", order, self.size),
            DTypeClass::Complex => write!(f, "{}c{}", order, self.size),
            DTypeClass::Boolean => write!(f, "|b1"),
            DTypeClass::String if self.variable_length == Some(true) => write!(f, "|O"),
            DTypeClass::String => write!(f, "|S{}", self.size),
            _ => write!(f, "|V{}", self.size),
        }
    }
}

/// Shape and type of a dataset, cached per file version.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DatasetInfo {
    pub path: String,
    pub shape: Vec<usize>,
    pub ndim: usize,
    pub dtype: String,
    pub kind: DataKind,
    pub type_info: DType,
}

impl DatasetInfo {
    pub fn new(path: &str, shape: &[usize], dtype: &DType) -> Self {
        DatasetInfo {
            path: path.to_string(),
            shape: shape.to_vec(),
            ndim: shape.len(),
            dtype: dtype.to_string(),
            kind: dtype.kind(),
            type_info: dtype.clone(),
        }
    }
}

/// Type of node inside a container
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeType {
    Group,
    Dataset,
}

/// One entry of a group listing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChildInfo {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_children: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
}

/// A filter in a dataset's storage pipeline.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FilterInfo {
    pub id: u32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
}

/// A named attribute attached to a group or dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub dtype: DType,
    pub value: Block,
}

/// Raw HDF5 type information, named after the library's constants.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawTypeInfo {
    pub class: String,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign: Option<String>,
}

impl From<&DType> for RawTypeInfo {
    fn from(dtype: &DType) -> Self {
        let class = match dtype.class {
            DTypeClass::Integer => "H5T_INTEGER",
            DTypeClass::Float => "H5T_FLOAT",
            DTypeClass::Boolean | DTypeClass::Enum => "H5T_ENUM",
            DTypeClass::Complex | DTypeClass::Compound => "H5T_COMPOUND",
            DTypeClass::String => "H5T_STRING",
            DTypeClass::Array => "H5T_ARRAY",
            DTypeClass::Reference => "H5T_REFERENCE",
            DTypeClass::Opaque => "H5T_OPAQUE",
            DTypeClass::Unknown => "H5T_NO_CLASS",
        };
        let order = match dtype.endianness {
            Endianness::Little => Some("H5T_ORDER_LE".to_string()),
            Endianness::Big => Some("H5T_ORDER_BE".to_string()),
            Endianness::NotApplicable => None,
        };
        let sign = dtype.signed.map(|signed| {
            if signed {
                "H5T_SGN_2".to_string()
            } else {
                "H5T_SGN_NONE".to_string()
            }
        });
        RawTypeInfo {
            class: class.to_string(),
            size: dtype.size,
            order,
            sign,
        }
    }
}

/// Storage layout details of a dataset.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DatasetLayout {
    pub chunks: Option<Vec<usize>>,
    pub filters: Vec<FilterInfo>,
}

impl DatasetLayout {
    /// Name of the first compression filter, if any.
    pub fn compression(&self) -> Option<String> {
        self.filters
            .iter()
            .find(|filter| filter.name != "shuffle" && filter.name != "fletcher32")
            .map(|filter| filter.name.clone())
    }
}

/// Line profile quality
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Quality {
    /// Every element of the window, bounded by the exact-points ceiling
    Exact,
    /// Stride-downsampled to at most `max_points`
    Overview,
    /// Exact when the window fits, overview otherwise
    Auto,
}

/// Preview level of detail
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Detail {
    Fast,
    Full,
}

/// Requested preview mode
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PreviewMode {
    Auto,
    Table,
    Line,
    Heatmap,
}

/// Export mode
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExportMode {
    Matrix,
    Line,
}

/// The axis a line profile varies along.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineDim {
    /// Vary the column display axis, pinning the row display axis
    Row,
    /// Vary the row display axis, pinning the column display axis
    Col,
    /// Vary the given dataset axis
    Axis(usize),
}

impl std::fmt::Display for LineDim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineDim::Row => write!(f, "row"),
            LineDim::Col => write!(f, "col"),
            LineDim::Axis(axis) => write!(f, "{}", axis),
        }
    }
}
