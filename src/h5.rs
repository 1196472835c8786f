//! A read-only HDF5 container reader.
//!
//! Files are read through a [BlockReader](crate::range_reader::BlockReader), so opening a
//! file, walking its groups and reading a window of a dataset touch only the byte ranges those
//! operations need. Both the classic format (symbol tables, version 1 object headers and
//! B-trees) and the newer structures written by libhdf5 1.8 onwards (link messages, fractal
//! heaps, version 2 B-trees and the single, implicit, fixed array and extensible array chunk
//! indexes) are understood.

pub mod btree;
pub mod btree2;
pub mod chunk_index;
pub mod data;
pub mod datatype;
pub mod decoder;
pub mod file;
pub mod filters;
pub mod fractal_heap;
pub mod global_heap;
pub mod layout;
pub mod messages;
pub mod object_header;
pub mod raw;
#[cfg(test)]
pub(crate) mod writer;

pub use file::H5File;
