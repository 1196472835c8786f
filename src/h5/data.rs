//! Reading dataset elements.
//!
//! A read fetches only the storage a selection touches: the chunks holding selected elements,
//! or the spans of a contiguous block between the first and last selected element of each row.
//! Elements are gathered into a buffer sized from the selection, then decoded into a [Block].

use super::chunk_index::{self, ChunkGrid};
use super::datatype::Datatype;
use super::decoder::malformed;
use super::filters::FilterPipeline;
use super::global_heap::GlobalHeapReader;
use super::layout::{ChunkIndexKind, Layout};
use super::messages::Dataspace;
use super::raw::RawFile;
use crate::array::{AxisSlice, Block, Complex, Selection};
use crate::dataset::DatasetHandle;
use crate::error::H5LensError;
use crate::models::{DType, DatasetLayout};

use bytes::Bytes;
use ndarray::{ArrayD, IxDyn};
use std::sync::Arc;

/// Widest gap between selected elements of a row that is read through rather than skipped.
const MAX_GAP: usize = 4096;

/// An opened dataset of an HDF5 file.
pub struct H5Dataset {
    file: Arc<RawFile>,
    path: String,
    shape: Vec<usize>,
    dataspace: Dataspace,
    datatype: Datatype,
    dtype: DType,
    layout: Layout,
    filters: FilterPipeline,
    fill: Option<Bytes>,
}

impl H5Dataset {
    pub fn new(
        file: Arc<RawFile>,
        path: String,
        dataspace: Dataspace,
        datatype: Datatype,
        layout: Layout,
        filters: FilterPipeline,
        fill: Option<Bytes>,
    ) -> Result<Self, H5LensError> {
        Ok(H5Dataset {
            shape: dataspace.shape()?,
            dtype: datatype.to_dtype(),
            file,
            path,
            dataspace,
            datatype,
            layout,
            filters,
            fill,
        })
    }

    /// Chunk shape and filters.
    pub fn storage(&self) -> DatasetLayout {
        DatasetLayout {
            chunks: self
                .layout
                .chunk_shape()
                .map(|chunk| chunk.iter().map(|c| *c as usize).collect()),
            filters: self.filters.info(),
        }
    }

    fn element_size(&self) -> usize {
        self.datatype.stored_size(self.file.sizes.offset)
    }

    /// Gather the stored bytes of the selected elements, in selection order.
    fn gather(&self, selection: &Selection) -> Result<Vec<u8>, H5LensError> {
        let esize = self.element_size();
        let count = usize::try_from(selection.element_count())?;
        let fill = match &self.fill {
            Some(fill) if fill.len() == esize => fill.to_vec(),
            _ => vec![0; esize],
        };
        if count.checked_mul(esize).is_none() {
            return Err(malformed(format!("selection of {count} elements is too large")));
        }
        let mut out = fill.repeat(count);
        if count == 0 {
            return Ok(out);
        }
        let positions = positions(selection);
        match &self.layout {
            Layout::Compact(data) => {
                let data = data.clone();
                self.gather_flat(&positions, &mut out, |offset, len| {
                    let end = offset + len;
                    if end > data.len() as u64 {
                        return Err(malformed("compact dataset is shorter than its extent"));
                    }
                    Ok(data.slice(offset as usize..end as usize))
                })?;
            }
            Layout::Contiguous {
                address: Some(address),
                ..
            } => {
                let file = &self.file;
                self.gather_flat(&positions, &mut out, |offset, len| {
                    file.read(address + offset, len)
                })?;
            }
            Layout::Contiguous { address: None, .. } => (),
            Layout::Chunked { address: None, .. } => (),
            Layout::Chunked {
                chunk,
                index,
                address: Some(address),
            } => {
                if chunk.len() != self.shape.len() || chunk.contains(&0) {
                    return Err(malformed(format!(
                        "{} has chunks {chunk:?} for {} dimensions",
                        self.path,
                        self.shape.len()
                    )));
                }
                let grid = ChunkGrid {
                    chunk: chunk.clone(),
                    dims: self.dataspace.dims.clone(),
                    max_dims: self.dataspace.max_dims.clone(),
                    element_size: esize,
                    filtered: !self.filters.is_empty(),
                };
                self.gather_chunked(index, *address, &grid, &positions, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Gather from elements stored back to back in row-major order.
    fn gather_flat<R>(
        &self,
        positions: &[Vec<usize>],
        out: &mut [u8],
        read: R,
    ) -> Result<(), H5LensError>
    where
        R: Fn(u64, u64) -> Result<Bytes, H5LensError>,
    {
        let esize = self.element_size();
        let strides = strides(&self.shape);
        let Some((last, outer)) = positions.split_last() else {
            // A scalar is one element.
            out.copy_from_slice(&read(0, esize as u64)?[..esize]);
            return Ok(());
        };
        let first = last[0];
        let span = last[last.len() - 1] - first + 1;
        let step = if last.len() > 1 { last[1] - last[0] } else { 1 };
        let through = (step - 1) * esize <= MAX_GAP;
        let extents: Vec<usize> = outer.iter().map(Vec::len).collect();
        let mut row = 0;
        for_each_index(&extents, |index| {
            let base: usize = index
                .iter()
                .zip(outer)
                .zip(&strides)
                .map(|((i, axis), stride)| axis[*i] * stride)
                .sum();
            let dest = &mut out[row * last.len() * esize..(row + 1) * last.len() * esize];
            row += 1;
            if through {
                let data = read(((base + first) * esize) as u64, (span * esize) as u64)?;
                for (n, position) in last.iter().enumerate() {
                    let at = (position - first) * esize;
                    dest[n * esize..(n + 1) * esize].copy_from_slice(&data[at..at + esize]);
                }
            } else {
                for (n, position) in last.iter().enumerate() {
                    let data = read(((base + position) * esize) as u64, esize as u64)?;
                    dest[n * esize..(n + 1) * esize].copy_from_slice(&data[..esize]);
                }
            }
            Ok(())
        })
    }

    fn gather_chunked(
        &self,
        index: &ChunkIndexKind,
        address: u64,
        grid: &ChunkGrid,
        positions: &[Vec<usize>],
        out: &mut [u8],
    ) -> Result<(), H5LensError> {
        let esize = grid.element_size;
        let chunk_bytes = usize::try_from(grid.chunk_bytes())?;
        let chunk: Vec<usize> = grid.chunk.iter().map(|c| *c as usize).collect();
        let out_extents: Vec<usize> = positions.iter().map(Vec::len).collect();
        let out_strides = strides(&out_extents);
        let chunk_strides = strides(&chunk);

        // Selected positions of each axis grouped by the chunk holding them, as
        // (output position, position within the chunk).
        let groups: Vec<Vec<(u64, Vec<(usize, usize)>)>> = positions
            .iter()
            .zip(&chunk)
            .map(|(axis, extent)| {
                let mut groups: Vec<(u64, Vec<(usize, usize)>)> = vec![];
                for (n, position) in axis.iter().enumerate() {
                    let scaled = (position / extent) as u64;
                    let member = (n, position % extent);
                    match groups.last_mut() {
                        Some((last, members)) if *last == scaled => members.push(member),
                        _ => groups.push((scaled, vec![member])),
                    }
                }
                groups
            })
            .collect();
        let group_extents: Vec<usize> = groups.iter().map(Vec::len).collect();
        let mut wanted = vec![];
        for_each_index(&group_extents, |index| {
            wanted.push(
                index
                    .iter()
                    .zip(&groups)
                    .map(|(i, axis)| axis[*i].0)
                    .collect::<Vec<u64>>(),
            );
            Ok(())
        })?;
        let found = chunk_index::locate(&self.file, index, address, grid, &wanted)?;
        tracing::debug!(
            "Reading {} of {} chunks touched by a selection of {}",
            found.len(),
            wanted.len(),
            self.path
        );

        for_each_index(&group_extents, |index| {
            let scaled: Vec<u64> = index.iter().zip(&groups).map(|(i, axis)| axis[*i].0).collect();
            let Some(location) = found.get(&scaled) else {
                return Ok(());
            };
            let stored = self.file.read(location.address, location.size)?;
            let data = if self.filters.is_empty() {
                stored
            } else {
                self.filters
                    .decode_chunk(stored, location.filter_mask, esize, chunk_bytes)?
            };
            if data.len() < chunk_bytes {
                return Err(malformed(format!(
                    "chunk {scaled:?} of {} holds {} of {chunk_bytes} bytes",
                    self.path,
                    data.len()
                )));
            }
            let members: Vec<&Vec<(usize, usize)>> =
                index.iter().zip(&groups).map(|(i, axis)| &axis[*i].1).collect();
            let member_extents: Vec<usize> = members.iter().map(|m| m.len()).collect();
            for_each_index(&member_extents, |member| {
                let (mut to, mut from) = (0, 0);
                for (axis, m) in member.iter().enumerate() {
                    let (position, within) = members[axis][*m];
                    to += position * out_strides[axis];
                    from += within * chunk_strides[axis];
                }
                out[to * esize..(to + 1) * esize]
                    .copy_from_slice(&data[from * esize..(from + 1) * esize]);
                Ok(())
            })
        })
    }
}

impl DatasetHandle for H5Dataset {
    fn path(&self) -> &str {
        &self.path
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> &DType {
        &self.dtype
    }

    fn read(&self, selection: &Selection) -> Result<Block, H5LensError> {
        selection.validate(&self.shape)?;
        if !self.dtype.is_readable() {
            return Err(H5LensError::UnsupportedDtype {
                operation: "read",
                dtype: self.dtype.to_string(),
            });
        }
        let raw = self.gather(selection)?;
        let mut heap = GlobalHeapReader::new(&self.file);
        decode_elements(
            &self.datatype,
            &raw,
            &selection.output_shape(),
            self.element_size(),
            &mut heap,
        )
    }
}

/// Selected positions of each axis, in increasing order.
fn positions(selection: &Selection) -> Vec<Vec<usize>> {
    selection
        .0
        .iter()
        .map(|slice| match *slice {
            AxisSlice::Index(index) => vec![index],
            AxisSlice::Range { start, end, step } => (start..end).step_by(step.max(1)).collect(),
        })
        .collect()
}

/// Row-major element strides of a shape.
fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

/// Call `f` with every index of a grid of `extents`, in row-major order.
fn for_each_index<F>(extents: &[usize], mut f: F) -> Result<(), H5LensError>
where
    F: FnMut(&[usize]) -> Result<(), H5LensError>,
{
    if extents.contains(&0) {
        return Ok(());
    }
    let mut index = vec![0; extents.len()];
    loop {
        f(&index)?;
        let mut axis = extents.len();
        loop {
            if axis == 0 {
                return Ok(());
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < extents[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

fn unsigned(raw: &[u8], big_endian: bool) -> u64 {
    let fold = |acc: u64, byte: &u8| (acc << 8) | u64::from(*byte);
    if big_endian {
        raw.iter().fold(0, fold)
    } else {
        raw.iter().rev().fold(0, fold)
    }
}

fn signed(raw: &[u8], big_endian: bool) -> i64 {
    let bits = 8 * raw.len() as u32;
    let value = unsigned(raw, big_endian);
    if bits >= 64 {
        value as i64
    } else {
        // Sign extend from the stored width.
        ((value << (64 - bits)) as i64) >> (64 - bits)
    }
}

/// Convert an IEEE half precision value.
fn half_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = i32::from((bits >> 10) & 0x1f);
    let fraction = f64::from(bits & 0x03ff);
    match exponent {
        0 => sign * fraction * 2f64.powi(-24),
        0x1f if fraction == 0.0 => sign * f64::INFINITY,
        0x1f => f64::NAN,
        _ => sign * (1.0 + fraction / 1024.0) * 2f64.powi(exponent - 15),
    }
}

fn float(raw: &[u8], big_endian: bool) -> Option<f64> {
    let bits = unsigned(raw, big_endian);
    match raw.len() {
        2 => Some(half_to_f64(bits as u16)),
        4 => Some(f64::from(f32::from_bits(bits as u32))),
        8 => Some(f64::from_bits(bits)),
        _ => None,
    }
}

/// Decode stored elements into a [Block] of `shape`.
pub fn decode_elements(
    datatype: &Datatype,
    raw: &[u8],
    shape: &[usize],
    element_size: usize,
    heap: &mut GlobalHeapReader,
) -> Result<Block, H5LensError> {
    let unsupported = || H5LensError::UnsupportedDtype {
        operation: "read",
        dtype: datatype.to_dtype().to_string(),
    };
    if element_size == 0 {
        return Err(unsupported());
    }
    let elements = raw.chunks_exact(element_size);
    let block = match datatype {
        Datatype::Integer {
            size,
            signed: true,
            big_endian,
        } if *size <= 8 => Block::Int(ArrayD::from_shape_vec(
            IxDyn(shape),
            elements.map(|e| signed(e, *big_endian)).collect(),
        )?),
        Datatype::Integer {
            size, big_endian, ..
        } if *size <= 8 => Block::UInt(ArrayD::from_shape_vec(
            IxDyn(shape),
            elements.map(|e| unsigned(e, *big_endian)).collect(),
        )?),
        Datatype::Float { size, big_endian } if matches!(size, 2 | 4 | 8) => {
            Block::Float(ArrayD::from_shape_vec(
                IxDyn(shape),
                elements
                    .map(|e| float(e, *big_endian).unwrap_or(f64::NAN))
                    .collect(),
            )?)
        }
        Datatype::Enum { .. } if datatype.is_boolean() => Block::Bool(ArrayD::from_shape_vec(
            IxDyn(shape),
            elements.map(|e| e[0] != 0).collect(),
        )?),
        Datatype::Enum { base, .. } => {
            return decode_elements(base, raw, shape, element_size, heap)
        }
        Datatype::Compound { .. } => {
            let (real, imaginary) = datatype.complex_parts().ok_or_else(unsupported)?;
            let Datatype::Float { size, big_endian } = real.datatype else {
                return Err(unsupported());
            };
            let part = |element: &[u8], offset: usize| {
                element
                    .get(offset..offset + size)
                    .and_then(|raw| float(raw, big_endian))
                    .unwrap_or(f64::NAN)
            };
            Block::Complex(ArrayD::from_shape_vec(
                IxDyn(shape),
                elements
                    .map(|e| Complex::new(part(e, real.offset), part(e, imaginary.offset)))
                    .collect(),
            )?)
        }
        Datatype::String { padding, utf8, .. } => {
            let values = elements.map(|e| padding.trim(e));
            if *utf8 {
                Block::Text(ArrayD::from_shape_vec(
                    IxDyn(shape),
                    values
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                        .collect(),
                )?)
            } else {
                Block::Bytes(ArrayD::from_shape_vec(
                    IxDyn(shape),
                    values.map(<[u8]>::to_vec).collect(),
                )?)
            }
        }
        Datatype::VarString { padding, utf8 } => {
            let mut values = Vec::with_capacity(raw.len() / element_size);
            for element in elements {
                values.push(padding.trim(&heap.element(element)?).to_vec());
            }
            if *utf8 {
                Block::Text(ArrayD::from_shape_vec(
                    IxDyn(shape),
                    values
                        .into_iter()
                        .map(|v| String::from_utf8_lossy(&v).into_owned())
                        .collect(),
                )?)
            } else {
                Block::Bytes(ArrayD::from_shape_vec(IxDyn(shape), values)?)
            }
        }
        _ => return Err(unsupported()),
    };
    Ok(block)
}
