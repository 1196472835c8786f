//! Functions and utilities for working with [ndarray] objects.
//!
//! A read from a dataset produces a [Block]: an n-dimensional array in one of a small set of
//! native element types. The variant is chosen once from the dataset's dtype, so code that
//! walks a block dispatches per block rather than per element.

use crate::error::H5LensError;

use core::convert::TryFrom;
use ndarray::prelude::*;
use ndarray::{SliceInfo, SliceInfoElem};

/// A complex number with double precision parts.
pub use num_complex::Complex64 as Complex;

/// Selection of a single axis for a read.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AxisSlice {
    /// Pin the axis at one index. The axis is removed from the result.
    Index(usize),
    /// Half-open range `start..end` sampled every `step` elements.
    Range { start: usize, end: usize, step: usize },
}

impl AxisSlice {
    /// A range covering `count` samples from `start`, `step` apart.
    pub fn window(start: usize, count: usize, step: usize) -> Self {
        let end = if count == 0 {
            start
        } else {
            start + (count - 1) * step + 1
        };
        AxisSlice::Range { start, end, step }
    }

    /// Number of elements this axis contributes, or `None` for a pinned axis.
    pub fn len(&self) -> Option<usize> {
        match *self {
            AxisSlice::Index(_) => None,
            AxisSlice::Range { start, end, step } => {
                if end <= start {
                    Some(0)
                } else {
                    Some((end - start).div_ceil(step))
                }
            }
        }
    }
}

/// A per-axis selection describing the minimal read for a request.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Selection(pub Vec<AxisSlice>);

impl Selection {
    /// Shape of the block a read of this selection produces.
    pub fn output_shape(&self) -> Vec<usize> {
        self.0.iter().filter_map(AxisSlice::len).collect()
    }

    /// Number of elements a read of this selection produces.
    pub fn element_count(&self) -> u64 {
        crate::limits::product(&self.output_shape())
    }

    /// Check the selection against a shape.
    ///
    /// Slicing an [ndarray] out of bounds panics, so every read is validated first.
    pub fn validate(&self, shape: &[usize]) -> Result<(), H5LensError> {
        if self.0.len() != shape.len() {
            return Err(H5LensError::invalid(
                "selection",
                format!(
                    "selection has {} axes but dataset has {}",
                    self.0.len(),
                    shape.len()
                ),
            ));
        }
        for (axis, (slice, extent)) in std::iter::zip(&self.0, shape).enumerate() {
            let extent = *extent;
            match *slice {
                AxisSlice::Index(index) if index >= extent => {
                    return Err(H5LensError::OutOfRange {
                        axis,
                        offset: index,
                        extent,
                    })
                }
                AxisSlice::Range { step: 0, .. } => {
                    return Err(H5LensError::invalid("step", "step must be at least 1"))
                }
                AxisSlice::Range { start, end, .. } if start > extent || end > extent => {
                    return Err(H5LensError::OutOfRange {
                        axis,
                        offset: start.max(end),
                        extent,
                    })
                }
                _ => (),
            }
        }
        Ok(())
    }
}

/// Returns an [ndarray] SliceInfo object corresponding to the selection.
pub fn build_slice_info(
    selection: &Selection,
) -> Result<SliceInfo<Vec<SliceInfoElem>, IxDyn, IxDyn>, H5LensError> {
    let si: Vec<SliceInfoElem> = selection
        .0
        .iter()
        .map(|slice| match *slice {
            AxisSlice::Index(index) => SliceInfoElem::Index(index as isize),
            AxisSlice::Range { start, end, step } => SliceInfoElem::Slice {
                start: start as isize,
                end: Some(end.max(start) as isize),
                step: step as isize,
            },
        })
        .collect();
    Ok(SliceInfo::try_from(si)?)
}

/// Typed result of a dataset read.
#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    Bool(ArrayD<bool>),
    Int(ArrayD<i64>),
    UInt(ArrayD<u64>),
    Float(ArrayD<f64>),
    Complex(ArrayD<Complex>),
    Bytes(ArrayD<Vec<u8>>),
    Text(ArrayD<String>),
}

/// Apply an expression to the array inside any [Block] variant, rewrapping the result in the
/// same variant.
macro_rules! map_block {
    ($block:expr, $array:ident => $body:expr) => {
        match $block {
            Block::Bool($array) => Block::Bool($body),
            Block::Int($array) => Block::Int($body),
            Block::UInt($array) => Block::UInt($body),
            Block::Float($array) => Block::Float($body),
            Block::Complex($array) => Block::Complex($body),
            Block::Bytes($array) => Block::Bytes($body),
            Block::Text($array) => Block::Text($body),
        }
    };
}

/// Evaluate an expression against the array inside any [Block] variant.
macro_rules! with_block {
    ($block:expr, $array:ident => $body:expr) => {
        match $block {
            Block::Bool($array) => $body,
            Block::Int($array) => $body,
            Block::UInt($array) => $body,
            Block::Float($array) => $body,
            Block::Complex($array) => $body,
            Block::Bytes($array) => $body,
            Block::Text($array) => $body,
        }
    };
}

impl Block {
    /// Shape of the block.
    pub fn shape(&self) -> &[usize] {
        with_block!(self, array => array.shape())
    }

    /// Number of dimensions of the block.
    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Number of elements in the block.
    pub fn len(&self) -> usize {
        with_block!(self, array => array.len())
    }

    /// Whether the block has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out the elements covered by `selection`.
    pub fn select(&self, selection: &Selection) -> Result<Block, H5LensError> {
        selection.validate(self.shape())?;
        let info = build_slice_info(selection)?;
        Ok(map_block!(self, array => array.slice(&info).to_owned()))
    }

    /// Reverse the order of the axes (transpose for two dimensions).
    pub fn reversed_axes(self) -> Block {
        map_block!(self, array => array.reversed_axes())
    }

    /// Returns a float copy of real numeric blocks, or `None` for other element types.
    pub fn to_f64(&self) -> Option<ArrayD<f64>> {
        match self {
            Block::Bool(array) => Some(array.mapv(|v| if v { 1.0 } else { 0.0 })),
            Block::Int(array) => Some(array.mapv(|v| v as f64)),
            Block::UInt(array) => Some(array.mapv(|v| v as f64)),
            Block::Float(array) => Some(array.clone()),
            Block::Complex(_) | Block::Bytes(_) | Block::Text(_) => None,
        }
    }
}
