//! Axis normalization.
//!
//! A view of an N-dimensional dataset displays at most two axes and pins every other axis at a
//! single index. [normalize] resolves the requested display axes and fixed indices against a
//! shape so that every axis is classified exactly once and every pin is in bounds.

use crate::array::{AxisSlice, Selection};
use crate::error::H5LensError;
use crate::models::LineDim;
use crate::request::FixedIndices;

use serde::Serialize;
use std::collections::BTreeMap;

/// Resolved axes of a two dimensional view.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct AxisSelection {
    /// Row and column axes, `None` below two dimensions
    pub display_dims: Option<(usize, usize)>,
    /// Index of every axis that is not displayed
    pub fixed_indices: BTreeMap<usize, usize>,
}

impl AxisSelection {
    /// Whether the row axis comes after the column axis in the dataset.
    ///
    /// A read returns axes in dataset order, so such a block must be transposed.
    pub fn is_transposed(&self) -> bool {
        matches!(self.display_dims, Some((rows, cols)) if rows > cols)
    }

    /// Build the read selection for a window over the display axes.
    pub fn selection(&self, ndim: usize, rows: AxisSlice, cols: AxisSlice) -> Selection {
        let (row_axis, col_axis) = self.display_dims.unwrap_or((0, 1));
        Selection(
            (0..ndim)
                .map(|axis| {
                    if axis == row_axis {
                        rows
                    } else if axis == col_axis {
                        cols
                    } else {
                        AxisSlice::Index(self.fixed_indices.get(&axis).copied().unwrap_or(0))
                    }
                })
                .collect(),
        )
    }
}

/// Resolved axes of a line profile.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LineSelection {
    /// The varying axis
    pub axis: usize,
    /// Index of every other axis
    pub fixed_indices: BTreeMap<usize, usize>,
}

impl LineSelection {
    /// Build the read selection for a window over the varying axis.
    pub fn selection(&self, ndim: usize, window: AxisSlice) -> Selection {
        Selection(
            (0..ndim)
                .map(|axis| {
                    if axis == self.axis {
                        window
                    } else {
                        AxisSlice::Index(self.fixed_indices.get(&axis).copied().unwrap_or(0))
                    }
                })
                .collect(),
        )
    }
}

/// Clamp a requested index into `[0, extent - 1]`.
pub fn clamp_index(index: i64, extent: usize) -> usize {
    if index <= 0 || extent == 0 {
        0
    } else {
        (index as u64).min(extent as u64 - 1) as usize
    }
}

/// Resolve the index of a pinned axis, defaulting to the midpoint.
fn pin(extent: usize, requested: Option<&i64>) -> usize {
    requested.map_or(extent / 2, |index| clamp_index(*index, extent))
}

fn check_fixed_axes(ndim: usize, fixed: &FixedIndices) -> Result<(), H5LensError> {
    match fixed.keys().find(|axis| **axis >= ndim) {
        Some(axis) => Err(H5LensError::invalid(
            "fixed_indices",
            format!("axis {} is out of range for {} dimensions", axis, ndim),
        )),
        None => Ok(()),
    }
}

/// Validate display axes and fixed indices against a shape.
pub fn normalize(
    shape: &[usize],
    display_dims: Option<(usize, usize)>,
    fixed: &FixedIndices,
) -> Result<AxisSelection, H5LensError> {
    let ndim = shape.len();
    if ndim < 2 {
        if let Some(axis) = fixed.keys().next() {
            return Err(H5LensError::invalid(
                "fixed_indices",
                format!(
                    "cannot pin axis {} of a {}-dimensional dataset",
                    axis, ndim
                ),
            ));
        }
        return Ok(AxisSelection {
            display_dims: None,
            fixed_indices: BTreeMap::new(),
        });
    }
    check_fixed_axes(ndim, fixed)?;

    let unpinned = || (0..ndim).filter(|axis| !fixed.contains_key(axis));
    let (rows, cols) = match display_dims {
        None => {
            let free: Vec<usize> = unpinned().take(2).collect();
            match free[..] {
                [rows, cols] => (rows, cols),
                _ => {
                    return Err(H5LensError::invalid(
                        "fixed_indices",
                        "at least two axes must be left unpinned",
                    ))
                }
            }
        }
        Some((rows, cols)) => {
            if let Some(axis) = [rows, cols].into_iter().find(|axis| *axis >= ndim) {
                return Err(H5LensError::invalid(
                    "display_dims",
                    format!("axis {} is out of range for {} dimensions", axis, ndim),
                ));
            }
            let cols = if rows == cols {
                unpinned().find(|axis| *axis != rows).ok_or_else(|| {
                    H5LensError::invalid(
                        "display_dims",
                        format!("no free axis to pair with axis {}", rows),
                    )
                })?
            } else {
                cols
            };
            if let Some(axis) = [rows, cols].into_iter().find(|axis| fixed.contains_key(axis)) {
                return Err(H5LensError::invalid(
                    "display_dims",
                    format!("axis {} is both displayed and pinned", axis),
                ));
            }
            (rows, cols)
        }
    };

    let fixed_indices = (0..ndim)
        .filter(|axis| *axis != rows && *axis != cols)
        .map(|axis| (axis, pin(shape[axis], fixed.get(&axis))))
        .collect();
    Ok(AxisSelection {
        display_dims: Some((rows, cols)),
        fixed_indices,
    })
}

/// Resolve a single varying axis, pinning every other axis.
pub fn normalize_line(
    shape: &[usize],
    axis: usize,
    fixed: &FixedIndices,
) -> Result<LineSelection, H5LensError> {
    let ndim = shape.len();
    if axis >= ndim {
        return Err(H5LensError::invalid(
            "line_dim",
            format!("axis {} is out of range for {} dimensions", axis, ndim),
        ));
    }
    check_fixed_axes(ndim, fixed)?;
    if fixed.contains_key(&axis) {
        return Err(H5LensError::invalid(
            "fixed_indices",
            format!("axis {} is the line axis and cannot be pinned", axis),
        ));
    }
    let fixed_indices = (0..ndim)
        .filter(|other| *other != axis)
        .map(|other| (other, pin(shape[other], fixed.get(&other))))
        .collect();
    Ok(LineSelection {
        axis,
        fixed_indices,
    })
}

/// Resolve the axes of a line profile request.
///
/// * One dimension: the only axis varies.
/// * `row` varies the column display axis, pinning the row display axis at `line_index`.
/// * `col` varies the row display axis, pinning the column display axis at `line_index`.
/// * An integer axis varies that axis. In two dimensions `line_index` pins the other axis,
///   otherwise `fixed_indices` are used.
pub fn resolve_line(
    shape: &[usize],
    display_dims: Option<(usize, usize)>,
    fixed: &FixedIndices,
    line_dim: Option<LineDim>,
    line_index: Option<i64>,
) -> Result<LineSelection, H5LensError> {
    match shape.len() {
        0 => Err(H5LensError::invalid(
            "path",
            "a scalar dataset has no axis to plot",
        )),
        1 => match line_dim {
            Some(LineDim::Axis(axis)) => normalize_line(shape, axis, fixed),
            _ => normalize_line(shape, 0, fixed),
        },
        ndim => match line_dim.unwrap_or(LineDim::Row) {
            LineDim::Axis(axis) if ndim == 2 => {
                let mut fixed = fixed.clone();
                if let Some(index) = line_index {
                    fixed.insert(1 - axis.min(1), index);
                }
                normalize_line(shape, axis, &fixed)
            }
            LineDim::Axis(axis) => normalize_line(shape, axis, fixed),
            dim => {
                let axes = normalize(shape, display_dims, fixed)?;
                let (rows, cols) = axes.display_dims.unwrap_or((0, 1));
                let (varying, pinned) = if dim == LineDim::Row {
                    (cols, rows)
                } else {
                    (rows, cols)
                };
                let mut fixed_indices = axes.fixed_indices;
                fixed_indices.insert(pinned, pin(shape[pinned], line_index.as_ref()));
                Ok(LineSelection {
                    axis: varying,
                    fixed_indices,
                })
            }
        },
    }
}
