//! Matrix window extraction.
//!
//! A matrix view reads a window of the two display axes, pinning every other axis. Steps
//! greater than one decimate the window by point sampling; values are never averaged.

use crate::array::{AxisSlice, Block};
use crate::axes::{normalize, AxisSelection};
use crate::dataset::DatasetHandle;
use crate::error::H5LensError;
use crate::limits::{Limit, Limits};
use crate::models::{DataKind, DatasetInfo};
use crate::request::MatrixRequest;
use crate::sanitize::Sanitize;

use serde::Serialize;
use std::collections::BTreeMap;

/// Window of one axis after clamping to its extent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct BoundedWindow {
    pub offset: usize,
    pub count: usize,
    pub step: usize,
}

impl BoundedWindow {
    /// Clamp a requested window to an axis.
    ///
    /// Offsets beyond the extent are out of range. An offset equal to the extent or a zero
    /// limit gives an empty window.
    pub fn new(
        axis: usize,
        extent: usize,
        offset: usize,
        limit: usize,
        step: usize,
    ) -> Result<Self, H5LensError> {
        if step == 0 {
            return Err(H5LensError::invalid("step", "step must be at least 1"));
        }
        if offset > extent {
            return Err(H5LensError::OutOfRange {
                axis,
                offset,
                extent,
            });
        }
        let count = limit.min((extent - offset).div_ceil(step));
        Ok(BoundedWindow {
            offset,
            count,
            step,
        })
    }

    pub fn slice(&self) -> AxisSlice {
        AxisSlice::window(self.offset, self.count, self.step)
    }
}

/// Window parameters of a matrix view, with defaults resolved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WindowParams {
    pub row_offset: usize,
    pub row_limit: usize,
    pub col_offset: usize,
    pub col_limit: usize,
    pub row_step: usize,
    pub col_step: usize,
}

impl WindowParams {
    /// A window of `rows` by `cols` elements at the origin.
    pub fn head(rows: usize, cols: usize) -> Self {
        WindowParams {
            row_offset: 0,
            row_limit: rows,
            col_offset: 0,
            col_limit: cols,
            row_step: 1,
            col_step: 1,
        }
    }

    pub fn from_request(request: &MatrixRequest, limits: &Limits) -> Self {
        WindowParams {
            row_offset: request.row_offset,
            row_limit: request.row_limit.unwrap_or(limits.default_matrix_limit),
            col_offset: request.col_offset,
            col_limit: request.col_limit.unwrap_or(limits.default_matrix_limit),
            row_step: request.row_step,
            col_step: request.col_step,
        }
    }
}

/// How a matrix window was reduced
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct MatrixDownsample {
    pub requested_rows: usize,
    pub requested_cols: usize,
    pub effective_rows: usize,
    pub effective_cols: usize,
    pub row_step: usize,
    pub col_step: usize,
    /// Whether the window was cut short by the end of an axis
    pub clamped: bool,
    pub strategy: &'static str,
}

/// The minimal read for a matrix view, computed before any data is read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MatrixPlan {
    pub axes: AxisSelection,
    pub rows: BoundedWindow,
    pub cols: BoundedWindow,
    pub downsample: MatrixDownsample,
}

/// Check that a dataset's elements can be rendered in a table.
pub fn check_tabular(info: &DatasetInfo, operation: &'static str) -> Result<(), H5LensError> {
    match info.kind {
        DataKind::Numeric | DataKind::String => Ok(()),
        DataKind::Compound | DataKind::Unsupported => Err(H5LensError::UnsupportedDtype {
            operation,
            dtype: info.dtype.clone(),
        }),
    }
}

/// Plan a matrix window over resolved axes.
pub fn plan(
    info: &DatasetInfo,
    axes: AxisSelection,
    params: &WindowParams,
    limits: &Limits,
) -> Result<MatrixPlan, H5LensError> {
    let Some((row_axis, col_axis)) = axes.display_dims else {
        return Err(H5LensError::invalid(
            "path",
            format!(
                "a matrix view needs at least two dimensions, {} has {}",
                info.path, info.ndim
            ),
        ));
    };
    limits.check_all(&[
        (Limit::MaxMatrixRows, params.row_limit as u64),
        (Limit::MaxMatrixCols, params.col_limit as u64),
        (
            Limit::MaxJsonElements,
            (params.row_limit as u64).saturating_mul(params.col_limit as u64),
        ),
    ])?;
    let rows = BoundedWindow::new(
        row_axis,
        info.shape[row_axis],
        params.row_offset,
        params.row_limit,
        params.row_step,
    )?;
    let cols = BoundedWindow::new(
        col_axis,
        info.shape[col_axis],
        params.col_offset,
        params.col_limit,
        params.col_step,
    )?;
    let downsample = MatrixDownsample {
        requested_rows: params.row_limit,
        requested_cols: params.col_limit,
        effective_rows: rows.count,
        effective_cols: cols.count,
        row_step: rows.step,
        col_step: cols.step,
        clamped: rows.count < params.row_limit || cols.count < params.col_limit,
        strategy: "decimate",
    };
    Ok(MatrixPlan {
        axes,
        rows,
        cols,
        downsample,
    })
}

/// Plan a matrix request against a dataset's shape and type.
pub fn plan_request(
    info: &DatasetInfo,
    request: &MatrixRequest,
    limits: &Limits,
) -> Result<MatrixPlan, H5LensError> {
    check_tabular(info, "matrix")?;
    let axes = normalize(&info.shape, request.display_dims, &request.fixed_indices)?;
    plan(info, axes, &WindowParams::from_request(request, limits), limits)
}

/// Read the planned window. Rows of the result always follow the first display axis.
pub fn extract(handle: &dyn DatasetHandle, plan: &MatrixPlan) -> Result<Block, H5LensError> {
    let selection = plan
        .axes
        .selection(handle.ndim(), plan.rows.slice(), plan.cols.slice());
    let block = handle.read(&selection)?;
    crate::metrics::record_extracted("matrix", block.len() as u64);
    if plan.axes.is_transposed() {
        Ok(block.reversed_axes())
    } else {
        Ok(block)
    }
}

/// JSON payload of a matrix view.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MatrixPayload {
    pub mode: &'static str,
    pub path: String,
    pub dtype: String,
    pub source_shape: Vec<usize>,
    pub shape: Vec<usize>,
    pub display_dims: Option<(usize, usize)>,
    pub fixed_indices: BTreeMap<usize, usize>,
    pub row_offset: usize,
    pub col_offset: usize,
    pub data: serde_json::Value,
    pub downsample_info: MatrixDownsample,
}

impl MatrixPayload {
    pub fn new(info: &DatasetInfo, plan: &MatrixPlan, block: &Block) -> Self {
        MatrixPayload {
            mode: "matrix",
            path: info.path.clone(),
            dtype: info.dtype.clone(),
            source_shape: info.shape.clone(),
            shape: block.shape().to_vec(),
            display_dims: plan.axes.display_dims,
            fixed_indices: plan.axes.fixed_indices.clone(),
            row_offset: plan.rows.offset,
            col_offset: plan.cols.offset,
            data: block.sanitize(),
            downsample_info: plan.downsample.clone(),
        }
    }
}

/// Plan, read and render a matrix request.
pub fn get_matrix(
    handle: &dyn DatasetHandle,
    request: &MatrixRequest,
    limits: &Limits,
) -> Result<MatrixPayload, H5LensError> {
    let info = handle.info();
    let plan = plan_request(&info, request, limits)?;
    let block = extract(handle, &plan)?;
    Ok(MatrixPayload::new(&info, &plan, &block))
}
