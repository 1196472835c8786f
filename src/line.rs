//! Line profile extraction.
//!
//! A line profile varies a single axis of a dataset, pinning every other axis. `exact`
//! profiles return every element of the window and are bounded by the exact-points ceiling.
//! `overview` profiles stride the window down to at most `max_points` elements. `auto` picks
//! `exact` whenever the window already fits.

use crate::array::{AxisSlice, Block};
use crate::axes::{resolve_line, LineSelection};
use crate::dataset::DatasetHandle;
use crate::error::H5LensError;
use crate::limits::{Limit, Limits};
use crate::models::{DataKind, DatasetInfo, Quality};
use crate::request::LineRequest;
use crate::sanitize::Sanitize;

use serde::Serialize;
use std::collections::BTreeMap;

/// Window and quality of a line profile.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LineParams {
    pub line_offset: usize,
    /// Window length, to the end of the axis when absent
    pub line_limit: Option<usize>,
    pub quality: Quality,
    /// Point budget, the configured overview default when absent
    pub max_points: Option<usize>,
}

impl From<&LineRequest> for LineParams {
    fn from(request: &LineRequest) -> Self {
        LineParams {
            line_offset: request.line_offset,
            line_limit: request.line_limit,
            quality: request.quality,
            max_points: request.max_points,
        }
    }
}

/// How a line profile was reduced
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LineDownsample {
    pub quality_requested: Quality,
    pub quality_applied: Quality,
    pub window_length: usize,
    pub max_points: usize,
    pub returned_points: usize,
    pub stride: usize,
    /// Whether the window was cut short by the end of the axis
    pub clamped: bool,
}

/// Position of the returned points along the varying axis.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LineAxis {
    pub axis: usize,
    pub fixed_indices: BTreeMap<usize, usize>,
    /// Index of the first point
    pub start: usize,
    /// Distance between points
    pub step: usize,
    pub count: usize,
}

/// The minimal read for a line profile, computed before any data is read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinePlan {
    pub line: LineSelection,
    pub offset: usize,
    pub stride: usize,
    pub downsample: LineDownsample,
}

impl LinePlan {
    pub fn slice(&self) -> AxisSlice {
        AxisSlice::window(self.offset, self.downsample.returned_points, self.stride)
    }

    pub fn axis_meta(&self) -> LineAxis {
        LineAxis {
            axis: self.line.axis,
            fixed_indices: self.line.fixed_indices.clone(),
            start: self.offset,
            step: self.stride,
            count: self.downsample.returned_points,
        }
    }
}

/// Check that a dataset can be plotted.
pub fn check_plottable(info: &DatasetInfo, operation: &'static str) -> Result<(), H5LensError> {
    if info.kind != DataKind::Numeric {
        return Err(H5LensError::UnsupportedDtype {
            operation,
            dtype: info.dtype.clone(),
        });
    }
    Ok(())
}

/// Plan a line profile over a resolved axis.
pub fn plan(
    info: &DatasetInfo,
    line: LineSelection,
    params: &LineParams,
    limits: &Limits,
) -> Result<LinePlan, H5LensError> {
    let extent = info.shape[line.axis];
    if params.line_offset > extent {
        return Err(H5LensError::OutOfRange {
            axis: line.axis,
            offset: params.line_offset,
            extent,
        });
    }
    let available = extent - params.line_offset;
    let window = params.line_limit.map_or(available, |limit| limit.min(available));
    let max_points = params.max_points.unwrap_or(limits.default_line_points);
    if max_points == 0 {
        return Err(H5LensError::invalid("max_points", "must be at least 1"));
    }
    limits.check(Limit::MaxLinePoints, max_points as u64)?;

    let exact_fits = window as u64 <= (max_points as u64).min(limits.max_line_exact_points);
    let quality_applied = match params.quality {
        Quality::Exact => {
            limits.check(Limit::MaxLineExactPoints, window as u64)?;
            Quality::Exact
        }
        Quality::Overview => Quality::Overview,
        Quality::Auto if exact_fits => Quality::Exact,
        Quality::Auto => Quality::Overview,
    };
    let stride = match quality_applied {
        Quality::Exact => 1,
        _ => window.div_ceil(max_points).max(1),
    };
    let returned_points = window.div_ceil(stride);
    Ok(LinePlan {
        line,
        offset: params.line_offset,
        stride,
        downsample: LineDownsample {
            quality_requested: params.quality,
            quality_applied,
            window_length: window,
            max_points,
            returned_points,
            stride,
            clamped: params.line_limit.is_some_and(|limit| limit > available),
        },
    })
}

/// Plan a line request against a dataset's shape and type.
pub fn plan_request(
    info: &DatasetInfo,
    request: &LineRequest,
    limits: &Limits,
) -> Result<LinePlan, H5LensError> {
    check_plottable(info, "line")?;
    limits.check(Limit::MaxLineCompare, request.compare.len() as u64)?;
    let line = resolve_line(
        &info.shape,
        request.display_dims,
        &request.fixed_indices,
        request.line_dim,
        request.line_index,
    )?;
    let plan = plan(info, line, &LineParams::from(request), limits)?;
    let series = 1 + request.compare.len() as u64;
    limits.check(
        Limit::MaxJsonElements,
        (plan.downsample.returned_points as u64).saturating_mul(series),
    )?;
    Ok(plan)
}

/// Check that a dataset can be overlaid on the primary series.
pub fn check_compare(primary: &DatasetInfo, other: &DatasetInfo) -> Result<(), H5LensError> {
    let incompatible = |reason: String| H5LensError::IncompatibleCompare {
        path: other.path.clone(),
        reason,
    };
    if other.path == primary.path {
        return Err(incompatible("a dataset cannot be compared with itself".to_string()));
    }
    if other.kind != DataKind::Numeric {
        return Err(incompatible(format!("dtype {} is not numeric", other.dtype)));
    }
    if other.shape != primary.shape {
        return Err(incompatible(format!(
            "shape {:?} differs from {:?}",
            other.shape, primary.shape
        )));
    }
    Ok(())
}

/// Read the planned points.
pub fn extract(handle: &dyn DatasetHandle, plan: &LinePlan) -> Result<Block, H5LensError> {
    let selection = plan.line.selection(handle.ndim(), plan.slice());
    let block = handle.read(&selection)?;
    crate::metrics::record_extracted("line", block.len() as u64);
    Ok(block)
}

/// An extra series read with the primary plan.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompareSeries {
    pub path: String,
    pub dtype: String,
    pub data: serde_json::Value,
}

/// JSON payload of a line profile.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LinePayload {
    pub mode: &'static str,
    pub path: String,
    pub dtype: String,
    pub source_shape: Vec<usize>,
    pub shape: Vec<usize>,
    pub axis_meta: LineAxis,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<CompareSeries>,
    pub downsample_info: LineDownsample,
}

/// Plan, read and render a line request, overlaying any compare datasets.
pub fn get_line(
    handle: &dyn DatasetHandle,
    compare: &[Box<dyn DatasetHandle>],
    request: &LineRequest,
    limits: &Limits,
) -> Result<LinePayload, H5LensError> {
    let info = handle.info();
    let plan = plan_request(&info, request, limits)?;
    for other in compare {
        check_compare(&info, &other.info())?;
    }
    let block = extract(handle, &plan)?;
    let series = compare
        .iter()
        .map(|other| {
            let block = extract(other.as_ref(), &plan)?;
            Ok(CompareSeries {
                path: other.path().to_string(),
                dtype: other.dtype().to_string(),
                data: block.sanitize(),
            })
        })
        .collect::<Result<Vec<_>, H5LensError>>()?;
    Ok(LinePayload {
        mode: "line",
        path: info.path.clone(),
        dtype: info.dtype.clone(),
        source_shape: info.shape.clone(),
        shape: block.shape().to_vec(),
        axis_meta: plan.axis_meta(),
        data: block.sanitize(),
        series,
        downsample_info: plan.downsample,
    })
}
