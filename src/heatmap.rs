//! Heatmap extraction.
//!
//! A heatmap is a roughly square plane of at most `max_size` by `max_size` elements, read from
//! the display axes with one stride per axis.

use crate::array::{AxisSlice, Block};
use crate::axes::{normalize, AxisSelection};
use crate::dataset::DatasetHandle;
use crate::error::H5LensError;
use crate::limits::Limits;
use crate::models::DatasetInfo;
use crate::request::HeatmapRequest;
use crate::sanitize::Sanitize;
use crate::stats::Stats;

use serde::Serialize;
use std::collections::BTreeMap;

/// How a heatmap plane was reduced
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HeatmapDownsample {
    pub requested_max_size: usize,
    pub effective_max_size: usize,
    pub max_size_clamped: bool,
    pub source_rows: usize,
    pub source_cols: usize,
    pub stride_row: usize,
    pub stride_col: usize,
    pub output_rows: usize,
    pub output_cols: usize,
}

/// The minimal read for a heatmap, computed before any data is read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeatmapPlan {
    pub axes: AxisSelection,
    pub downsample: HeatmapDownsample,
}

/// Check that a dataset holds real numbers.
pub fn check_real(info: &DatasetInfo, operation: &'static str) -> Result<(), H5LensError> {
    if !info.type_info.is_real() {
        return Err(H5LensError::UnsupportedDtype {
            operation,
            dtype: info.dtype.clone(),
        });
    }
    Ok(())
}

/// Plan a heatmap over resolved axes.
///
/// `max_size` falls back to `default_size` and is clamped to the heatmap ceiling.
pub fn plan(
    info: &DatasetInfo,
    axes: AxisSelection,
    max_size: Option<usize>,
    default_size: usize,
    limits: &Limits,
) -> Result<HeatmapPlan, H5LensError> {
    check_real(info, "heatmap")?;
    let Some((row_axis, col_axis)) = axes.display_dims else {
        return Err(H5LensError::invalid(
            "path",
            format!(
                "a heatmap needs at least two dimensions, {} has {}",
                info.path, info.ndim
            ),
        ));
    };
    let requested = max_size.unwrap_or(default_size);
    if requested == 0 {
        return Err(H5LensError::invalid("max_size", "must be at least 1"));
    }
    let ceiling = usize::try_from(limits.max_heatmap_size).unwrap_or(usize::MAX);
    let effective = requested.min(ceiling);
    let (rows, cols) = (info.shape[row_axis], info.shape[col_axis]);
    let stride_row = rows.div_ceil(effective).max(1);
    let stride_col = cols.div_ceil(effective).max(1);
    Ok(HeatmapPlan {
        axes,
        downsample: HeatmapDownsample {
            requested_max_size: requested,
            effective_max_size: effective,
            max_size_clamped: effective < requested,
            source_rows: rows,
            source_cols: cols,
            stride_row,
            stride_col,
            output_rows: rows.div_ceil(stride_row),
            output_cols: cols.div_ceil(stride_col),
        },
    })
}

/// Plan a heatmap request against a dataset's shape and type.
pub fn plan_request(
    info: &DatasetInfo,
    request: &HeatmapRequest,
    limits: &Limits,
) -> Result<HeatmapPlan, H5LensError> {
    check_real(info, "heatmap")?;
    let axes = normalize(&info.shape, request.display_dims, &request.fixed_indices)?;
    plan(
        info,
        axes,
        request.max_size,
        limits.default_heatmap_size,
        limits,
    )
}

/// Read the planned plane. Rows of the result always follow the first display axis.
pub fn extract(handle: &dyn DatasetHandle, plan: &HeatmapPlan) -> Result<Block, H5LensError> {
    let downsample = &plan.downsample;
    let selection = plan.axes.selection(
        handle.ndim(),
        AxisSlice::window(0, downsample.output_rows, downsample.stride_row),
        AxisSlice::window(0, downsample.output_cols, downsample.stride_col),
    );
    let block = handle.read(&selection)?;
    crate::metrics::record_extracted("heatmap", block.len() as u64);
    if plan.axes.is_transposed() {
        Ok(block.reversed_axes())
    } else {
        Ok(block)
    }
}

/// JSON payload of a heatmap.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeatmapPayload {
    pub mode: &'static str,
    pub path: String,
    pub dtype: String,
    pub source_shape: Vec<usize>,
    pub shape: Vec<usize>,
    pub display_dims: Option<(usize, usize)>,
    pub fixed_indices: BTreeMap<usize, usize>,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
    pub downsample_info: HeatmapDownsample,
}

impl HeatmapPayload {
    pub fn new(info: &DatasetInfo, plan: &HeatmapPlan, block: &Block, stats: Option<Stats>) -> Self {
        HeatmapPayload {
            mode: "heatmap",
            path: info.path.clone(),
            dtype: info.dtype.clone(),
            source_shape: info.shape.clone(),
            shape: block.shape().to_vec(),
            display_dims: plan.axes.display_dims,
            fixed_indices: plan.axes.fixed_indices.clone(),
            data: block.sanitize(),
            stats,
            downsample_info: plan.downsample.clone(),
        }
    }
}

/// Plan, read and render a heatmap request.
pub fn get_heatmap(
    handle: &dyn DatasetHandle,
    request: &HeatmapRequest,
    limits: &Limits,
) -> Result<HeatmapPayload, H5LensError> {
    let info = handle.info();
    let plan = plan_request(&info, request, limits)?;
    let block = extract(handle, &plan)?;
    let stats = if request.include_stats {
        Stats::of_block(&block, limits.stats_sample)
    } else {
        None
    };
    Ok(HeatmapPayload::new(&info, &plan, &block, stats))
}
