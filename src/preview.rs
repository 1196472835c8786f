//! Dataset previews.
//!
//! A preview combines the extractors to give a quick, bounded look at a dataset. Its thresholds
//! are lower than the hard ceilings and depend on the requested [Detail]. Every preview reports
//! the caps it applied in a `limits` section, so a caller can detect truncation.

use crate::array::{AxisSlice, Block, Selection};
use crate::axes::{normalize, resolve_line, AxisSelection};
use crate::dataset::DatasetHandle;
use crate::error::H5LensError;
use crate::heatmap::{self, HeatmapDownsample};
use crate::limits::Limits;
use crate::line::{self, LineAxis, LineDownsample, LineParams};
use crate::matrix::{self, MatrixDownsample, WindowParams};
use crate::models::{DataKind, DatasetInfo, Detail, PreviewMode, Quality};
use crate::request::PreviewRequest;
use crate::sanitize::Sanitize;
use crate::stats::{sample_stride, Stats};

use serde::Serialize;
use std::collections::BTreeMap;
use strum_macros::Display;

/// Length up to which an automatic 1D preview is a table rather than a line.
pub const PREVIEW_LINE_THRESHOLD: usize = 1_000;
pub const TABLE_1D_MAX: usize = 1_000;
pub const TABLE_2D_MAX: usize = 100;
pub const FAST_TABLE_1D_MAX: usize = 100;
pub const FAST_TABLE_2D_MAX: usize = 20;
pub const LINE_POINTS: usize = 2_000;
pub const FAST_LINE_POINTS: usize = 500;
pub const HEATMAP_SIZE: usize = 256;
pub const FAST_HEATMAP_SIZE: usize = 128;

/// Caps applied to a preview.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PreviewLimits {
    pub line_threshold: usize,
    pub table_1d_max: usize,
    pub table_2d_max: usize,
    pub line_points: usize,
    pub heatmap_size: usize,
    /// Elements sampled for statistics, zero when statistics are skipped
    pub stats_sample: usize,
}

impl PreviewLimits {
    pub fn new(detail: Detail, limits: &Limits) -> Self {
        match detail {
            Detail::Fast => PreviewLimits {
                line_threshold: PREVIEW_LINE_THRESHOLD,
                table_1d_max: FAST_TABLE_1D_MAX,
                table_2d_max: FAST_TABLE_2D_MAX,
                line_points: FAST_LINE_POINTS,
                heatmap_size: FAST_HEATMAP_SIZE,
                stats_sample: 0,
            },
            Detail::Full => PreviewLimits {
                line_threshold: PREVIEW_LINE_THRESHOLD,
                table_1d_max: TABLE_1D_MAX,
                table_2d_max: TABLE_2D_MAX,
                line_points: LINE_POINTS,
                heatmap_size: HEATMAP_SIZE,
                stats_sample: limits.stats_sample,
            },
        }
    }
}

/// Caps applied to a preview, and which of them cut the result short.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PreviewLimitsReport {
    #[serde(flatten)]
    pub caps: PreviewLimits,
    pub table_truncated: bool,
    pub plot_downsampled: bool,
    pub stats_sampled: bool,
}

/// The kind of view a preview resolved to
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PreviewKind {
    Scalar,
    Table,
    Line,
    Heatmap,
}

/// Reduction of the head of a one dimensional table.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HeadDownsample {
    pub source_length: usize,
    pub returned: usize,
    pub truncated: bool,
}

/// Reduction applied to the primary data of a preview.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PreviewDownsample {
    Head(HeadDownsample),
    Matrix(MatrixDownsample),
    Line(LineDownsample),
    Heatmap(HeatmapDownsample),
}

/// A heatmap plane shown alongside a table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlotPreview {
    pub shape: Vec<usize>,
    pub data: serde_json::Value,
    pub downsample_info: HeatmapDownsample,
}

/// JSON payload of a preview.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PreviewPayload {
    pub mode: PreviewKind,
    pub requested_mode: PreviewMode,
    pub detail: Detail,
    pub path: String,
    pub dtype: String,
    pub kind: DataKind,
    pub source_shape: Vec<usize>,
    pub ndim: usize,
    pub shape: Vec<usize>,
    pub data: serde_json::Value,
    pub downsample_info: Option<PreviewDownsample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_dims: Option<(usize, usize)>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fixed_indices: BTreeMap<usize, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis_meta: Option<LineAxis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plot: Option<PlotPreview>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
    pub limits: PreviewLimitsReport,
}

/// Choose the view for a preview request.
pub fn resolve_kind(info: &DatasetInfo, mode: PreviewMode, caps: &PreviewLimits) -> PreviewKind {
    match (mode, info.ndim) {
        (_, 0) => PreviewKind::Scalar,
        (PreviewMode::Auto, 1)
            if info.shape[0] > caps.line_threshold && info.kind == DataKind::Numeric =>
        {
            PreviewKind::Line
        }
        (PreviewMode::Auto, _) | (PreviewMode::Table, _) => PreviewKind::Table,
        (PreviewMode::Line, _) => PreviewKind::Line,
        (PreviewMode::Heatmap, _) => PreviewKind::Heatmap,
    }
}

/// The primary data of a preview.
struct Primary {
    block: Block,
    downsample: Option<PreviewDownsample>,
    truncated: bool,
    axes: Option<AxisSelection>,
    axis_meta: Option<LineAxis>,
}

fn scalar(handle: &dyn DatasetHandle) -> Result<Primary, H5LensError> {
    let block = handle.read(&Selection(vec![]))?;
    Ok(Primary {
        block,
        downsample: None,
        truncated: false,
        axes: None,
        axis_meta: None,
    })
}

fn table(
    handle: &dyn DatasetHandle,
    info: &DatasetInfo,
    axes: &AxisSelection,
    caps: &PreviewLimits,
    limits: &Limits,
) -> Result<Primary, H5LensError> {
    matrix::check_tabular(info, "preview")?;
    if info.ndim == 1 {
        let length = info.shape[0];
        let returned = length.min(caps.table_1d_max);
        let block = handle.read(&Selection(vec![AxisSlice::window(0, returned, 1)]))?;
        return Ok(Primary {
            block,
            downsample: Some(PreviewDownsample::Head(HeadDownsample {
                source_length: length,
                returned,
                truncated: returned < length,
            })),
            truncated: returned < length,
            axes: None,
            axis_meta: None,
        });
    }
    let side = caps.table_2d_max;
    let plan = matrix::plan(info, axes.clone(), &WindowParams::head(side, side), limits)?;
    let block = matrix::extract(handle, &plan)?;
    let truncated = plan.axes.display_dims.is_some_and(|(rows, cols)| {
        info.shape[rows] > plan.rows.count || info.shape[cols] > plan.cols.count
    });
    Ok(Primary {
        block,
        downsample: Some(PreviewDownsample::Matrix(plan.downsample)),
        truncated,
        axes: Some(plan.axes),
        axis_meta: None,
    })
}

fn line_profile(
    handle: &dyn DatasetHandle,
    info: &DatasetInfo,
    request: &PreviewRequest,
    caps: &PreviewLimits,
    limits: &Limits,
) -> Result<Primary, H5LensError> {
    line::check_plottable(info, "preview")?;
    let selection = resolve_line(
        &info.shape,
        request.display_dims,
        &request.fixed_indices,
        None,
        None,
    )?;
    let params = LineParams {
        line_offset: 0,
        line_limit: None,
        quality: Quality::Auto,
        max_points: Some(caps.line_points),
    };
    let plan = line::plan(info, selection, &params, limits)?;
    let block = line::extract(handle, &plan)?;
    Ok(Primary {
        block,
        truncated: false,
        axes: None,
        axis_meta: Some(plan.axis_meta()),
        downsample: Some(PreviewDownsample::Line(plan.downsample)),
    })
}

fn plot(
    handle: &dyn DatasetHandle,
    info: &DatasetInfo,
    axes: &AxisSelection,
    request: &PreviewRequest,
    caps: &PreviewLimits,
    limits: &Limits,
) -> Result<(Block, heatmap::HeatmapPlan), H5LensError> {
    let max_size = match request.detail {
        Detail::Fast => request.max_size.map(|size| size.min(caps.heatmap_size)),
        Detail::Full => request.max_size,
    };
    let plan = heatmap::plan(info, axes.clone(), max_size, caps.heatmap_size, limits)?;
    let block = heatmap::extract(handle, &plan)?;
    Ok((block, plan))
}

/// Statistics over the displayed region, sampled to at most `sample` elements.
fn region_stats(
    handle: &dyn DatasetHandle,
    info: &DatasetInfo,
    axes: &AxisSelection,
    sample: usize,
) -> Result<Stats, H5LensError> {
    let (selection, stride) = match axes.display_dims {
        Some((rows, cols)) => {
            let (rows, cols) = (info.shape[rows], info.shape[cols]);
            let stride = sample_stride(&[rows, cols], sample);
            let selection = axes.selection(
                info.ndim,
                AxisSlice::window(0, rows.div_ceil(stride), stride),
                AxisSlice::window(0, cols.div_ceil(stride), stride),
            );
            (selection, stride)
        }
        None => {
            let length = info.shape[0];
            let stride = sample_stride(&[length], sample);
            (
                Selection(vec![AxisSlice::window(0, length.div_ceil(stride), stride)]),
                stride,
            )
        }
    };
    let block = handle.read(&selection)?;
    crate::metrics::record_extracted("stats", block.len() as u64);
    let values = block.to_f64().ok_or_else(|| H5LensError::UnsupportedDtype {
        operation: "stats",
        dtype: info.dtype.clone(),
    })?;
    Ok(Stats::reduce(values.view(), stride, stride > 1))
}

/// Build a preview of a dataset.
pub fn get_preview(
    handle: &dyn DatasetHandle,
    request: &PreviewRequest,
    limits: &Limits,
) -> Result<PreviewPayload, H5LensError> {
    let info = handle.info();
    if matches!(info.kind, DataKind::Compound | DataKind::Unsupported) {
        return Err(H5LensError::UnsupportedDtype {
            operation: "preview",
            dtype: info.dtype.clone(),
        });
    }
    let caps = PreviewLimits::new(request.detail, limits);
    let kind = resolve_kind(&info, request.mode, &caps);
    let axes = normalize(&info.shape, request.display_dims, &request.fixed_indices)?;
    let real = info.type_info.is_real();

    let mut plot_preview = None;
    let primary = match kind {
        PreviewKind::Scalar => scalar(handle)?,
        PreviewKind::Table => {
            let primary = table(handle, &info, &axes, &caps, limits)?;
            if request.mode == PreviewMode::Auto && info.ndim >= 2 && real {
                let (block, plan) = plot(handle, &info, &axes, request, &caps, limits)?;
                plot_preview = Some(PlotPreview {
                    shape: block.shape().to_vec(),
                    data: block.sanitize(),
                    downsample_info: plan.downsample,
                });
            }
            primary
        }
        PreviewKind::Line => line_profile(handle, &info, request, &caps, limits)?,
        PreviewKind::Heatmap => {
            let (block, plan) = plot(handle, &info, &axes, request, &caps, limits)?;
            Primary {
                block,
                truncated: false,
                axes: Some(plan.axes),
                axis_meta: None,
                downsample: Some(PreviewDownsample::Heatmap(plan.downsample)),
            }
        }
    };

    let stats = if caps.stats_sample > 0 && request.include_stats && real && info.ndim > 0 {
        Some(region_stats(handle, &info, &axes, caps.stats_sample)?)
    } else {
        None
    };

    let plot_downsampled = match (&primary.downsample, &plot_preview) {
        (Some(PreviewDownsample::Heatmap(downsample)), _) => {
            downsample.stride_row > 1 || downsample.stride_col > 1
        }
        (Some(PreviewDownsample::Line(downsample)), _) => downsample.stride > 1,
        (_, Some(plot)) => plot.downsample_info.stride_row > 1 || plot.downsample_info.stride_col > 1,
        _ => false,
    };
    let stats_sampled = stats.as_ref().is_some_and(|stats| stats.sampled);
    let resolved_axes = primary.axes.as_ref().unwrap_or(&axes);

    Ok(PreviewPayload {
        mode: kind,
        requested_mode: request.mode,
        detail: request.detail,
        path: info.path.clone(),
        dtype: info.dtype.clone(),
        kind: info.kind,
        source_shape: info.shape.clone(),
        ndim: info.ndim,
        shape: primary.block.shape().to_vec(),
        data: primary.block.sanitize(),
        downsample_info: primary.downsample,
        display_dims: resolved_axes.display_dims,
        fixed_indices: resolved_axes.fixed_indices.clone(),
        axis_meta: primary.axis_meta,
        plot: plot_preview,
        stats,
        limits: PreviewLimitsReport {
            caps,
            table_truncated: primary.truncated,
            plot_downsampled,
            stats_sampled,
        },
    })
}
