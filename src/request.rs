//! Request parameters.
//!
//! Query parameters arrive as strings. Each operation deserialises them into a raw struct of
//! optional strings, then [FromQuery::from_raw] parses every field in a single pass into a typed
//! request. Malformed values fail the request with [H5LensError::InvalidParameter] rather than
//! being coerced. The typed request is validated and then passed immutably through planning and
//! extraction.

use crate::error::H5LensError;
use crate::models::{Detail, ExportMode, LineDim, PreviewMode, Quality};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use validator::Validate;

/// Requested pins for non-display axes, keyed by axis.
///
/// Indices are signed so that negative values can be clamped rather than rejected.
pub type FixedIndices = BTreeMap<usize, i64>;

/// Conversion from raw query strings into a typed request.
pub trait FromQuery: Sized + Validate {
    /// Raw query representation
    type Raw: DeserializeOwned + Send;

    /// Parse every raw field.
    fn from_raw(raw: Self::Raw) -> Result<Self, H5LensError>;
}

/// Parameters that affect the output of an operation, used to build cache keys.
pub trait CacheParams {
    /// Returns `(name, value)` pairs rendered from parsed values. Absent parameters are omitted.
    fn cache_params(&self) -> Vec<(&'static str, String)>;
}

/// Returns the trimmed value, treating a blank value as absent.
fn trimmed(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

fn parse_number<T: FromStr>(field: &str, value: &Option<String>) -> Result<Option<T>, H5LensError> {
    trimmed(value)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|_| H5LensError::invalid(field, format!("`{}` is not a valid integer", value)))
        })
        .transpose()
}

/// Parse an optional non-negative integer.
pub fn parse_usize(field: &str, value: &Option<String>) -> Result<Option<usize>, H5LensError> {
    parse_number(field, value)
}

/// Parse an optional signed integer.
pub fn parse_i64(field: &str, value: &Option<String>) -> Result<Option<i64>, H5LensError> {
    parse_number(field, value)
}

/// Parse an optional boolean. Accepts `true`, `false`, `1` and `0`.
pub fn parse_bool(field: &str, value: &Option<String>) -> Result<Option<bool>, H5LensError> {
    trimmed(value)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(H5LensError::invalid(
                field,
                format!("`{}` is not a valid boolean", value),
            )),
        })
        .transpose()
}

/// Parse an optional enum value by its lowercase name.
pub fn parse_enum<T: FromStr>(field: &str, value: &Option<String>) -> Result<Option<T>, H5LensError> {
    trimmed(value)
        .map(|value| {
            T::from_str(&value.to_ascii_lowercase())
                .map_err(|_| H5LensError::invalid(field, format!("unknown value `{}`", value)))
        })
        .transpose()
}

/// Parse display dims of the form `a,b`, optionally bracketed.
pub fn parse_display_dims(value: &Option<String>) -> Result<Option<(usize, usize)>, H5LensError> {
    let Some(value) = trimmed(value) else {
        return Ok(None);
    };
    let inner = value.trim_start_matches('[').trim_end_matches(']');
    let axes = inner
        .split(',')
        .map(|axis| {
            axis.trim().parse::<usize>().map_err(|_| {
                H5LensError::invalid("display_dims", format!("`{}` is not a valid axis", axis.trim()))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    match axes[..] {
        [first, second] => Ok(Some((first, second))),
        _ => Err(H5LensError::invalid(
            "display_dims",
            format!("expected two axes, got {}", axes.len()),
        )),
    }
}

/// Parse fixed indices of the form `axis:index,...`. `axis=index` is also accepted.
pub fn parse_fixed_indices(value: &Option<String>) -> Result<FixedIndices, H5LensError> {
    let mut fixed = FixedIndices::new();
    let Some(value) = trimmed(value) else {
        return Ok(fixed);
    };
    for entry in value.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (axis, index) = entry.split_once([':', '=']).ok_or_else(|| {
            H5LensError::invalid("fixed_indices", format!("`{}` is not of the form axis:index", entry))
        })?;
        let axis = axis.trim().parse::<usize>().map_err(|_| {
            H5LensError::invalid("fixed_indices", format!("`{}` is not a valid axis", axis.trim()))
        })?;
        let index = index.trim().parse::<i64>().map_err(|_| {
            H5LensError::invalid("fixed_indices", format!("`{}` is not a valid index", index.trim()))
        })?;
        if fixed.insert(axis, index).is_some() {
            return Err(H5LensError::invalid(
                "fixed_indices",
                format!("axis {} is pinned more than once", axis),
            ));
        }
    }
    Ok(fixed)
}

/// Parse a line dimension: `row`, `col` or an axis number.
pub fn parse_line_dim(value: &Option<String>) -> Result<Option<LineDim>, H5LensError> {
    trimmed(value)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "row" => Ok(LineDim::Row),
            "col" | "column" => Ok(LineDim::Col),
            other => other.parse::<usize>().map(LineDim::Axis).map_err(|_| {
                H5LensError::invalid("line_dim", format!("`{}` is not row, col or an axis", value))
            }),
        })
        .transpose()
}

/// Parse a comma separated list of dataset paths.
pub fn parse_paths(value: &Option<String>) -> Vec<String> {
    trimmed(value)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|path| !path.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Render fixed indices canonically, sorted by axis.
pub fn render_fixed_indices(fixed: &FixedIndices) -> String {
    fixed
        .iter()
        .map(|(axis, index)| format!("{}:{}", axis, index))
        .collect::<Vec<_>>()
        .join(",")
}

fn push<T: ToString>(params: &mut Vec<(&'static str, String)>, name: &'static str, value: &Option<T>) {
    if let Some(value) = value {
        params.push((name, value.to_string()));
    }
}

/// Shared axis parameters rendered for cache keys.
fn axis_params(
    display_dims: &Option<(usize, usize)>,
    fixed_indices: &FixedIndices,
) -> Vec<(&'static str, String)> {
    let mut params = vec![];
    push(
        &mut params,
        "display_dims",
        &display_dims.map(|(a, b)| format!("{},{}", a, b)),
    );
    if !fixed_indices.is_empty() {
        params.push(("fixed_indices", render_fixed_indices(fixed_indices)));
    }
    params
}

fn required(field: &str, value: Option<String>) -> Result<String, H5LensError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| H5LensError::invalid(field, "a value is required"))
}

/// Raw query for operations addressing a single node.
#[derive(Debug, Default, Deserialize)]
pub struct RawNodeQuery {
    pub file: Option<String>,
    pub path: Option<String>,
}

/// Request addressing a group or dataset.
#[derive(Clone, Debug, PartialEq, Validate)]
pub struct NodeRequest {
    /// Object key of the container
    #[validate(length(min = 1))]
    pub file: String,
    /// Path inside the container
    #[validate(length(min = 1))]
    pub path: String,
}

impl FromQuery for NodeRequest {
    type Raw = RawNodeQuery;

    fn from_raw(raw: RawNodeQuery) -> Result<Self, H5LensError> {
        Ok(NodeRequest {
            file: required("file", raw.file)?,
            path: trimmed(&raw.path).unwrap_or("/").to_string(),
        })
    }
}

impl CacheParams for NodeRequest {
    fn cache_params(&self) -> Vec<(&'static str, String)> {
        vec![]
    }
}

/// Raw matrix window query.
#[derive(Debug, Default, Deserialize)]
pub struct RawMatrixQuery {
    pub file: Option<String>,
    pub path: Option<String>,
    pub display_dims: Option<String>,
    pub fixed_indices: Option<String>,
    pub row_offset: Option<String>,
    pub row_limit: Option<String>,
    pub col_offset: Option<String>,
    pub col_limit: Option<String>,
    pub row_step: Option<String>,
    pub col_step: Option<String>,
}

/// A matrix window request.
#[derive(Clone, Debug, PartialEq, Validate)]
pub struct MatrixRequest {
    #[validate(length(min = 1))]
    pub file: String,
    #[validate(length(min = 1))]
    pub path: String,
    pub display_dims: Option<(usize, usize)>,
    pub fixed_indices: FixedIndices,
    pub row_offset: usize,
    /// Rows requested, defaulting to the configured matrix window
    pub row_limit: Option<usize>,
    pub col_offset: usize,
    /// Columns requested, defaulting to the configured matrix window
    pub col_limit: Option<usize>,
    #[validate(range(min = 1))]
    pub row_step: usize,
    #[validate(range(min = 1))]
    pub col_step: usize,
}

impl FromQuery for MatrixRequest {
    type Raw = RawMatrixQuery;

    fn from_raw(raw: RawMatrixQuery) -> Result<Self, H5LensError> {
        Ok(MatrixRequest {
            file: required("file", raw.file)?,
            path: required("path", raw.path)?,
            display_dims: parse_display_dims(&raw.display_dims)?,
            fixed_indices: parse_fixed_indices(&raw.fixed_indices)?,
            row_offset: parse_usize("row_offset", &raw.row_offset)?.unwrap_or(0),
            row_limit: parse_usize("row_limit", &raw.row_limit)?,
            col_offset: parse_usize("col_offset", &raw.col_offset)?.unwrap_or(0),
            col_limit: parse_usize("col_limit", &raw.col_limit)?,
            row_step: parse_usize("row_step", &raw.row_step)?.unwrap_or(1),
            col_step: parse_usize("col_step", &raw.col_step)?.unwrap_or(1),
        })
    }
}

impl CacheParams for MatrixRequest {
    fn cache_params(&self) -> Vec<(&'static str, String)> {
        let mut params = axis_params(&self.display_dims, &self.fixed_indices);
        params.push(("row_offset", self.row_offset.to_string()));
        push(&mut params, "row_limit", &self.row_limit);
        params.push(("col_offset", self.col_offset.to_string()));
        push(&mut params, "col_limit", &self.col_limit);
        params.push(("row_step", self.row_step.to_string()));
        params.push(("col_step", self.col_step.to_string()));
        params
    }
}

/// Raw line profile query.
#[derive(Debug, Default, Deserialize)]
pub struct RawLineQuery {
    pub file: Option<String>,
    pub path: Option<String>,
    pub display_dims: Option<String>,
    pub fixed_indices: Option<String>,
    pub line_dim: Option<String>,
    pub line_index: Option<String>,
    pub line_offset: Option<String>,
    pub line_limit: Option<String>,
    pub quality: Option<String>,
    pub max_points: Option<String>,
    pub compare: Option<String>,
}

/// A line profile request.
#[derive(Clone, Debug, PartialEq, Validate)]
pub struct LineRequest {
    #[validate(length(min = 1))]
    pub file: String,
    #[validate(length(min = 1))]
    pub path: String,
    pub display_dims: Option<(usize, usize)>,
    pub fixed_indices: FixedIndices,
    /// Varying axis, `row` when absent
    pub line_dim: Option<LineDim>,
    /// Index of the pinned display axis, the midpoint when absent
    pub line_index: Option<i64>,
    pub line_offset: usize,
    /// Window length, to the end of the axis when absent
    pub line_limit: Option<usize>,
    pub quality: Quality,
    #[validate(range(min = 1))]
    pub max_points: Option<usize>,
    /// Extra datasets to overlay
    pub compare: Vec<String>,
}

impl FromQuery for LineRequest {
    type Raw = RawLineQuery;

    fn from_raw(raw: RawLineQuery) -> Result<Self, H5LensError> {
        Ok(LineRequest {
            file: required("file", raw.file)?,
            path: required("path", raw.path)?,
            display_dims: parse_display_dims(&raw.display_dims)?,
            fixed_indices: parse_fixed_indices(&raw.fixed_indices)?,
            line_dim: parse_line_dim(&raw.line_dim)?,
            line_index: parse_i64("line_index", &raw.line_index)?,
            line_offset: parse_usize("line_offset", &raw.line_offset)?.unwrap_or(0),
            line_limit: parse_usize("line_limit", &raw.line_limit)?,
            quality: parse_enum("quality", &raw.quality)?.unwrap_or(Quality::Auto),
            max_points: parse_usize("max_points", &raw.max_points)?,
            compare: parse_paths(&raw.compare),
        })
    }
}

impl CacheParams for LineRequest {
    fn cache_params(&self) -> Vec<(&'static str, String)> {
        let mut params = axis_params(&self.display_dims, &self.fixed_indices);
        push(&mut params, "line_dim", &self.line_dim);
        push(&mut params, "line_index", &self.line_index);
        params.push(("line_offset", self.line_offset.to_string()));
        push(&mut params, "line_limit", &self.line_limit);
        params.push(("quality", self.quality.to_string()));
        push(&mut params, "max_points", &self.max_points);
        if !self.compare.is_empty() {
            params.push(("compare", self.compare.join(",")));
        }
        params
    }
}

/// Raw heatmap query.
#[derive(Debug, Default, Deserialize)]
pub struct RawHeatmapQuery {
    pub file: Option<String>,
    pub path: Option<String>,
    pub display_dims: Option<String>,
    pub fixed_indices: Option<String>,
    pub max_size: Option<String>,
    pub include_stats: Option<String>,
}

/// A heatmap request.
#[derive(Clone, Debug, PartialEq, Validate)]
pub struct HeatmapRequest {
    #[validate(length(min = 1))]
    pub file: String,
    #[validate(length(min = 1))]
    pub path: String,
    pub display_dims: Option<(usize, usize)>,
    pub fixed_indices: FixedIndices,
    #[validate(range(min = 1))]
    pub max_size: Option<usize>,
    pub include_stats: bool,
}

impl FromQuery for HeatmapRequest {
    type Raw = RawHeatmapQuery;

    fn from_raw(raw: RawHeatmapQuery) -> Result<Self, H5LensError> {
        Ok(HeatmapRequest {
            file: required("file", raw.file)?,
            path: required("path", raw.path)?,
            display_dims: parse_display_dims(&raw.display_dims)?,
            fixed_indices: parse_fixed_indices(&raw.fixed_indices)?,
            max_size: parse_usize("max_size", &raw.max_size)?,
            include_stats: parse_bool("include_stats", &raw.include_stats)?.unwrap_or(true),
        })
    }
}

impl CacheParams for HeatmapRequest {
    fn cache_params(&self) -> Vec<(&'static str, String)> {
        let mut params = axis_params(&self.display_dims, &self.fixed_indices);
        push(&mut params, "max_size", &self.max_size);
        params.push(("include_stats", self.include_stats.to_string()));
        params
    }
}

/// Raw preview query.
#[derive(Debug, Default, Deserialize)]
pub struct RawPreviewQuery {
    pub file: Option<String>,
    pub path: Option<String>,
    pub mode: Option<String>,
    pub detail: Option<String>,
    pub display_dims: Option<String>,
    pub fixed_indices: Option<String>,
    pub include_stats: Option<String>,
    pub max_size: Option<String>,
}

/// A preview request.
#[derive(Clone, Debug, PartialEq, Validate)]
pub struct PreviewRequest {
    #[validate(length(min = 1))]
    pub file: String,
    #[validate(length(min = 1))]
    pub path: String,
    pub mode: PreviewMode,
    pub detail: Detail,
    pub display_dims: Option<(usize, usize)>,
    pub fixed_indices: FixedIndices,
    pub include_stats: bool,
    #[validate(range(min = 1))]
    pub max_size: Option<usize>,
}

impl FromQuery for PreviewRequest {
    type Raw = RawPreviewQuery;

    fn from_raw(raw: RawPreviewQuery) -> Result<Self, H5LensError> {
        Ok(PreviewRequest {
            file: required("file", raw.file)?,
            path: required("path", raw.path)?,
            mode: parse_enum("mode", &raw.mode)?.unwrap_or(PreviewMode::Auto),
            detail: parse_enum("detail", &raw.detail)?.unwrap_or(Detail::Full),
            display_dims: parse_display_dims(&raw.display_dims)?,
            fixed_indices: parse_fixed_indices(&raw.fixed_indices)?,
            include_stats: parse_bool("include_stats", &raw.include_stats)?.unwrap_or(true),
            max_size: parse_usize("max_size", &raw.max_size)?,
        })
    }
}

impl CacheParams for PreviewRequest {
    fn cache_params(&self) -> Vec<(&'static str, String)> {
        let mut params = axis_params(&self.display_dims, &self.fixed_indices);
        params.push(("mode", self.mode.to_string()));
        params.push(("detail", self.detail.to_string()));
        params.push(("include_stats", self.include_stats.to_string()));
        push(&mut params, "max_size", &self.max_size);
        params
    }
}

/// Raw CSV export query.
#[derive(Debug, Default, Deserialize)]
pub struct RawExportQuery {
    pub file: Option<String>,
    pub path: Option<String>,
    pub mode: Option<String>,
    pub display_dims: Option<String>,
    pub fixed_indices: Option<String>,
    pub row_offset: Option<String>,
    pub row_limit: Option<String>,
    pub col_offset: Option<String>,
    pub col_limit: Option<String>,
    pub line_dim: Option<String>,
    pub line_index: Option<String>,
    pub line_offset: Option<String>,
    pub line_limit: Option<String>,
    pub chunk_size: Option<String>,
}

/// A CSV export request.
///
/// Unlike the JSON views, absent limits extend the export to the end of each axis.
#[derive(Clone, Debug, PartialEq, Validate)]
pub struct ExportRequest {
    #[validate(length(min = 1))]
    pub file: String,
    #[validate(length(min = 1))]
    pub path: String,
    pub mode: ExportMode,
    pub display_dims: Option<(usize, usize)>,
    pub fixed_indices: FixedIndices,
    pub row_offset: usize,
    pub row_limit: Option<usize>,
    pub col_offset: usize,
    pub col_limit: Option<usize>,
    pub line_dim: Option<LineDim>,
    pub line_index: Option<i64>,
    pub line_offset: usize,
    pub line_limit: Option<usize>,
    /// Rows (matrix) or points (line) per chunk
    #[validate(range(min = 1))]
    pub chunk_size: Option<usize>,
}

impl FromQuery for ExportRequest {
    type Raw = RawExportQuery;

    fn from_raw(raw: RawExportQuery) -> Result<Self, H5LensError> {
        Ok(ExportRequest {
            file: required("file", raw.file)?,
            path: required("path", raw.path)?,
            mode: parse_enum("mode", &raw.mode)?.unwrap_or(ExportMode::Matrix),
            display_dims: parse_display_dims(&raw.display_dims)?,
            fixed_indices: parse_fixed_indices(&raw.fixed_indices)?,
            row_offset: parse_usize("row_offset", &raw.row_offset)?.unwrap_or(0),
            row_limit: parse_usize("row_limit", &raw.row_limit)?,
            col_offset: parse_usize("col_offset", &raw.col_offset)?.unwrap_or(0),
            col_limit: parse_usize("col_limit", &raw.col_limit)?,
            line_dim: parse_line_dim(&raw.line_dim)?,
            line_index: parse_i64("line_index", &raw.line_index)?,
            line_offset: parse_usize("line_offset", &raw.line_offset)?.unwrap_or(0),
            line_limit: parse_usize("line_limit", &raw.line_limit)?,
            chunk_size: parse_usize("chunk_size", &raw.chunk_size)?,
        })
    }
}
