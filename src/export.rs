//! Chunked CSV export.
//!
//! An export is planned up front against the export ceilings, then produced lazily one chunk of
//! rows (matrix) or points (line) at a time. Only one chunk is ever held in memory. The iterator
//! is finite and cannot be restarted; it ends after the first error.

use crate::array::{AxisSlice, Block};
use crate::axes::{normalize, resolve_line, AxisSelection, LineSelection};
use crate::dataset::DatasetHandle;
use crate::error::H5LensError;
use crate::limits::{Limit, Limits};
use crate::matrix::{self, BoundedWindow};
use crate::models::{DatasetInfo, ExportMode};
use crate::request::ExportRequest;
use crate::sanitize::Sanitize;

use bytes::Bytes;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt::Write;

/// What an export reads.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExportShape {
    /// A window of the two display axes, one CSV row per row of the window
    Matrix {
        axes: AxisSelection,
        rows: BoundedWindow,
        cols: BoundedWindow,
    },
    /// A window of a single axis, one CSV row per point
    Line {
        line: LineSelection,
        offset: usize,
        count: usize,
    },
}

/// An export, validated against the export ceilings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExportPlan {
    pub shape: ExportShape,
    /// Rows or points per chunk
    pub chunk: usize,
}

impl ExportPlan {
    /// Number of CSV data rows.
    pub fn total(&self) -> usize {
        match &self.shape {
            ExportShape::Matrix { rows, .. } => rows.count,
            ExportShape::Line { count, .. } => *count,
        }
    }

    fn width(&self) -> usize {
        match &self.shape {
            ExportShape::Matrix { cols, .. } => cols.count,
            ExportShape::Line { .. } => 1,
        }
    }

    fn header(&self) -> String {
        match &self.shape {
            ExportShape::Matrix { cols, .. } => {
                let mut header = String::from("row");
                for col in 0..cols.count {
                    let _ = write!(header, ",{}", cols.offset + col * cols.step);
                }
                header.push('\n');
                header
            }
            ExportShape::Line { .. } => "index,value\n".to_string(),
        }
    }
}

/// Resolve the rows or points per chunk.
///
/// A requested chunk size must stay within the chunk ceiling. The default shrinks until it does.
fn chunk_size(
    requested: Option<usize>,
    width: usize,
    limits: &Limits,
) -> Result<usize, H5LensError> {
    let width = width.max(1) as u64;
    let chunk = match requested {
        Some(0) => return Err(H5LensError::invalid("chunk_size", "must be at least 1")),
        Some(chunk) => chunk,
        None => {
            let fitting = (limits.max_export_chunk_elements / width).max(1);
            limits
                .default_export_chunk
                .min(usize::try_from(fitting).unwrap_or(usize::MAX))
        }
    };
    limits.check(
        Limit::MaxExportChunkElements,
        (chunk as u64).saturating_mul(width),
    )?;
    Ok(chunk)
}

/// Plan an export request against a dataset's shape and type.
pub fn plan(
    info: &DatasetInfo,
    request: &ExportRequest,
    limits: &Limits,
) -> Result<ExportPlan, H5LensError> {
    matrix::check_tabular(info, "export")?;
    let shape = match request.mode {
        ExportMode::Matrix => {
            let axes = normalize(&info.shape, request.display_dims, &request.fixed_indices)?;
            let Some((row_axis, col_axis)) = axes.display_dims else {
                return Err(H5LensError::invalid(
                    "mode",
                    format!(
                        "a matrix export needs at least two dimensions, {} has {}, use mode=line",
                        info.path, info.ndim
                    ),
                ));
            };
            let window = |axis: usize, offset: usize, limit: Option<usize>| {
                let extent = info.shape[axis];
                BoundedWindow::new(
                    axis,
                    extent,
                    offset,
                    limit.unwrap_or(extent.saturating_sub(offset)),
                    1,
                )
            };
            let rows = window(row_axis, request.row_offset, request.row_limit)?;
            let cols = window(col_axis, request.col_offset, request.col_limit)?;
            limits.check(
                Limit::MaxExportCells,
                (rows.count as u64).saturating_mul(cols.count as u64),
            )?;
            ExportShape::Matrix { axes, rows, cols }
        }
        ExportMode::Line => {
            let line = resolve_line(
                &info.shape,
                request.display_dims,
                &request.fixed_indices,
                request.line_dim,
                request.line_index,
            )?;
            let extent = info.shape[line.axis];
            if request.line_offset > extent {
                return Err(H5LensError::OutOfRange {
                    axis: line.axis,
                    offset: request.line_offset,
                    extent,
                });
            }
            let available = extent - request.line_offset;
            let count = request
                .line_limit
                .map_or(available, |limit| limit.min(available));
            limits.check(Limit::MaxExportLinePoints, count as u64)?;
            ExportShape::Line {
                line,
                offset: request.line_offset,
                count,
            }
        }
    };
    let width = match &shape {
        ExportShape::Matrix { cols, .. } => cols.count,
        ExportShape::Line { .. } => 1,
    };
    let chunk = chunk_size(request.chunk_size, width, limits)?;
    Ok(ExportPlan { shape, chunk })
}

/// Render one CSV cell from a sanitized value.
pub fn csv_cell(value: &Value) -> Cow<'_, str> {
    match value {
        Value::Null => Cow::Borrowed(""),
        Value::String(text) if text.contains([',', '"', '\n', '\r']) => {
            Cow::Owned(format!("\"{}\"", text.replace('"', "\"\"")))
        }
        Value::String(text) => Cow::Borrowed(text),
        other => Cow::Owned(other.to_string()),
    }
}

/// Lazy CSV chunks of an export. The first item is the header row.
pub struct CsvExport {
    handle: Box<dyn DatasetHandle>,
    plan: ExportPlan,
    header_sent: bool,
    position: usize,
}

impl CsvExport {
    pub fn new(handle: Box<dyn DatasetHandle>, plan: ExportPlan) -> Self {
        CsvExport {
            handle,
            plan,
            header_sent: false,
            position: 0,
        }
    }

    /// Plan an export request and prepare its chunks.
    pub fn from_request(
        handle: Box<dyn DatasetHandle>,
        request: &ExportRequest,
        limits: &Limits,
    ) -> Result<Self, H5LensError> {
        let plan = plan(&handle.info(), request, limits)?;
        Ok(Self::new(handle, plan))
    }

    pub fn plan(&self) -> &ExportPlan {
        &self.plan
    }

    fn read(&self, start: usize, count: usize) -> Result<Block, H5LensError> {
        let ndim = self.handle.ndim();
        let block = match &self.plan.shape {
            ExportShape::Matrix { axes, rows, cols } => {
                let selection = axes.selection(
                    ndim,
                    AxisSlice::window(rows.offset + start * rows.step, count, rows.step),
                    cols.slice(),
                );
                let block = self.handle.read(&selection)?;
                if axes.is_transposed() {
                    block.reversed_axes()
                } else {
                    block
                }
            }
            ExportShape::Line { line, offset, .. } => self
                .handle
                .read(&line.selection(ndim, AxisSlice::window(offset + start, count, 1)))?,
        };
        crate::metrics::record_extracted("export", block.len() as u64);
        Ok(block)
    }

    fn render(&self, start: usize, count: usize) -> Result<Bytes, H5LensError> {
        let values = self.read(start, count)?.sanitize();
        let rows = match values {
            Value::Array(rows) => rows,
            other => vec![other],
        };
        let mut out = String::with_capacity(count * (self.plan.width() * 8 + 8));
        for (i, row) in rows.iter().enumerate() {
            let label = match &self.plan.shape {
                ExportShape::Matrix { rows, .. } => rows.offset + (start + i) * rows.step,
                ExportShape::Line { offset, .. } => offset + start + i,
            };
            let _ = write!(out, "{label}");
            match row {
                Value::Array(cells) => {
                    for cell in cells {
                        out.push(',');
                        out.push_str(&csv_cell(cell));
                    }
                }
                cell => {
                    out.push(',');
                    out.push_str(&csv_cell(cell));
                }
            }
            out.push('\n');
        }
        Ok(Bytes::from(out))
    }
}

impl Iterator for CsvExport {
    type Item = Result<Bytes, H5LensError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.header_sent {
            self.header_sent = true;
            return Some(Ok(Bytes::from(self.plan.header())));
        }
        let total = self.plan.total();
        if self.position >= total {
            return None;
        }
        let count = self.plan.chunk.min(total - self.position);
        let chunk = self.render(self.position, count);
        self.position = if chunk.is_ok() {
            self.position + count
        } else {
            total
        };
        Some(chunk)
    }
}
