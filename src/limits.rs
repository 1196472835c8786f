//! Hard ceilings on requested sizes.
//!
//! Every extractor computes its window from the parsed request and checks it here before any
//! data is read. A violation is reported with the ceiling name and both values; requests are
//! never silently truncated to fit.

use crate::error::H5LensError;

use serde::Serialize;
use strum_macros::Display;

/// Name of a configured ceiling.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    /// Total elements in a JSON response
    MaxJsonElements,
    /// Rows in a matrix window
    MaxMatrixRows,
    /// Columns in a matrix window
    MaxMatrixCols,
    /// Points returned by a line profile
    MaxLinePoints,
    /// Window length of an undownsampled line profile
    MaxLineExactPoints,
    /// Side of a heatmap plane
    MaxHeatmapSize,
    /// Cells in a matrix export
    MaxExportCells,
    /// Points in a line export
    MaxExportLinePoints,
    /// Elements produced by one export chunk
    MaxExportChunkElements,
    /// Extra series overlaid on a line profile
    MaxLineCompare,
    /// Size of an object fetched from storage
    MaxObjectBytes,
}

pub const MAX_JSON_ELEMENTS: u64 = 500_000;
pub const MAX_MATRIX_ROWS: u64 = 2_000;
pub const MAX_MATRIX_COLS: u64 = 2_000;
pub const MAX_LINE_POINTS: u64 = 50_000;
pub const MAX_LINE_EXACT_POINTS: u64 = 20_000;
pub const MAX_HEATMAP_SIZE: u64 = 1_024;
pub const MAX_EXPORT_CELLS: u64 = 10_000_000;
pub const MAX_EXPORT_LINE_POINTS: u64 = 5_000_000;
pub const MAX_EXPORT_CHUNK_ELEMENTS: u64 = 100_000;
pub const MAX_LINE_COMPARE: u64 = 4;
pub const MAX_OBJECT_BYTES: u64 = 4 * 1024 * 1024 * 1024;

pub const DEFAULT_MATRIX_LIMIT: usize = 100;
pub const DEFAULT_LINE_OVERVIEW_POINTS: usize = 5_000;
pub const DEFAULT_HEATMAP_SIZE: usize = 512;
pub const DEFAULT_STATS_SAMPLE: usize = 100_000;
pub const DEFAULT_EXPORT_CHUNK: usize = 1_000;

/// Table of ceilings and defaults used by the extraction engine.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Limits {
    pub max_json_elements: u64,
    pub max_matrix_rows: u64,
    pub max_matrix_cols: u64,
    pub max_line_points: u64,
    pub max_line_exact_points: u64,
    pub max_heatmap_size: u64,
    pub max_export_cells: u64,
    pub max_export_line_points: u64,
    pub max_export_chunk_elements: u64,
    pub max_line_compare: u64,
    pub max_object_bytes: u64,

    /// Matrix rows and columns returned when no limit is requested
    pub default_matrix_limit: usize,
    /// Points returned by an overview line when `max_points` is absent
    pub default_line_points: usize,
    /// Heatmap side used when `max_size` is absent
    pub default_heatmap_size: usize,
    /// Elements sampled for summary statistics
    pub stats_sample: usize,
    /// Rows or points per export chunk when no chunk size is requested
    pub default_export_chunk: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_json_elements: MAX_JSON_ELEMENTS,
            max_matrix_rows: MAX_MATRIX_ROWS,
            max_matrix_cols: MAX_MATRIX_COLS,
            max_line_points: MAX_LINE_POINTS,
            max_line_exact_points: MAX_LINE_EXACT_POINTS,
            max_heatmap_size: MAX_HEATMAP_SIZE,
            max_export_cells: MAX_EXPORT_CELLS,
            max_export_line_points: MAX_EXPORT_LINE_POINTS,
            max_export_chunk_elements: MAX_EXPORT_CHUNK_ELEMENTS,
            max_line_compare: MAX_LINE_COMPARE,
            max_object_bytes: MAX_OBJECT_BYTES,
            default_matrix_limit: DEFAULT_MATRIX_LIMIT,
            default_line_points: DEFAULT_LINE_OVERVIEW_POINTS,
            default_heatmap_size: DEFAULT_HEATMAP_SIZE,
            stats_sample: DEFAULT_STATS_SAMPLE,
            default_export_chunk: DEFAULT_EXPORT_CHUNK,
        }
    }
}

impl Limits {
    /// Returns the configured value of a ceiling.
    pub fn ceiling(&self, limit: Limit) -> u64 {
        match limit {
            Limit::MaxJsonElements => self.max_json_elements,
            Limit::MaxMatrixRows => self.max_matrix_rows,
            Limit::MaxMatrixCols => self.max_matrix_cols,
            Limit::MaxLinePoints => self.max_line_points,
            Limit::MaxLineExactPoints => self.max_line_exact_points,
            Limit::MaxHeatmapSize => self.max_heatmap_size,
            Limit::MaxExportCells => self.max_export_cells,
            Limit::MaxExportLinePoints => self.max_export_line_points,
            Limit::MaxExportChunkElements => self.max_export_chunk_elements,
            Limit::MaxLineCompare => self.max_line_compare,
            Limit::MaxObjectBytes => self.max_object_bytes,
        }
    }

    /// Fails with [H5LensError::LimitExceeded] if `requested` is above the ceiling.
    pub fn check(&self, limit: Limit, requested: u64) -> Result<(), H5LensError> {
        let allowed = self.ceiling(limit);
        if requested > allowed {
            return Err(H5LensError::LimitExceeded {
                limit,
                requested,
                allowed,
            });
        }
        Ok(())
    }

    /// Checks several ceilings, failing on the first violation.
    pub fn check_all(&self, checks: &[(Limit, u64)]) -> Result<(), H5LensError> {
        checks
            .iter()
            .try_for_each(|(limit, requested)| self.check(*limit, *requested))
    }
}

/// Multiplies sizes without overflowing, saturating at `u64::MAX`.
pub fn product(sizes: &[usize]) -> u64 {
    sizes
        .iter()
        .fold(1_u64, |acc, size| acc.saturating_mul(*size as u64))
}
