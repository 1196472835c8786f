//! Summary statistics over a bounded sample.

use crate::array::Block;
use crate::limits::product;

use ndarray::{Array1, ArrayViewD, Slice};
use ndarray_stats::QuantileExt;
use serde::Serialize;

/// Minimum, maximum and mean of the finite values of a sample.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Stats {
    /// `None` when the sample holds no finite value
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    /// Number of finite values reduced
    pub count: usize,
    /// Number of elements examined
    pub sample_size: usize,
    /// Step applied along every axis to bound the sample
    pub stride: usize,
    /// Whether the sample is a subset of the source
    pub sampled: bool,
}

/// Smallest step which, applied along every axis, leaves at most `sample` elements.
pub fn sample_stride(shape: &[usize], sample: usize) -> usize {
    let sample = sample.max(1) as u64;
    let total = product(shape);
    if total <= sample || shape.is_empty() {
        return 1;
    }
    if let [len] = shape {
        return (*len as u64).div_ceil(sample) as usize;
    }
    let sampled = |stride: usize| {
        product(
            &shape
                .iter()
                .map(|len| len.div_ceil(stride))
                .collect::<Vec<_>>(),
        )
    };
    // The sampled count never grows with the stride and reaches one at the longest axis.
    let (mut low, mut high) = (1, shape.iter().copied().max().unwrap_or(1));
    while low < high {
        let mid = low + (high - low) / 2;
        if sampled(mid) <= sample {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    high
}

impl Stats {
    /// Reduce the finite values of `values`, striding every axis to examine at most `sample`
    /// elements.
    pub fn compute(values: ArrayViewD<f64>, sample: usize) -> Stats {
        let stride = sample_stride(values.shape(), sample);
        let sampled_view = values.slice_each_axis(|_| Slice::new(0, None, stride as isize));
        Self::reduce(sampled_view, stride, stride > 1)
    }

    /// Reduce every finite value of `values`, which has already been sampled with `stride`.
    pub fn reduce(values: ArrayViewD<f64>, stride: usize, sampled: bool) -> Stats {
        let finite: Array1<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        Stats {
            min: finite.min().ok().copied(),
            max: finite.max().ok().copied(),
            mean: finite.mean(),
            count: finite.len(),
            sample_size: values.len(),
            stride,
            sampled,
        }
    }

    /// Statistics of a real numeric block, or `None` for other element types.
    pub fn of_block(block: &Block, sample: usize) -> Option<Stats> {
        block
            .to_f64()
            .map(|values| Self::compute(values.view(), sample))
    }
}
