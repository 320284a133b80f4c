//! 1-d pooling layers
//!
//! Pooling layers have no learnable parameters; the step engine
//! redistributes relevance through them in proportion to each input's
//! contribution to the pooled output (winner-take-all for max pooling,
//! uniform share for mean pooling).

use crate::error::{ExplicarError, Result};
use ndarray::{Array1, Array2, ArrayView2};

/// Max pooling over non-overlapping-or-strided windows per channel.
#[derive(Debug, Clone)]
pub struct MaxPool1d {
    pub kernel: usize,
    pub stride: usize,
}

impl MaxPool1d {
    pub fn new(kernel: usize, stride: usize) -> Self {
        assert!(kernel > 0 && stride > 0, "kernel and stride must be positive");
        MaxPool1d { kernel, stride }
    }

    pub(crate) fn out_len(&self, in_len: usize) -> Result<usize> {
        if in_len < self.kernel {
            return Err(ExplicarError::shape(
                "max-pool input length",
                &[self.kernel],
                &[in_len],
            ));
        }
        Ok((in_len - self.kernel) / self.stride + 1)
    }

    pub(crate) fn forward(&self, x: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let (channels, len) = x.dim();
        let out_len = self.out_len(len)?;
        let mut y = Array2::<f32>::zeros((channels, out_len));
        for c in 0..channels {
            for t in 0..out_len {
                let mut best = f32::NEG_INFINITY;
                for k in 0..self.kernel {
                    best = best.max(x[[c, t * self.stride + k]]);
                }
                y[[c, t]] = best;
            }
        }
        Ok(y)
    }

    /// Index of the first maximum in each window, per channel.
    pub(crate) fn argmax(&self, x: &ArrayView2<f32>) -> Result<Array2<usize>> {
        let (channels, len) = x.dim();
        let out_len = self.out_len(len)?;
        let mut idx = Array2::<usize>::zeros((channels, out_len));
        for c in 0..channels {
            for t in 0..out_len {
                let mut best = f32::NEG_INFINITY;
                let mut best_pos = t * self.stride;
                for k in 0..self.kernel {
                    let pos = t * self.stride + k;
                    if x[[c, pos]] > best {
                        best = x[[c, pos]];
                        best_pos = pos;
                    }
                }
                idx[[c, t]] = best_pos;
            }
        }
        Ok(idx)
    }
}

/// Mean pooling over strided windows per channel.
#[derive(Debug, Clone)]
pub struct AvgPool1d {
    pub kernel: usize,
    pub stride: usize,
}

impl AvgPool1d {
    pub fn new(kernel: usize, stride: usize) -> Self {
        assert!(kernel > 0 && stride > 0, "kernel and stride must be positive");
        AvgPool1d { kernel, stride }
    }

    pub(crate) fn out_len(&self, in_len: usize) -> Result<usize> {
        if in_len < self.kernel {
            return Err(ExplicarError::shape(
                "avg-pool input length",
                &[self.kernel],
                &[in_len],
            ));
        }
        Ok((in_len - self.kernel) / self.stride + 1)
    }

    pub(crate) fn forward(&self, x: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let (channels, len) = x.dim();
        let out_len = self.out_len(len)?;
        let share = 1.0 / self.kernel as f32;
        let mut y = Array2::<f32>::zeros((channels, out_len));
        for c in 0..channels {
            for t in 0..out_len {
                let mut sum = 0.0;
                for k in 0..self.kernel {
                    sum += x[[c, t * self.stride + k]];
                }
                y[[c, t]] = sum * share;
            }
        }
        Ok(y)
    }
}

/// Mean over the whole length axis, reducing `(channels, length)` to
/// `(channels,)`.
#[derive(Debug, Clone)]
pub struct GlobalAvgPool1d;

impl GlobalAvgPool1d {
    pub(crate) fn forward(&self, x: &ArrayView2<f32>) -> Result<Array1<f32>> {
        let (_, len) = x.dim();
        if len == 0 {
            return Err(ExplicarError::shape("global-avg-pool input", &[1], &[0]));
        }
        Ok(x.mean_axis(ndarray::Axis(1))
            .expect("length checked non-zero"))
    }
}
