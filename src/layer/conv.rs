//! 1-d convolution layer

use crate::error::{ExplicarError, Result};
use ndarray::{Array1, Array2, Array3, ArrayView2};

/// 1-d convolution over `(in_channels, length)` inputs with weight shape
/// `(out_channels, in_channels, kernel)`, zero padding on both ends.
#[derive(Debug, Clone)]
pub struct Conv1d {
    pub weight: Array3<f32>,
    pub bias: Option<Array1<f32>>,
    pub stride: usize,
    pub padding: usize,
}

impl Conv1d {
    /// Create a convolution layer from pretrained parameters.
    pub fn new(
        weight: Array3<f32>,
        bias: Option<Array1<f32>>,
        stride: usize,
        padding: usize,
    ) -> Self {
        assert!(stride > 0, "stride must be positive");
        if let Some(b) = &bias {
            assert_eq!(
                b.len(),
                weight.shape()[0],
                "bias length must match out_channels"
            );
        }
        Conv1d {
            weight,
            bias,
            stride,
            padding,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn in_channels(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn kernel(&self) -> usize {
        self.weight.shape()[2]
    }

    /// Same-kind layer with substituted parameters; stride and padding are
    /// preserved.
    pub fn with_params(&self, weight: Array3<f32>, bias: Option<Array1<f32>>) -> Self {
        Conv1d::new(weight, bias, self.stride, self.padding)
    }

    fn out_len(&self, in_len: usize) -> Result<usize> {
        let padded = in_len + 2 * self.padding;
        if padded < self.kernel() {
            return Err(ExplicarError::shape(
                "conv input length",
                &[self.kernel()],
                &[in_len],
            ));
        }
        Ok((padded - self.kernel()) / self.stride + 1)
    }

    pub(crate) fn forward(&self, x: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let (c_in, len) = x.dim();
        if c_in != self.in_channels() {
            return Err(ExplicarError::shape(
                "conv input channels",
                &[self.in_channels()],
                &[c_in],
            ));
        }
        let out_len = self.out_len(len)?;
        let mut y = Array2::<f32>::zeros((self.out_channels(), out_len));
        for oc in 0..self.out_channels() {
            let base = self.bias.as_ref().map_or(0.0, |b| b[oc]);
            for t in 0..out_len {
                let mut acc = base;
                for ic in 0..c_in {
                    for k in 0..self.kernel() {
                        let pos = t * self.stride + k;
                        // positions inside the zero padding contribute nothing
                        if pos < self.padding || pos - self.padding >= len {
                            continue;
                        }
                        acc += self.weight[[oc, ic, k]] * x[[ic, pos - self.padding]];
                    }
                }
                y[[oc, t]] = acc;
            }
        }
        Ok(y)
    }

    /// Adjoint of the forward mapping (correlation through the transposed
    /// kernel): scatters output-space sensitivities back onto the input
    /// grid. The bias does not participate.
    pub(crate) fn backproject(&self, s: &ArrayView2<f32>, in_len: usize) -> Result<Array2<f32>> {
        let (c_out, out_len) = s.dim();
        if c_out != self.out_channels() || out_len != self.out_len(in_len)? {
            return Err(ExplicarError::shape(
                "conv sensitivity",
                &[self.out_channels(), self.out_len(in_len)?],
                &[c_out, out_len],
            ));
        }
        let mut c = Array2::<f32>::zeros((self.in_channels(), in_len));
        for oc in 0..c_out {
            for t in 0..out_len {
                let sv = s[[oc, t]];
                if sv == 0.0 {
                    continue;
                }
                for ic in 0..self.in_channels() {
                    for k in 0..self.kernel() {
                        let pos = t * self.stride + k;
                        if pos < self.padding || pos - self.padding >= in_len {
                            continue;
                        }
                        c[[ic, pos - self.padding]] += self.weight[[oc, ic, k]] * sv;
                    }
                }
            }
        }
        Ok(c)
    }
}
