//! Fully-connected layer

use crate::error::{ExplicarError, Result};
use ndarray::{Array1, Array2, ArrayView1};

/// Dense layer computing `y = W x + b` with weight shape `(out, in)`.
#[derive(Debug, Clone)]
pub struct Dense {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Dense {
    /// Create a dense layer from pretrained parameters.
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        if let Some(b) = &bias {
            assert_eq!(b.len(), weight.nrows(), "bias length must match output dim");
        }
        Dense { weight, bias }
    }

    /// Output dimensionality.
    pub fn out_dim(&self) -> usize {
        self.weight.nrows()
    }

    /// Input dimensionality.
    pub fn in_dim(&self) -> usize {
        self.weight.ncols()
    }

    /// Same-kind layer with substituted parameters.
    pub fn with_params(&self, weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Dense::new(weight, bias)
    }

    pub(crate) fn forward(&self, x: &ArrayView1<f32>) -> Result<Array1<f32>> {
        if x.len() != self.in_dim() {
            return Err(ExplicarError::shape(
                "dense input",
                &[self.in_dim()],
                &[x.len()],
            ));
        }
        let mut y = self.weight.dot(x);
        if let Some(b) = &self.bias {
            y += b;
        }
        Ok(y)
    }

    /// Back-project an output-space sensitivity through the transposed
    /// weight: `c = Wᵀ s`. The bias does not participate.
    pub(crate) fn backproject(&self, s: &ArrayView1<f32>) -> Result<Array1<f32>> {
        if s.len() != self.out_dim() {
            return Err(ExplicarError::shape(
                "dense sensitivity",
                &[self.out_dim()],
                &[s.len()],
            ));
        }
        Ok(self.weight.t().dot(s))
    }
}
