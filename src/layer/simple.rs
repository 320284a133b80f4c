//! Elementwise and structural layers

use crate::error::{ExplicarError, Result};
use ndarray::{Array1, ArrayD, ArrayView1, IxDyn};
use serde::{Deserialize, Serialize};

/// Elementwise activation function. Relevance passes through activations
/// unchanged, so only the forward mapping matters here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    pub(crate) fn forward(&self, x: &ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Activation::Relu => x.mapv(|v| v.max(0.0)),
            Activation::Tanh => x.mapv(f32::tanh),
            Activation::Sigmoid => x.mapv(|v| 1.0 / (1.0 + (-v).exp())),
        }
    }
}

/// Per-feature affine transform `y = scale * x + shift`. Produced by the
/// canonizer as the affine half of a decomposed normalization layer; treated
/// by the step engine as a dense layer with diagonal weight.
#[derive(Debug, Clone)]
pub struct Affine {
    pub scale: Array1<f32>,
    pub shift: Option<Array1<f32>>,
}

impl Affine {
    pub fn new(scale: Array1<f32>, shift: Option<Array1<f32>>) -> Self {
        if let Some(s) = &shift {
            assert_eq!(s.len(), scale.len(), "shift length must match scale");
        }
        Affine { scale, shift }
    }

    /// Same-kind layer with substituted parameters.
    pub fn with_params(&self, scale: Array1<f32>, shift: Option<Array1<f32>>) -> Self {
        Affine::new(scale, shift)
    }

    pub(crate) fn forward(&self, x: &ArrayView1<f32>) -> Result<Array1<f32>> {
        if x.len() != self.scale.len() {
            return Err(ExplicarError::shape(
                "affine input",
                &[self.scale.len()],
                &[x.len()],
            ));
        }
        let mut y = &self.scale * x;
        if let Some(s) = &self.shift {
            y += s;
        }
        Ok(y)
    }

    /// Diagonal back-projection: `c = scale * s`.
    pub(crate) fn backproject(&self, s: &ArrayView1<f32>) -> Result<Array1<f32>> {
        if s.len() != self.scale.len() {
            return Err(ExplicarError::shape(
                "affine sensitivity",
                &[self.scale.len()],
                &[s.len()],
            ));
        }
        Ok(&self.scale * s)
    }
}

/// Reshape to a rank-1 tensor. Relevance is un-flattened on the way back.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl Flatten {
    pub(crate) fn forward(x: &ArrayD<f32>) -> ArrayD<f32> {
        let flat: Vec<f32> = x.iter().copied().collect();
        let len = flat.len();
        ArrayD::from_shape_vec(IxDyn(&[len]), flat).expect("flat length always matches")
    }
}

/// Dropout is the identity at inference; the rate is kept only so a model
/// description round-trips.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    pub p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        assert!((0.0..=1.0).contains(&p), "dropout rate must be in [0, 1]");
        Dropout { p }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_relu_forward() {
        let x = arr1(&[-1.0, 0.0, 2.0]).into_dyn();
        assert_eq!(Activation::Relu.forward(&x), arr1(&[0.0, 0.0, 2.0]).into_dyn());
    }

    #[test]
    fn test_sigmoid_midpoint() {
        let x = arr1(&[0.0]).into_dyn();
        let y = Activation::Sigmoid.forward(&x);
        assert_abs_diff_eq!(y[[0]], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_affine_forward_and_backproject() {
        let a = Affine::new(arr1(&[2.0, -3.0]), Some(arr1(&[1.0, 1.0])));
        let y = a.forward(&arr1(&[1.0, 2.0]).view()).unwrap();
        assert_eq!(y, arr1(&[3.0, -5.0]));
        let c = a.backproject(&arr1(&[1.0, 1.0]).view()).unwrap();
        assert_eq!(c, arr1(&[2.0, -3.0]));
    }

    #[test]
    fn test_flatten_preserves_order() {
        let x = arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn();
        let y = Flatten::forward(&x);
        assert_eq!(y, arr1(&[1.0, 2.0, 3.0, 4.0]).into_dyn());
    }
}
