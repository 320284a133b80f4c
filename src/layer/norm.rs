//! Normalization layers
//!
//! Both layers optionally carry an affine part (gamma/beta). The canonizer
//! splits a norm-with-affine layer into a pure-normalization layer and a
//! separate [`super::Affine`] layer so that the LayerNorm backward rule
//! applies only to the normalization and a standard rule to the affine.

use super::simple::Affine;
use crate::error::{ExplicarError, Result};
use ndarray::{Array1, ArrayView1};

/// Layer normalization over the feature axis:
/// `y = gamma * (x - mean) / sqrt(var + eps) + beta`.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub gamma: Option<Array1<f32>>,
    pub beta: Option<Array1<f32>>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(gamma: Option<Array1<f32>>, beta: Option<Array1<f32>>, eps: f32) -> Self {
        LayerNorm { gamma, beta, eps }
    }

    /// Mean and standard deviation of `x` as the forward pass computes them.
    pub(crate) fn stats(&self, x: &ArrayView1<f32>) -> (f32, f32) {
        let n = x.len() as f32;
        let mean = x.sum() / n;
        let var = x.mapv(|v| (v - mean).powi(2)).sum() / n;
        (mean, (var + self.eps).sqrt())
    }

    pub(crate) fn forward(&self, x: &ArrayView1<f32>) -> Result<Array1<f32>> {
        check_affine_len(x.len(), &self.gamma, &self.beta, "layer-norm")?;
        let (mean, std) = self.stats(x);
        let mut y = x.mapv(|v| (v - mean) / std);
        if let Some(g) = &self.gamma {
            y *= g;
        }
        if let Some(b) = &self.beta {
            y += b;
        }
        Ok(y)
    }
}

/// Batch normalization at inference time, per feature:
/// `y = gamma * (x - mean) / sqrt(var + eps) + beta` with running statistics.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub mean: Array1<f32>,
    pub var: Array1<f32>,
    pub gamma: Option<Array1<f32>>,
    pub beta: Option<Array1<f32>>,
    pub eps: f32,
}

impl BatchNorm {
    pub fn new(
        mean: Array1<f32>,
        var: Array1<f32>,
        gamma: Option<Array1<f32>>,
        beta: Option<Array1<f32>>,
        eps: f32,
    ) -> Self {
        assert_eq!(mean.len(), var.len(), "running stats must agree in length");
        BatchNorm {
            mean,
            var,
            gamma,
            beta,
            eps,
        }
    }

    pub(crate) fn forward(&self, x: &ArrayView1<f32>) -> Result<Array1<f32>> {
        if x.len() != self.mean.len() {
            return Err(ExplicarError::shape(
                "batch-norm input",
                &[self.mean.len()],
                &[x.len()],
            ));
        }
        check_affine_len(x.len(), &self.gamma, &self.beta, "batch-norm")?;
        let affine = self.to_affine();
        let shift = affine.shift.as_ref().expect("to_affine always sets shift");
        Ok(x.iter()
            .zip(affine.scale.iter())
            .zip(shift.iter())
            .map(|((&v, &a), &c)| a * v + c)
            .collect())
    }

    /// The layer's exact per-feature affine equivalent `y = a x + c` with
    /// `a = gamma / sqrt(var + eps)` and `c = beta - a * mean`. Used both by
    /// the forward pass and by the step engine, which treats batch-norm as a
    /// diagonal weighted layer.
    pub(crate) fn to_affine(&self) -> Affine {
        let inv_std = self.var.mapv(|v| 1.0 / (v + self.eps).sqrt());
        let scale = match &self.gamma {
            Some(g) => g * &inv_std,
            None => inv_std,
        };
        let mut shift = -(&scale * &self.mean);
        if let Some(b) = &self.beta {
            shift += b;
        }
        Affine::new(scale, Some(shift))
    }
}

fn check_affine_len(
    len: usize,
    gamma: &Option<Array1<f32>>,
    beta: &Option<Array1<f32>>,
    context: &str,
) -> Result<()> {
    for p in [gamma, beta].into_iter().flatten() {
        if p.len() != len {
            return Err(ExplicarError::shape(context, &[len], &[p.len()]));
        }
    }
    Ok(())
}
