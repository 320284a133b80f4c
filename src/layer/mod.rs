//! Closed layer vocabulary and forward math
//!
//! The engine recognizes a fixed set of layer kinds; each carries only the
//! parameters and configuration needed to evaluate its forward mapping and,
//! for weighted kinds, to derive rule-modified copies. Layers hold
//! pretrained parameters and are never mutated by propagation.
//!
//! Parallel branches and skip connections are graph topologies, not layer
//! kinds: a fan-out plus a [`Layer::Sum`] fan-in node (see [`crate::graph`]).

mod conv;
mod dense;
mod norm;
mod pool;
mod simple;

pub use conv::Conv1d;
pub use dense::Dense;
pub use norm::{BatchNorm, LayerNorm};
pub use pool::{AvgPool1d, GlobalAvgPool1d, MaxPool1d};
pub use simple::{Activation, Affine, Dropout, Flatten};

use crate::error::{ExplicarError, Result};
use ndarray::{ArrayD, ArrayView1, ArrayView2, Ix1, Ix2};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind tag for every layer in the closed vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    Dense,
    Convolution,
    MaxPool,
    AvgPool,
    GlobalAvgPool,
    LayerNorm,
    BatchNorm,
    Activation,
    Affine,
    Flatten,
    Dropout,
    Identity,
    Sum,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerKind::Dense => "dense",
            LayerKind::Convolution => "convolution",
            LayerKind::MaxPool => "max-pool",
            LayerKind::AvgPool => "avg-pool",
            LayerKind::GlobalAvgPool => "global-avg-pool",
            LayerKind::LayerNorm => "layer-norm",
            LayerKind::BatchNorm => "batch-norm",
            LayerKind::Activation => "activation",
            LayerKind::Affine => "affine",
            LayerKind::Flatten => "flatten",
            LayerKind::Dropout => "dropout",
            LayerKind::Identity => "identity",
            LayerKind::Sum => "sum",
        };
        write!(f, "{name}")
    }
}

/// A network layer with pretrained parameters.
#[derive(Debug, Clone)]
pub enum Layer {
    Dense(Dense),
    Conv1d(Conv1d),
    MaxPool1d(MaxPool1d),
    AvgPool1d(AvgPool1d),
    GlobalAvgPool1d(GlobalAvgPool1d),
    LayerNorm(LayerNorm),
    BatchNorm(BatchNorm),
    Activation(Activation),
    Affine(Affine),
    Flatten(Flatten),
    Dropout(Dropout),
    Identity,
    /// Elementwise fan-in join; its inputs are wired in the graph.
    Sum,
}

impl Layer {
    /// Kind tag used for dispatch and compatibility checks.
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Dense(_) => LayerKind::Dense,
            Layer::Conv1d(_) => LayerKind::Convolution,
            Layer::MaxPool1d(_) => LayerKind::MaxPool,
            Layer::AvgPool1d(_) => LayerKind::AvgPool,
            Layer::GlobalAvgPool1d(_) => LayerKind::GlobalAvgPool,
            Layer::LayerNorm(_) => LayerKind::LayerNorm,
            Layer::BatchNorm(_) => LayerKind::BatchNorm,
            Layer::Activation(_) => LayerKind::Activation,
            Layer::Affine(_) => LayerKind::Affine,
            Layer::Flatten(_) => LayerKind::Flatten,
            Layer::Dropout(_) => LayerKind::Dropout,
            Layer::Identity => LayerKind::Identity,
            Layer::Sum => LayerKind::Sum,
        }
    }

    /// Whether the layer carries learnable parameters. Normalization layers
    /// count only when their affine part is present (the canonized
    /// pure-normalization form is parameter-free).
    pub fn has_params(&self) -> bool {
        match self {
            Layer::Dense(_) | Layer::Conv1d(_) | Layer::Affine(_) => true,
            Layer::LayerNorm(ln) => ln.gamma.is_some() || ln.beta.is_some(),
            Layer::BatchNorm(bn) => bn.gamma.is_some() || bn.beta.is_some(),
            _ => false,
        }
    }

    /// Evaluate the forward mapping on a single (un-batched) input tensor.
    pub fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Layer::Dense(l) => l.forward(&as_1d(x, "dense input")?).map(|y| y.into_dyn()),
            Layer::Conv1d(l) => l.forward(&as_2d(x, "conv input")?).map(|y| y.into_dyn()),
            Layer::MaxPool1d(l) => l.forward(&as_2d(x, "max-pool input")?).map(|y| y.into_dyn()),
            Layer::AvgPool1d(l) => l.forward(&as_2d(x, "avg-pool input")?).map(|y| y.into_dyn()),
            Layer::GlobalAvgPool1d(l) => l
                .forward(&as_2d(x, "global-avg-pool input")?)
                .map(|y| y.into_dyn()),
            Layer::LayerNorm(l) => l
                .forward(&as_1d(x, "layer-norm input")?)
                .map(|y| y.into_dyn()),
            Layer::BatchNorm(l) => l
                .forward(&as_1d(x, "batch-norm input")?)
                .map(|y| y.into_dyn()),
            Layer::Activation(a) => Ok(a.forward(x)),
            Layer::Affine(l) => l.forward(&as_1d(x, "affine input")?).map(|y| y.into_dyn()),
            Layer::Flatten(_) => Ok(Flatten::forward(x)),
            Layer::Dropout(_) | Layer::Identity | Layer::Sum => Ok(x.clone()),
        }
    }
}

/// View a dynamic tensor as rank-1, or fail with a shape error.
pub(crate) fn as_1d<'a>(x: &'a ArrayD<f32>, context: &str) -> Result<ArrayView1<'a, f32>> {
    x.view()
        .into_dimensionality::<Ix1>()
        .map_err(|_| ExplicarError::shape(context, &[x.len()], x.shape()))
}

/// View a dynamic tensor as rank-2 (channels, length).
pub(crate) fn as_2d<'a>(x: &'a ArrayD<f32>, context: &str) -> Result<ArrayView2<'a, f32>> {
    x.view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| ExplicarError::shape(context, &[0, 0], x.shape()))
}
