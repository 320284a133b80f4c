//! LRP rule definitions
//!
//! Each rule is an immutable tagged variant carrying only its own numeric
//! hyperparameters; rules are stateless and shared freely across
//! propagation calls. Every variant declares which layer kinds it may
//! legally be applied to — the compatibility check runs at composite-build
//! time so a bad pairing fails before any number is produced.

use crate::layer::{Layer, LayerKind};
use crate::num::{STABILIZER_DEFAULT, STABILIZER_SPLIT};
use serde::{Deserialize, Serialize};

/// A relevance-propagation rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Rule {
    /// LRP-0: redistribute by contribution share with unmodified weights.
    Zero,
    /// LRP-ε: as Zero with a sign-preserving epsilon on the denominator.
    Epsilon { epsilon: f32 },
    /// Positive weight parts boosted by `1 + gamma`; non-conservative.
    Gamma { gamma: f32 },
    /// Bounded-input rule for the first layer; `low`/`high` bracket the
    /// input domain and are broadcast over the input tensor.
    ZBox { low: f32, high: f32 },
    /// Separate positive- and negative-contribution paths weighted by
    /// alpha and beta; conservative when `alpha - beta = 1`.
    AlphaBeta { alpha: f32, beta: f32 },
    /// Squared weights, activation-independent.
    WSquare,
    /// Uniform weights, location-uninformative baseline.
    Flat,
    /// Positive contributions only; identical to AlphaBeta(1, 0).
    ZPlus,
    /// Four-term positive/negative decomposition of weights and
    /// activations, each gamma-boosted; robust to negative activations.
    GeneralizedGamma { gamma: f32 },
    /// Closed-form backward approximation of normalization, with mean and
    /// standard deviation treated as constants.
    LayerNorm,
    /// Identity passthrough for structurally transparent layers.
    Pass,
}

impl Rule {
    /// Stable rule name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Rule::Zero => "zero",
            Rule::Epsilon { .. } => "epsilon",
            Rule::Gamma { .. } => "gamma",
            Rule::ZBox { .. } => "zbox",
            Rule::AlphaBeta { .. } => "alpha-beta",
            Rule::WSquare => "wsquare",
            Rule::Flat => "flat",
            Rule::ZPlus => "zplus",
            Rule::GeneralizedGamma { .. } => "generalized-gamma",
            Rule::LayerNorm => "layer-norm",
            Rule::Pass => "pass",
        }
    }

    /// Stabilization epsilon applied to this rule's denominators. The
    /// Epsilon rule uses its own hyperparameter; split-weight rules use the
    /// larger per-path constant.
    pub fn stabilizer(&self) -> f32 {
        match self {
            Rule::Epsilon { epsilon } => *epsilon,
            Rule::AlphaBeta { .. }
            | Rule::ZPlus
            | Rule::ZBox { .. }
            | Rule::GeneralizedGamma { .. } => STABILIZER_SPLIT,
            _ => STABILIZER_DEFAULT,
        }
    }

    /// Whether the rule preserves total relevance across a bias-free layer.
    pub fn is_conservative(&self) -> bool {
        match self {
            Rule::Zero
            | Rule::Epsilon { .. }
            | Rule::ZPlus
            | Rule::WSquare
            | Rule::Flat
            | Rule::Pass => true,
            Rule::AlphaBeta { alpha, beta } => (alpha - beta - 1.0).abs() < f32::EPSILON,
            Rule::Gamma { .. }
            | Rule::ZBox { .. }
            | Rule::GeneralizedGamma { .. }
            | Rule::LayerNorm => false,
        }
    }

    /// Whether the rule may legally be applied to `layer`. `input_adjacent`
    /// marks nodes that read the network input directly; ZBox is restricted
    /// to those.
    pub fn is_compatible(&self, layer: &Layer, input_adjacent: bool) -> bool {
        let kind = layer.kind();
        let weighted = matches!(
            kind,
            LayerKind::Dense | LayerKind::Convolution | LayerKind::Affine | LayerKind::BatchNorm
        );
        let pooling = matches!(
            kind,
            LayerKind::MaxPool | LayerKind::AvgPool | LayerKind::GlobalAvgPool
        );
        match self {
            Rule::Zero | Rule::Epsilon { .. } => weighted || pooling || kind == LayerKind::Sum,
            Rule::AlphaBeta { .. } | Rule::ZPlus => weighted || pooling || kind == LayerKind::Sum,
            Rule::Gamma { .. } | Rule::GeneralizedGamma { .. } => {
                matches!(
                    kind,
                    LayerKind::Dense | LayerKind::Convolution | LayerKind::Affine
                )
            }
            Rule::WSquare | Rule::Flat => matches!(
                kind,
                LayerKind::Dense | LayerKind::Convolution | LayerKind::Affine
            ),
            Rule::ZBox { .. } => {
                input_adjacent && matches!(kind, LayerKind::Dense | LayerKind::Convolution)
            }
            Rule::LayerNorm => matches!(kind, LayerKind::LayerNorm | LayerKind::BatchNorm),
            Rule::Pass => !layer.has_params() && !pooling,
        }
    }
}
