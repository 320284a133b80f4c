//! Parameter and layer modifiers
//!
//! Pure functions deriving rule-specific parameter variants from a layer.
//! The original layer is never mutated; multi-term rules get a fixed-size
//! record of sibling sub-layers instead of optional fields, so a missing
//! term cannot be confused with an intentionally absent one.
//!
//! Sub-layer naming for four-term rules: `left_*` is the alpha-style path,
//! `right_*` the beta-style path; `*_pos` sub-layers are evaluated on the
//! positive activation part, `*_neg` on the negative part.

use crate::error::{ExplicarError, Result};
use crate::layer::Layer;
use crate::rules::Rule;
use ndarray::ArrayD;

/// Derived layer(s) for one propagation step.
#[derive(Debug, Clone)]
pub enum ModifiedLayer {
    /// One transformed layer with the same shape as the original.
    Single(Layer),
    /// Positive-part and negative-part variants (ZBox bracketing terms).
    TwoTerm { pos: Layer, neg: Layer },
    /// Alpha/beta-style four-term decomposition.
    FourTerm {
        left_pos: Layer,
        left_neg: Layer,
        right_pos: Layer,
        right_neg: Layer,
    },
}

/// Bias handling for the keep-positive / keep-negative presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasMode {
    /// Apply the same sign filter to the bias.
    Keep,
    /// Drop the bias entirely.
    Zero,
}

#[inline]
fn pos(v: f32) -> f32 {
    v.max(0.0)
}

#[inline]
fn neg(v: f32) -> f32 {
    v.min(0.0)
}

/// Apply `wf` to a layer's weight and `bf` to its bias (`None` drops the
/// bias). Non-parameter configuration (stride, padding) is preserved.
/// Batch-norm is first folded into its exact affine equivalent.
fn transform(
    layer: &Layer,
    wf: &dyn Fn(f32) -> f32,
    bf: Option<&dyn Fn(f32) -> f32>,
) -> Result<Layer> {
    match layer {
        Layer::Dense(d) => {
            let bias = match (&d.bias, bf) {
                (Some(b), Some(f)) => Some(b.mapv(f)),
                _ => None,
            };
            Ok(Layer::Dense(d.with_params(d.weight.mapv(wf), bias)))
        }
        Layer::Conv1d(c) => {
            let bias = match (&c.bias, bf) {
                (Some(b), Some(f)) => Some(b.mapv(f)),
                _ => None,
            };
            Ok(Layer::Conv1d(c.with_params(c.weight.mapv(wf), bias)))
        }
        Layer::Affine(a) => {
            let shift = match (&a.shift, bf) {
                (Some(s), Some(f)) => Some(s.mapv(f)),
                _ => None,
            };
            Ok(Layer::Affine(a.with_params(a.scale.mapv(wf), shift)))
        }
        Layer::BatchNorm(bn) => transform(&Layer::Affine(bn.to_affine()), wf, bf),
        other => Err(ExplicarError::NotParameterized { kind: other.kind() }),
    }
}

/// Transformed weight tensor for a single-term rule. Multi-term rules
/// return the weight unchanged; their parts are exposed by
/// [`modify_layer`].
pub fn modify_weight(rule: &Rule, w: &ArrayD<f32>) -> ArrayD<f32> {
    match rule {
        Rule::Gamma { gamma } => w.mapv(|v| v + gamma * pos(v)),
        Rule::WSquare => w.mapv(|v| v * v),
        Rule::Flat => w.mapv(|_| 1.0),
        _ => w.clone(),
    }
}

/// Transformed bias vector for a single-term rule. Flat drops the bias by
/// zeroing it.
pub fn modify_bias(rule: &Rule, b: &ArrayD<f32>) -> ArrayD<f32> {
    match rule {
        Rule::Gamma { gamma } => b.mapv(|v| v + gamma * pos(v)),
        Rule::WSquare => b.mapv(|v| v * v),
        Rule::Flat => b.mapv(|_| 0.0),
        _ => b.clone(),
    }
}

/// Derive the modified layer(s) a rule needs for one step on `layer`.
pub fn modify_layer(rule: &Rule, layer: &Layer) -> Result<ModifiedLayer> {
    match rule {
        Rule::Zero | Rule::Epsilon { .. } | Rule::LayerNorm | Rule::Pass => {
            Ok(ModifiedLayer::Single(transform(layer, &|v| v, Some(&|v| v))?))
        }
        Rule::Gamma { gamma } => {
            let g = *gamma;
            let boost = move |v: f32| v + g * pos(v);
            Ok(ModifiedLayer::Single(transform(
                layer,
                &boost,
                Some(&boost),
            )?))
        }
        Rule::WSquare => Ok(ModifiedLayer::Single(transform(
            layer,
            &|v| v * v,
            Some(&|v| v * v),
        )?)),
        Rule::Flat => Ok(ModifiedLayer::Single(transform(layer, &|_| 1.0, None)?)),
        // bias parts are clamped alike so the bracketing terms cancel the
        // bias out of the ZBox denominator
        Rule::ZBox { .. } => Ok(ModifiedLayer::TwoTerm {
            pos: transform(layer, &pos, Some(&pos))?,
            neg: transform(layer, &neg, Some(&neg))?,
        }),
        Rule::AlphaBeta { .. } | Rule::ZPlus => Ok(ModifiedLayer::FourTerm {
            // alpha path: positive products, positive bias part once
            left_pos: transform(layer, &pos, Some(&pos))?,
            left_neg: transform(layer, &neg, None)?,
            // beta path: negative products, negative bias part once
            right_pos: transform(layer, &neg, Some(&neg))?,
            right_neg: transform(layer, &pos, None)?,
        }),
        Rule::GeneralizedGamma { gamma } => {
            let g = *gamma;
            let boost_pos = move |v: f32| v + g * pos(v);
            let boost_neg = move |v: f32| v + g * neg(v);
            Ok(ModifiedLayer::FourTerm {
                left_pos: transform(layer, &boost_pos, Some(&boost_pos))?,
                left_neg: transform(layer, &boost_neg, None)?,
                right_pos: transform(layer, &boost_neg, Some(&boost_neg))?,
                right_neg: transform(layer, &boost_pos, None)?,
            })
        }
    }
}

/// Preset: keep only nonnegative parameters.
pub fn keep_positive(layer: &Layer, bias: BiasMode) -> Result<Layer> {
    match bias {
        BiasMode::Keep => transform(layer, &pos, Some(&pos)),
        BiasMode::Zero => transform(layer, &pos, None),
    }
}

/// Preset: keep only nonpositive parameters.
pub fn keep_negative(layer: &Layer, bias: BiasMode) -> Result<Layer> {
    match bias {
        BiasMode::Keep => transform(layer, &neg, Some(&neg)),
        BiasMode::Zero => transform(layer, &neg, None),
    }
}
