//! Per-layer backward relevance computation
//!
//! The step engine takes (rule, layer, lower-layer activation, upper-layer
//! relevance) and produces the lower-layer relevance. All weighted rules
//! share one generalized z-pattern: forward-evaluate the rule-modified
//! layer(s) on the (split) activation to get denominator terms, stabilize,
//! divide the incoming relevance, back-project the quotient through the
//! transposed modified weight, and multiply elementwise by the (split)
//! activation. Rules differ only in how weights and activations are split
//! and boosted.
//!
//! Pooling layers have no weights; the same evaluate-and-divide mechanism
//! runs with the layer itself as forward and backward operator
//! (winner-take-all for max, uniform share for mean). Un-canonized layer
//! normalization uses a closed-form Jacobian approximation with mean and
//! standard deviation treated as constants. Structurally transparent
//! layers pass relevance through, reshaped to the input.

use crate::error::{ExplicarError, Result};
use crate::layer::{as_1d, as_2d, AvgPool1d, Layer, LayerKind, LayerNorm, MaxPool1d};
use crate::modify::{modify_layer, ModifiedLayer};
use crate::num::{stabilize, stabilize_inplace, STABILIZER_DEFAULT, STABILIZER_SPLIT};
use crate::rules::Rule;
use ndarray::{Array2, ArrayD, IxDyn};

/// Compute lower-layer relevance for one layer. `a_in` is the cached
/// activation entering the layer; `r_upper` the relevance of its output.
pub fn lrp_step(
    rule: &Rule,
    layer: &Layer,
    a_in: &ArrayD<f32>,
    r_upper: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    if matches!(rule, Rule::Pass) {
        return pass_step(a_in, r_upper);
    }
    match layer.kind() {
        LayerKind::Dense | LayerKind::Convolution | LayerKind::Affine | LayerKind::BatchNorm => {
            weighted_step(rule, layer, a_in, r_upper)
        }
        LayerKind::MaxPool => {
            let Layer::MaxPool1d(p) = layer else {
                unreachable!("kind implies variant")
            };
            max_pool_step(p, a_in, r_upper, rule.stabilizer())
        }
        LayerKind::AvgPool => {
            let Layer::AvgPool1d(p) = layer else {
                unreachable!("kind implies variant")
            };
            avg_pool_step(p, a_in, r_upper, rule.stabilizer())
        }
        LayerKind::GlobalAvgPool => global_avg_pool_step(a_in, r_upper, rule.stabilizer()),
        LayerKind::LayerNorm => {
            let Layer::LayerNorm(ln) = layer else {
                unreachable!("kind implies variant")
            };
            match rule {
                Rule::LayerNorm => layer_norm_step(ln, a_in, r_upper),
                other => Err(ExplicarError::IncompatibleRule {
                    rule: other.name(),
                    kind: layer.kind(),
                    node: 0,
                }),
            }
        }
        LayerKind::Activation
        | LayerKind::Flatten
        | LayerKind::Dropout
        | LayerKind::Identity
        | LayerKind::Sum => pass_step(a_in, r_upper),
    }
}

/// In-place variant of [`lrp_step`]: writes the lower-layer relevance into
/// `r_lower`.
pub fn lrp_step_into(
    r_lower: &mut ArrayD<f32>,
    rule: &Rule,
    layer: &Layer,
    a_in: &ArrayD<f32>,
    r_upper: &ArrayD<f32>,
) -> Result<()> {
    *r_lower = lrp_step(rule, layer, a_in, r_upper)?;
    Ok(())
}

/// Split relevance at an elementwise-sum fan-in proportionally to each
/// addend. Returns one relevance tensor per input, in input order.
pub fn sum_split(inputs: &[ArrayD<f32>], r: &ArrayD<f32>, eps: f32) -> Result<Vec<ArrayD<f32>>> {
    let first = inputs.first().ok_or(ExplicarError::EmptyGraph)?;
    let mut z = first.clone();
    for x in &inputs[1..] {
        if x.shape() != first.shape() {
            return Err(ExplicarError::shape("sum input", first.shape(), x.shape()));
        }
        z += x;
    }
    if r.shape() != z.shape() {
        return Err(ExplicarError::shape("sum relevance", z.shape(), r.shape()));
    }
    stabilize_inplace(&mut z, eps);
    let s = r / &z;
    Ok(inputs.iter().map(|x| x * &s).collect())
}

fn pass_step(a_in: &ArrayD<f32>, r: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if a_in.len() != r.len() {
        return Err(ExplicarError::shape("pass-through", a_in.shape(), r.shape()));
    }
    let flat: Vec<f32> = r.iter().copied().collect();
    Ok(ArrayD::from_shape_vec(IxDyn(a_in.shape()), flat).expect("length checked"))
}

/// Back-project an output-space sensitivity through the transpose of a
/// weighted layer. The bias never participates.
fn backproject(layer: &Layer, s: &ArrayD<f32>, in_shape: &[usize]) -> Result<ArrayD<f32>> {
    match layer {
        Layer::Dense(d) => Ok(d.backproject(&as_1d(s, "dense sensitivity")?)?.into_dyn()),
        Layer::Conv1d(c) => {
            if in_shape.len() != 2 {
                return Err(ExplicarError::shape("conv activation", &[0, 0], in_shape));
            }
            Ok(c
                .backproject(&as_2d(s, "conv sensitivity")?, in_shape[1])?
                .into_dyn())
        }
        Layer::Affine(a) => Ok(a.backproject(&as_1d(s, "affine sensitivity")?)?.into_dyn()),
        other => Err(ExplicarError::NotParameterized { kind: other.kind() }),
    }
}

/// The shared z-pattern: `R = mult_in ⊙ Wᵀ(R_upper / stab(W eval_in + b))`.
fn z_rule(
    m: &Layer,
    eval_in: &ArrayD<f32>,
    mult_in: &ArrayD<f32>,
    eps: f32,
    r: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let mut z = m.forward(eval_in)?;
    if z.shape() != r.shape() {
        return Err(ExplicarError::shape("upper relevance", z.shape(), r.shape()));
    }
    stabilize_inplace(&mut z, eps);
    let s = r / &z;
    let c = backproject(m, &s, eval_in.shape())?;
    Ok(mult_in * &c)
}

fn weighted_step(
    rule: &Rule,
    layer: &Layer,
    a: &ArrayD<f32>,
    r: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    match rule {
        Rule::Zero | Rule::Epsilon { .. } | Rule::Gamma { .. } | Rule::LayerNorm => {
            let ModifiedLayer::Single(m) = modify_layer(rule, layer)? else {
                unreachable!("single-term rule")
            };
            z_rule(&m, a, a, rule.stabilizer(), r)
        }
        Rule::WSquare | Rule::Flat => {
            let ModifiedLayer::Single(m) = modify_layer(rule, layer)? else {
                unreachable!("single-term rule")
            };
            // content-independent: the activation is replaced by ones
            let ones = ArrayD::<f32>::ones(a.raw_dim());
            z_rule(&m, &ones, &ones, rule.stabilizer(), r)
        }
        Rule::AlphaBeta { alpha, beta } => alpha_beta_step(*alpha, *beta, layer, a, r),
        Rule::ZPlus => alpha_beta_step(1.0, 0.0, layer, a, r),
        Rule::ZBox { low, high } => zbox_step(*low, *high, layer, a, r),
        Rule::GeneralizedGamma { gamma } => gen_gamma_step(*gamma, layer, a, r),
        Rule::Pass => unreachable!("handled before dispatch"),
    }
}

/// One alpha/beta path: denominator from the paired sub-layers on the split
/// activation, back-projection through both.
fn split_path(
    on_pos: &Layer,
    on_neg: &Layer,
    xp: &ArrayD<f32>,
    xn: &ArrayD<f32>,
    r: &ArrayD<f32>,
    in_shape: &[usize],
) -> Result<ArrayD<f32>> {
    let mut z = on_pos.forward(xp)? + on_neg.forward(xn)?;
    if z.shape() != r.shape() {
        return Err(ExplicarError::shape("upper relevance", z.shape(), r.shape()));
    }
    stabilize_inplace(&mut z, STABILIZER_SPLIT);
    let s = r / &z;
    let cp = backproject(on_pos, &s, in_shape)?;
    let cn = backproject(on_neg, &s, in_shape)?;
    Ok(xp * &cp + xn * &cn)
}

fn alpha_beta_step(
    alpha: f32,
    beta: f32,
    layer: &Layer,
    a: &ArrayD<f32>,
    r: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let ModifiedLayer::FourTerm {
        left_pos,
        left_neg,
        right_pos,
        right_neg,
    } = modify_layer(&Rule::AlphaBeta { alpha, beta }, layer)?
    else {
        unreachable!("alpha-beta is four-term")
    };
    let xp = a.mapv(|v| v.max(0.0));
    let xn = a.mapv(|v| v.min(0.0));
    let ca = split_path(&left_pos, &left_neg, &xp, &xn, r, a.shape())?;
    let mut out = ca * alpha;
    if beta != 0.0 {
        let cb = split_path(&right_pos, &right_neg, &xp, &xn, r, a.shape())?;
        out = out - cb * beta;
    }
    Ok(out)
}

fn zbox_step(
    low: f32,
    high: f32,
    layer: &Layer,
    a: &ArrayD<f32>,
    r: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let ModifiedLayer::TwoTerm { pos, neg } = modify_layer(&Rule::ZBox { low, high }, layer)?
    else {
        unreachable!("zbox is two-term")
    };
    let lb = ArrayD::from_elem(a.raw_dim(), low);
    let hb = ArrayD::from_elem(a.raw_dim(), high);
    let mut z = layer.forward(a)? - pos.forward(&lb)? - neg.forward(&hb)?;
    if z.shape() != r.shape() {
        return Err(ExplicarError::shape("upper relevance", z.shape(), r.shape()));
    }
    stabilize_inplace(&mut z, STABILIZER_SPLIT);
    let s = r / &z;
    let c = backproject(layer, &s, a.shape())?;
    let cp = backproject(&pos, &s, a.shape())?;
    let cn = backproject(&neg, &s, a.shape())?;
    Ok(a * &c - lb * &cp - hb * &cn)
}

fn gen_gamma_step(
    gamma: f32,
    layer: &Layer,
    a: &ArrayD<f32>,
    r: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let ModifiedLayer::FourTerm {
        left_pos,
        left_neg,
        right_pos,
        right_neg,
    } = modify_layer(&Rule::GeneralizedGamma { gamma }, layer)?
    else {
        unreachable!("generalized gamma is four-term")
    };
    let xp = a.mapv(|v| v.max(0.0));
    let xn = a.mapv(|v| v.min(0.0));
    let y = layer.forward(a)?;
    if y.shape() != r.shape() {
        return Err(ExplicarError::shape("upper relevance", y.shape(), r.shape()));
    }
    // per output unit, the boost pair follows the sign of the true output
    let mask_pos = y.mapv(|v| if v >= 0.0 { 1.0 } else { 0.0 });
    let mask_neg = mask_pos.mapv(|v| 1.0 - v);
    let zl = left_pos.forward(&xp)? + left_neg.forward(&xn)?;
    let zr = right_pos.forward(&xp)? + right_neg.forward(&xn)?;
    let mut z = &zl * &mask_pos + &zr * &mask_neg;
    stabilize_inplace(&mut z, STABILIZER_SPLIT);
    let s = r / &z;
    let sl = &s * &mask_pos;
    let sr = &s * &mask_neg;
    let cp = backproject(&left_pos, &sl, a.shape())? + backproject(&right_pos, &sr, a.shape())?;
    let cn = backproject(&left_neg, &sl, a.shape())? + backproject(&right_neg, &sr, a.shape())?;
    Ok(&xp * &cp + &xn * &cn)
}

fn max_pool_step(
    pool: &MaxPool1d,
    a: &ArrayD<f32>,
    r: &ArrayD<f32>,
    eps: f32,
) -> Result<ArrayD<f32>> {
    let x = as_2d(a, "max-pool input")?;
    let z = pool.forward(&x)?;
    let r2 = as_2d(r, "max-pool relevance")?;
    if r2.dim() != z.dim() {
        return Err(ExplicarError::shape(
            "max-pool relevance",
            &[z.nrows(), z.ncols()],
            r.shape(),
        ));
    }
    let idx = pool.argmax(&x)?;
    let mut out = Array2::<f32>::zeros(x.dim());
    for c in 0..z.nrows() {
        for t in 0..z.ncols() {
            let s = r2[[c, t]] / stabilize(z[[c, t]], eps);
            let winner = idx[[c, t]];
            out[[c, winner]] += x[[c, winner]] * s;
        }
    }
    Ok(out.into_dyn())
}

fn avg_pool_step(
    pool: &AvgPool1d,
    a: &ArrayD<f32>,
    r: &ArrayD<f32>,
    eps: f32,
) -> Result<ArrayD<f32>> {
    let x = as_2d(a, "avg-pool input")?;
    let z = pool.forward(&x)?;
    let r2 = as_2d(r, "avg-pool relevance")?;
    if r2.dim() != z.dim() {
        return Err(ExplicarError::shape(
            "avg-pool relevance",
            &[z.nrows(), z.ncols()],
            r.shape(),
        ));
    }
    let share = 1.0 / pool.kernel as f32;
    let mut out = Array2::<f32>::zeros(x.dim());
    for c in 0..z.nrows() {
        for t in 0..z.ncols() {
            let s = r2[[c, t]] / stabilize(z[[c, t]], eps);
            for k in 0..pool.kernel {
                let posn = t * pool.stride + k;
                out[[c, posn]] += x[[c, posn]] * s * share;
            }
        }
    }
    Ok(out.into_dyn())
}

fn global_avg_pool_step(a: &ArrayD<f32>, r: &ArrayD<f32>, eps: f32) -> Result<ArrayD<f32>> {
    let x = as_2d(a, "global-avg-pool input")?;
    let r1 = as_1d(r, "global-avg-pool relevance")?;
    let (channels, len) = x.dim();
    if r1.len() != channels {
        return Err(ExplicarError::shape(
            "global-avg-pool relevance",
            &[channels],
            r.shape(),
        ));
    }
    let share = 1.0 / len as f32;
    let mut out = Array2::<f32>::zeros((channels, len));
    for c in 0..channels {
        let z: f32 = x.row(c).sum() * share;
        let s = r1[c] / stabilize(z, eps);
        for l in 0..len {
            out[[c, l]] = x[[c, l]] * s * share;
        }
    }
    Ok(out.into_dyn())
}

/// Closed-form LayerNorm backward: with mean and standard deviation
/// detached, the layer acts as the linear map `diag(γ)(I - 1/n)/σ`, whose
/// transpose applied to `s = R/stab(z)` gives
/// `c = (γ ⊙ s - mean(γ ⊙ s))/σ`.
fn layer_norm_step(ln: &LayerNorm, a: &ArrayD<f32>, r: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let x = as_1d(a, "layer-norm input")?;
    let r1 = as_1d(r, "layer-norm relevance")?;
    if r1.len() != x.len() {
        return Err(ExplicarError::shape(
            "layer-norm relevance",
            &[x.len()],
            r.shape(),
        ));
    }
    let (_, std) = ln.stats(&x);
    let mut z = ln.forward(&x)?;
    z.mapv_inplace(|v| stabilize(v, STABILIZER_DEFAULT));
    let s = &r1 / &z;
    let gs = match &ln.gamma {
        Some(g) => &s * g,
        None => s,
    };
    let mean_gs = gs.sum() / gs.len() as f32;
    let c = gs.mapv(|v| (v - mean_gs) / std);
    Ok((&x * &c).into_dyn())
}
