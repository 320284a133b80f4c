//! Denominator stabilization
//!
//! Every LRP rule divides upper-layer relevance by a forward-evaluated
//! denominator Z. Near-zero entries in Z would explode the quotient, so a
//! small epsilon is added with the sign of the denominator, which keeps the
//! quotient finite without flipping its sign. Zero is treated as positive.
//!
//! The constants are pinned rather than derived: reference relevance values
//! are compared at float tolerance, so the exact epsilon per rule family is
//! part of the numeric contract.

use ndarray::ArrayD;

/// Stabilizer for plain z-rule denominators (Zero, Gamma, WSquare, Flat,
/// LayerNorm, Sum splits).
pub const STABILIZER_DEFAULT: f32 = 1e-9;

/// Stabilizer for per-path denominators of split-weight rules (AlphaBeta,
/// ZPlus, ZBox, GeneralizedGamma).
pub const STABILIZER_SPLIT: f32 = 1e-6;

/// Add `eps` to `z` preserving its sign; `z == 0` gets `+eps`.
#[inline]
pub fn stabilize(z: f32, eps: f32) -> f32 {
    if z >= 0.0 {
        z + eps
    } else {
        z - eps
    }
}

/// In-place sign-preserving stabilization of a whole denominator tensor.
pub fn stabilize_inplace(z: &mut ArrayD<f32>, eps: f32) {
    z.mapv_inplace(|v| stabilize(v, eps));
}
