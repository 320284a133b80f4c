//! Graph canonization
//!
//! Normalization layers that carry an affine part entangle two concerns:
//! the normalization itself (handled by the closed-form LayerNorm rule) and
//! a per-feature affine map (handled by any weighted-layer rule).
//! Canonization splits such a node into a pure-normalization node followed
//! by an [`Affine`] node, preserving the forward function exactly, so rules
//! can be assigned to each half independently.

use crate::error::{ExplicarError, Result};
use crate::graph::{Graph, NodeId};
use crate::layer::{Affine, BatchNorm, Layer, LayerKind, LayerNorm};
use crate::trace::{TraceStep, TRACER};
use ndarray::Array1;

/// Split a norm-with-affine layer into `(pure normalization, affine)`.
/// Fails for any other layer.
pub fn canonize_layer(layer: &Layer) -> Result<(Layer, Layer)> {
    match layer {
        Layer::LayerNorm(ln) if ln.gamma.is_some() || ln.beta.is_some() => {
            let pure = Layer::LayerNorm(LayerNorm::new(None, None, ln.eps));
            Ok((pure, affine_part(&ln.gamma, &ln.beta)))
        }
        Layer::BatchNorm(bn) if bn.gamma.is_some() || bn.beta.is_some() => {
            let pure = Layer::BatchNorm(BatchNorm::new(
                bn.mean.clone(),
                bn.var.clone(),
                None,
                None,
                bn.eps,
            ));
            Ok((pure, affine_part(&bn.gamma, &bn.beta)))
        }
        other => Err(ExplicarError::CanonizeUnsupported { kind: other.kind() }),
    }
}

fn affine_part(gamma: &Option<Array1<f32>>, beta: &Option<Array1<f32>>) -> Layer {
    let scale = match (gamma, beta) {
        (Some(g), _) => g.clone(),
        (None, Some(b)) => Array1::ones(b.len()),
        (None, None) => unreachable!("caller checked an affine part exists"),
    };
    Layer::Affine(Affine::new(scale, beta.clone()))
}

/// Rewrite a graph so every norm-with-affine node becomes a pure
/// normalization node followed by an affine node. Wiring to the original
/// node is redirected to the affine half; the affine node inherits the
/// original name with an `.affine` suffix. The rewritten graph computes the
/// same forward function.
pub fn canonize(graph: &Graph) -> Result<Graph> {
    TRACER.start(TraceStep::Canonize);
    let mut out = Graph::new();
    let mut map: Vec<NodeId> = Vec::with_capacity(graph.len());
    let mut split = 0usize;
    for (_, node) in graph.nodes() {
        let inputs: Vec<NodeId> = node.inputs.iter().map(|id| map[id.0]).collect();
        let kind = node.layer.kind();
        let splittable = matches!(kind, LayerKind::LayerNorm | LayerKind::BatchNorm)
            && node.layer.has_params();
        let new_id = if splittable {
            let (pure, affine) = canonize_layer(&node.layer)?;
            split += 1;
            let pure_id = match &node.name {
                Some(name) => out.connect_named(pure, inputs, name.clone()),
                None => out.connect(pure, inputs),
            };
            match &node.name {
                Some(name) => out.connect_named(affine, vec![pure_id], format!("{name}.affine")),
                None => out.connect(affine, vec![pure_id]),
            }
        } else {
            match &node.name {
                Some(name) => out.connect_named(node.layer.clone(), inputs, name.clone()),
                None => out.connect(node.layer.clone(), inputs),
            }
        };
        map.push(new_id);
    }
    TRACER.end(TraceStep::Canonize, format!("{split} nodes split"));
    Ok(out)
}
