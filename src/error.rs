//! Error types for the propagation engine
//!
//! Configuration problems (incompatible rule/layer pairings, unrecognized
//! canonization patterns, missing rule assignments) are detected eagerly at
//! assembly time. Shape mismatches are fatal and raised immediately with
//! enough context to localize the offending node. Numeric degeneracy
//! (near-zero denominators) is handled by stabilization and never surfaces
//! as an error.

use crate::layer::LayerKind;
use thiserror::Error;

/// Errors raised by graph assembly, composite validation and propagation.
#[derive(Debug, Error)]
pub enum ExplicarError {
    /// A rule was assigned to a layer kind it cannot legally handle.
    #[error("rule {rule} is not compatible with {kind} layer at node {node}")]
    IncompatibleRule {
        rule: &'static str,
        kind: LayerKind,
        node: usize,
    },

    /// A weighted layer reached composite assignment with no matching rule.
    #[error("no rule assigned for {kind} layer at node {node}")]
    MissingRule { kind: LayerKind, node: usize },

    /// Activation or relevance tensor shape violates a layer's contract.
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// The canonizer was asked to decompose a pattern it does not recognize.
    #[error("cannot canonize {kind} layer: expected a normalization layer with affine parameters")]
    CanonizeUnsupported { kind: LayerKind },

    /// A parameter modifier was asked to transform a layer without
    /// parameters.
    #[error("layer kind {kind} has no parameters to modify")]
    NotParameterized { kind: LayerKind },

    /// The rule map handed to the driver does not cover the graph.
    #[error("rule map covers {got} nodes but the graph has {expected}")]
    RuleMapLength { expected: usize, got: usize },

    /// A graph with no nodes cannot be propagated through.
    #[error("graph has no nodes")]
    EmptyGraph,

    /// A node name referenced by a matcher or condition does not exist.
    #[error("unknown node name: {0}")]
    UnknownNode(String),
}

/// Result type for all engine operations.
pub type Result<T> = std::result::Result<T, ExplicarError>;

impl ExplicarError {
    pub(crate) fn shape(context: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        ExplicarError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
