//! Composites: mapping rules onto graph nodes
//!
//! A composite is an ordered list of `(matcher, rule)` pairs. Assignment
//! walks the graph once; for each node the first matching pair wins and the
//! pairing is validated against the rule's compatibility table immediately,
//! so a bad composite fails before any propagation runs.
//!
//! Unmatched nodes fall back to defaults: parameter-free layers get
//! [`Rule::Pass`], except pooling ([`Rule::Zero`]) and pure normalization
//! ([`Rule::LayerNorm`]), which redistribute relevance and cannot be
//! skipped; an unmatched parameterized layer is an error rather than a
//! silent guess.

use crate::error::{ExplicarError, Result};
use crate::graph::Graph;
use crate::layer::LayerKind;
use crate::rules::Rule;
use serde::{Deserialize, Serialize};

/// Node predicate for composite assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Matcher {
    /// Match every node of one layer kind.
    Kind(LayerKind),
    /// Match the node with this assigned name.
    Name(String),
    /// Match the node at this arena position.
    Position(usize),
    /// Match parameterized layers that read the network input directly.
    FirstLayer,
    /// Match the last parameterized layer in the graph.
    LastLayer,
    /// Match every node.
    Any,
}

/// Ordered rule mapping; first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composite {
    pairs: Vec<(Matcher, Rule)>,
}

fn is_weighted(kind: LayerKind) -> bool {
    matches!(
        kind,
        LayerKind::Dense | LayerKind::Convolution | LayerKind::Affine | LayerKind::BatchNorm
    )
}

fn is_pooling(kind: LayerKind) -> bool {
    matches!(
        kind,
        LayerKind::MaxPool | LayerKind::AvgPool | LayerKind::GlobalAvgPool
    )
}

impl Composite {
    pub fn new(pairs: Vec<(Matcher, Rule)>) -> Self {
        Composite { pairs }
    }

    /// Append a pair; later pairs have lower priority.
    pub fn with(mut self, matcher: Matcher, rule: Rule) -> Self {
        self.pairs.push((matcher, rule));
        self
    }

    /// Resolve one rule per node, validating every pairing eagerly.
    pub fn assign(&self, graph: &Graph) -> Result<Vec<Rule>> {
        if graph.is_empty() {
            return Err(ExplicarError::EmptyGraph);
        }
        // names referenced by matchers must exist somewhere in the graph
        for (matcher, _) in &self.pairs {
            if let Matcher::Name(name) = matcher {
                if graph.node_by_name(name).is_none() {
                    return Err(ExplicarError::UnknownNode(name.clone()));
                }
            }
        }
        let last_weighted = graph
            .nodes()
            .filter(|(_, n)| is_weighted(n.layer.kind()))
            .map(|(id, _)| id)
            .last();

        let mut rules = Vec::with_capacity(graph.len());
        for (id, node) in graph.nodes() {
            let kind = node.layer.kind();
            let input_adjacent = graph.is_input_adjacent(id);
            let matched = self.pairs.iter().find(|(matcher, _)| match matcher {
                Matcher::Kind(k) => *k == kind,
                Matcher::Name(name) => node.name.as_deref() == Some(name.as_str()),
                Matcher::Position(p) => *p == id.0,
                Matcher::FirstLayer => is_weighted(kind) && input_adjacent,
                Matcher::LastLayer => Some(id) == last_weighted,
                Matcher::Any => true,
            });
            let rule = match matched {
                Some((_, rule)) => {
                    if !rule.is_compatible(&node.layer, input_adjacent) {
                        return Err(ExplicarError::IncompatibleRule {
                            rule: rule.name(),
                            kind,
                            node: id.0,
                        });
                    }
                    *rule
                }
                None if is_pooling(kind) => Rule::Zero,
                // normalization redistributes relevance even without an
                // affine part, so the norm rule is the fallback, not Pass
                None if !node.layer.has_params()
                    && matches!(kind, LayerKind::LayerNorm | LayerKind::BatchNorm) =>
                {
                    Rule::LayerNorm
                }
                None if !node.layer.has_params() => Rule::Pass,
                None => {
                    return Err(ExplicarError::MissingRule { kind, node: id.0 });
                }
            };
            rules.push(rule);
        }
        Ok(rules)
    }

    /// Epsilon on every parameterized layer, the normalization rule on
    /// normalization layers.
    pub fn epsilon(epsilon: f32) -> Self {
        Composite::new(vec![
            (Matcher::Kind(LayerKind::LayerNorm), Rule::LayerNorm),
            (Matcher::Kind(LayerKind::Dense), Rule::Epsilon { epsilon }),
            (
                Matcher::Kind(LayerKind::Convolution),
                Rule::Epsilon { epsilon },
            ),
            (Matcher::Kind(LayerKind::Affine), Rule::Epsilon { epsilon }),
            (
                Matcher::Kind(LayerKind::BatchNorm),
                Rule::Epsilon { epsilon },
            ),
        ])
    }

    /// Flat on the input layer, ZPlus on convolutions, epsilon on dense
    /// layers.
    pub fn epsilon_plus_flat() -> Self {
        Composite::new(vec![
            (Matcher::Kind(LayerKind::LayerNorm), Rule::LayerNorm),
            (Matcher::FirstLayer, Rule::Flat),
            (Matcher::Kind(LayerKind::Convolution), Rule::ZPlus),
            (Matcher::Kind(LayerKind::Affine), Rule::ZPlus),
            (
                Matcher::Kind(LayerKind::Dense),
                Rule::Epsilon { epsilon: 1e-6 },
            ),
            (Matcher::Kind(LayerKind::BatchNorm), Rule::LayerNorm),
        ])
    }

    /// ZBox on the input layer, gamma on convolutions, epsilon on dense
    /// layers. `low`/`high` bracket the input domain.
    pub fn epsilon_gamma_box(low: f32, high: f32, gamma: f32) -> Self {
        Composite::new(vec![
            (Matcher::Kind(LayerKind::LayerNorm), Rule::LayerNorm),
            (Matcher::FirstLayer, Rule::ZBox { low, high }),
            (Matcher::Kind(LayerKind::Convolution), Rule::Gamma { gamma }),
            (Matcher::Kind(LayerKind::Affine), Rule::Gamma { gamma }),
            (
                Matcher::Kind(LayerKind::Dense),
                Rule::Epsilon { epsilon: 1e-6 },
            ),
            (Matcher::Kind(LayerKind::BatchNorm), Rule::LayerNorm),
        ])
    }

    /// AlphaBeta(2, 1) on convolutions, epsilon on dense layers.
    pub fn alpha2_beta1() -> Self {
        let ab = Rule::AlphaBeta {
            alpha: 2.0,
            beta: 1.0,
        };
        Composite::new(vec![
            (Matcher::Kind(LayerKind::LayerNorm), Rule::LayerNorm),
            (Matcher::Kind(LayerKind::Convolution), ab),
            (Matcher::Kind(LayerKind::Affine), ab),
            (
                Matcher::Kind(LayerKind::Dense),
                Rule::Epsilon { epsilon: 1e-6 },
            ),
            (Matcher::Kind(LayerKind::BatchNorm), Rule::LayerNorm),
        ])
    }
}
