//! Layer-wise relevance propagation for feed-forward networks.
//!
//! This crate attributes a model's output to its input features by running
//! a recorded forward pass backwards under modified propagation rules:
//! - A [`graph::Graph`] of layers with explicit wiring (chains, skips,
//!   parallel branches)
//! - [`rules::Rule`] variants covering the standard LRP rule family
//! - [`composite::Composite`] matchers mapping rules onto graph nodes
//! - [`canonize`] to split normalization layers before rule assignment
//! - [`propagate`] drivers, including channel-conditioned attribution
//!
//! # Example
//!
//! ```
//! use explicar::composite::Composite;
//! use explicar::graph::Graph;
//! use explicar::layer::{Activation, Dense, Layer};
//! use explicar::propagate::attribute;
//! use ndarray::{arr1, arr2};
//!
//! let graph = Graph::from_layers([
//!     Layer::Dense(Dense::new(arr2(&[[1.0, 2.0], [3.0, 0.5]]), None)),
//!     Layer::Activation(Activation::Relu),
//!     Layer::Dense(Dense::new(arr2(&[[0.5, 1.5]]), None)),
//! ]);
//! let x = arr1(&[1.0, 2.0]).into_dyn();
//! let attr = attribute(&graph, &Composite::epsilon(1e-6), &x, 0).unwrap();
//! assert_eq!(attr.relevance.shape(), x.shape());
//! ```

pub mod canonize;
pub mod composite;
pub mod error;
pub mod graph;
pub mod layer;
pub mod modify;
pub mod num;
pub mod propagate;
pub mod rules;
pub mod step;
pub mod trace;

pub use composite::{Composite, Matcher};
pub use error::{ExplicarError, Result};
pub use graph::{ActivationCache, Graph, Node, NodeId};
pub use layer::{Layer, LayerKind};
pub use propagate::{
    attribute, attribute_batch, attribute_conditional, attribute_targets, Attribution, Condition,
};
pub use rules::Rule;
