//! Model graph and recorded activations
//!
//! Nodes live in an arena and refer to their data inputs by [`NodeId`].
//! Construction order is the topological order: a node may only be wired to
//! ids that already exist, so a single in-order walk is a valid forward
//! schedule and the reverse walk a valid backward schedule.
//!
//! A node with no inputs reads the network input directly. Branching
//! topologies (parallel branches, skip connections) fan out by wiring
//! several nodes to the same producer and fan back in through a
//! [`Layer::Sum`] node; [`Graph::skip`] and [`Graph::parallel`] build the
//! two common shapes.

use crate::error::{ExplicarError, Result};
use crate::layer::{Layer, LayerKind};
use crate::trace::{TraceStep, TRACER};
use ndarray::ArrayD;

/// Arena index of a node. Only valid for the graph that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// One layer plus its wiring.
#[derive(Debug, Clone)]
pub struct Node {
    pub layer: Layer,
    pub inputs: Vec<NodeId>,
    pub name: Option<String>,
}

/// A directed acyclic model graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Graph { nodes: Vec::new() }
    }

    /// Sequential graph from a layer chain.
    pub fn from_layers(layers: impl IntoIterator<Item = Layer>) -> Self {
        let mut g = Graph::new();
        for layer in layers {
            g.push(layer);
        }
        g
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Append a layer fed by the current tail (or by the network input when
    /// the graph is empty).
    pub fn push(&mut self, layer: Layer) -> NodeId {
        let inputs = match self.nodes.len() {
            0 => Vec::new(),
            n => vec![NodeId(n - 1)],
        };
        self.wire(layer, inputs, None)
    }

    /// [`Graph::push`] with a node name for matcher and condition lookup.
    pub fn push_named(&mut self, layer: Layer, name: impl Into<String>) -> NodeId {
        let inputs = match self.nodes.len() {
            0 => Vec::new(),
            n => vec![NodeId(n - 1)],
        };
        self.wire(layer, inputs, Some(name.into()))
    }

    /// Append a layer with explicit inputs. An empty input list reads the
    /// network input directly.
    pub fn connect(&mut self, layer: Layer, inputs: Vec<NodeId>) -> NodeId {
        self.wire(layer, inputs, None)
    }

    /// [`Graph::connect`] with a node name.
    pub fn connect_named(
        &mut self,
        layer: Layer,
        inputs: Vec<NodeId>,
        name: impl Into<String>,
    ) -> NodeId {
        self.wire(layer, inputs, Some(name.into()))
    }

    fn wire(&mut self, layer: Layer, inputs: Vec<NodeId>, name: Option<String>) -> NodeId {
        for id in &inputs {
            assert!(id.0 < self.nodes.len(), "input node {} does not exist", id.0);
        }
        assert!(
            inputs.len() <= 1 || layer.kind() == LayerKind::Sum,
            "only sum nodes may take multiple inputs"
        );
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            layer,
            inputs,
            name,
        });
        id
    }

    /// Residual block: run `body` off the current tail and join the body
    /// output with the tail through a sum node. Returns the sum node.
    pub fn skip(&mut self, body: impl IntoIterator<Item = Layer>) -> NodeId {
        let tail = self.nodes.len().checked_sub(1).map(NodeId);
        let mut prev = tail;
        for layer in body {
            let inputs = prev.map(|p| vec![p]).unwrap_or_default();
            prev = Some(self.wire(layer, inputs, None));
        }
        let body_end = prev.expect("skip body must contain at least one layer");
        let inputs = match tail {
            Some(t) => vec![t, body_end],
            // skip off the network input: the carried arm reads it directly
            None => {
                let carry = self.wire(Layer::Identity, Vec::new(), None);
                vec![carry, body_end]
            }
        };
        self.wire(Layer::Sum, inputs, None)
    }

    /// Parallel branches off the current tail, joined by a sum node.
    /// Returns the sum node.
    pub fn parallel(&mut self, branches: Vec<Vec<Layer>>) -> NodeId {
        assert!(!branches.is_empty(), "parallel needs at least one branch");
        let tail = self.nodes.len().checked_sub(1).map(NodeId);
        let mut ends = Vec::with_capacity(branches.len());
        for branch in branches {
            assert!(!branch.is_empty(), "parallel branch must not be empty");
            let mut prev = tail;
            for layer in branch {
                let inputs = prev.map(|p| vec![p]).unwrap_or_default();
                prev = Some(self.wire(layer, inputs, None));
            }
            ends.push(prev.expect("branch is non-empty"));
        }
        self.wire(Layer::Sum, ends, None)
    }

    /// Look up a node by its assigned name.
    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.name.as_deref() == Some(name))
            .map(NodeId)
    }

    /// The graph output node (the last node pushed).
    pub fn output(&self) -> Result<NodeId> {
        match self.nodes.len() {
            0 => Err(ExplicarError::EmptyGraph),
            n => Ok(NodeId(n - 1)),
        }
    }

    /// Whether a node reads the network input directly.
    pub fn is_input_adjacent(&self, id: NodeId) -> bool {
        self.nodes[id.0].inputs.is_empty()
    }

    /// Nodes that consume `id`'s output.
    pub fn consumers(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.contains(&id))
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    /// Run the forward pass, recording every node's inputs and output.
    pub fn record(&self, x: &ArrayD<f32>) -> Result<ActivationCache> {
        if self.nodes.is_empty() {
            return Err(ExplicarError::EmptyGraph);
        }
        TRACER.start(TraceStep::Forward);
        let mut inputs: Vec<Vec<ArrayD<f32>>> = Vec::with_capacity(self.nodes.len());
        let mut outputs: Vec<ArrayD<f32>> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let node_in: Vec<ArrayD<f32>> = if node.inputs.is_empty() {
                vec![x.clone()]
            } else {
                node.inputs.iter().map(|id| outputs[id.0].clone()).collect()
            };
            let out = match node.layer.kind() {
                LayerKind::Sum => sum_inputs(&node_in)?,
                _ => node.layer.forward(&node_in[0])?,
            };
            inputs.push(node_in);
            outputs.push(out);
        }
        TRACER.end(TraceStep::Forward, format!("{} nodes", self.nodes.len()));
        Ok(ActivationCache {
            network_input: x.clone(),
            inputs,
            outputs,
        })
    }
}

fn sum_inputs(inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
    let mut acc = inputs[0].clone();
    for t in &inputs[1..] {
        if t.shape() != acc.shape() {
            return Err(ExplicarError::shape("sum fan-in", acc.shape(), t.shape()));
        }
        acc += t;
    }
    Ok(acc)
}

/// Activations captured by one forward pass, indexed by node.
///
/// The cache is the sole coupling between forward and backward: a backward
/// pass never re-evaluates the model, so one recording can serve any number
/// of propagation calls (different rules, different targets).
#[derive(Debug, Clone)]
pub struct ActivationCache {
    pub network_input: ArrayD<f32>,
    /// Per node, one recorded tensor per wired input.
    pub inputs: Vec<Vec<ArrayD<f32>>>,
    pub outputs: Vec<ArrayD<f32>>,
}

impl ActivationCache {
    /// Output of a single node.
    pub fn output_of(&self, id: NodeId) -> &ArrayD<f32> {
        &self.outputs[id.0]
    }

    /// The network output (output of the last node).
    pub fn output(&self) -> &ArrayD<f32> {
        self.outputs.last().expect("cache is never empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Activation, Dense};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    fn dense(w: &[[f32; 2]; 2]) -> Layer {
        Layer::Dense(Dense::new(arr2(w), None))
    }

    #[test]
    fn test_sequential_record() {
        let g = Graph::from_layers([
            dense(&[[1.0, 0.0], [0.0, 1.0]]),
            Layer::Activation(Activation::Relu),
        ]);
        let cache = g.record(&arr1(&[2.0, -3.0]).into_dyn()).unwrap();
        assert_eq!(cache.output(), &arr1(&[2.0, 0.0]).into_dyn());
        assert_eq!(cache.outputs.len(), 2);
        assert_eq!(cache.inputs[1][0], arr1(&[2.0, -3.0]).into_dyn());
    }

    #[test]
    fn test_first_node_reads_network_input() {
        let mut g = Graph::new();
        let a = g.push(Layer::Identity);
        assert!(g.is_input_adjacent(a));
        let b = g.push(Layer::Identity);
        assert!(!g.is_input_adjacent(b));
    }

    #[test]
    fn test_skip_connection_sums_both_arms() {
        let mut g = Graph::new();
        g.push(Layer::Identity);
        let sum = g.skip([dense(&[[2.0, 0.0], [0.0, 2.0]])]);
        let cache = g.record(&arr1(&[1.0, 2.0]).into_dyn()).unwrap();
        // x + 2x
        assert_eq!(cache.output_of(sum), &arr1(&[3.0, 6.0]).into_dyn());
    }

    #[test]
    fn test_skip_off_network_input_carries_both_arms() {
        let mut g = Graph::new();
        let sum = g.skip([dense(&[[2.0, 0.0], [0.0, 2.0]])]);
        let cache = g.record(&arr1(&[1.0, 2.0]).into_dyn()).unwrap();
        // x + 2x, not body-only
        assert_eq!(cache.output_of(sum), &arr1(&[3.0, 6.0]).into_dyn());
        assert_eq!(g.node(sum).inputs.len(), 2);
    }

    #[test]
    fn test_parallel_branches_sum() {
        let mut g = Graph::new();
        g.push(Layer::Identity);
        g.parallel(vec![
            vec![dense(&[[1.0, 0.0], [0.0, 1.0]])],
            vec![dense(&[[0.0, 1.0], [1.0, 0.0]])],
        ]);
        let cache = g.record(&arr1(&[1.0, 5.0]).into_dyn()).unwrap();
        let out = cache.output();
        assert_abs_diff_eq!(out[[0]], 6.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out[[1]], 6.0, epsilon = 1e-6);
    }

    #[test]
    fn test_branches_off_network_input() {
        let mut g = Graph::new();
        let a = g.connect(dense(&[[1.0, 0.0], [0.0, 1.0]]), vec![]);
        let b = g.connect(dense(&[[3.0, 0.0], [0.0, 3.0]]), vec![]);
        g.connect(Layer::Sum, vec![a, b]);
        assert!(g.is_input_adjacent(a));
        assert!(g.is_input_adjacent(b));
        let cache = g.record(&arr1(&[1.0, 1.0]).into_dyn()).unwrap();
        assert_eq!(cache.output(), &arr1(&[4.0, 4.0]).into_dyn());
    }

    #[test]
    fn test_node_lookup_by_name() {
        let mut g = Graph::new();
        g.push_named(Layer::Identity, "stem");
        let id = g.push_named(dense(&[[1.0, 0.0], [0.0, 1.0]]), "head");
        assert_eq!(g.node_by_name("head"), Some(id));
        assert_eq!(g.node_by_name("missing"), None);
    }

    #[test]
    fn test_consumers() {
        let mut g = Graph::new();
        let a = g.push(Layer::Identity);
        let b = g.connect(Layer::Identity, vec![a]);
        let c = g.connect(Layer::Identity, vec![a]);
        let s = g.connect(Layer::Sum, vec![b, c]);
        assert_eq!(g.consumers(a), vec![b, c]);
        assert_eq!(g.consumers(s), vec![]);
    }

    #[test]
    fn test_empty_graph_rejected() {
        let g = Graph::new();
        assert!(matches!(
            g.record(&arr1(&[1.0]).into_dyn()),
            Err(ExplicarError::EmptyGraph)
        ));
        assert!(g.output().is_err());
    }

    #[test]
    #[should_panic(expected = "multiple inputs")]
    fn test_multi_input_non_sum_panics() {
        let mut g = Graph::new();
        let a = g.push(Layer::Identity);
        let b = g.connect(Layer::Identity, vec![a]);
        g.connect(Layer::Identity, vec![a, b]);
    }

    #[test]
    fn test_sum_shape_mismatch() {
        let mut g = Graph::new();
        let a = g.connect(Layer::Identity, vec![]);
        // second arm projects down to one unit, so the fan-in shapes differ
        let b = g.connect(
            Layer::Dense(Dense::new(arr2(&[[1.0, 0.0]]), None)),
            vec![],
        );
        g.connect(Layer::Sum, vec![a, b]);
        assert!(matches!(
            g.record(&arr1(&[1.0, 1.0]).into_dyn()),
            Err(ExplicarError::ShapeMismatch { .. })
        ));
    }
}
