//! Backward propagation driver
//!
//! Walks the graph in reverse construction order, applying one rule step
//! per node. Relevance entering a node's output is accumulated before the
//! node is stepped: a producer consumed by several nodes receives the sum
//! of its consumers' contributions, and a sum fan-in splits its relevance
//! across its inputs proportionally to their recorded activations. Nodes
//! that read the network input deposit their result into the final
//! attribution map.
//!
//! Conditions restrict the flow for concept-level attribution: at a chosen
//! node, relevance is masked to a set of leading-axis channels before it
//! continues downward.

use crate::error::{ExplicarError, Result};
use crate::graph::{ActivationCache, Graph};
use crate::num::STABILIZER_DEFAULT;
use crate::rules::Rule;
use crate::step;
use crate::trace::{TraceStep, TRACER};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Result of one attribution call.
#[derive(Debug, Clone)]
pub struct Attribution {
    /// Relevance over the network input, same shape as the input.
    pub relevance: ArrayD<f32>,
    /// Total relevance injected at the output.
    pub score: f32,
}

/// Restrict relevance at a named node to a set of leading-axis channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub node: String,
    pub channels: Vec<usize>,
}

impl Condition {
    pub fn new(node: impl Into<String>, channels: Vec<usize>) -> Self {
        Condition {
            node: node.into(),
            channels,
        }
    }
}

/// Initial relevance for one output unit: zeros everywhere except `target`,
/// which receives its own recorded activation. `target` indexes the
/// flattened output.
pub fn output_relevance(cache: &ActivationCache, target: usize) -> Result<ArrayD<f32>> {
    let out = cache.output();
    if target >= out.len() {
        return Err(ExplicarError::shape(
            "output target",
            &[out.len()],
            &[target],
        ));
    }
    let mut r = ArrayD::zeros(out.raw_dim());
    let value = out.iter().nth(target).copied().unwrap_or(0.0);
    if let Some(slot) = r.iter_mut().nth(target) {
        *slot = value;
    }
    Ok(r)
}

/// Propagate `r_init` from the graph output back to the network input.
pub fn propagate(
    graph: &Graph,
    rules: &[Rule],
    cache: &ActivationCache,
    r_init: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    propagate_conditional(graph, rules, cache, r_init, &[])
}

/// [`propagate`] with channel conditions applied at named nodes.
pub fn propagate_conditional(
    graph: &Graph,
    rules: &[Rule],
    cache: &ActivationCache,
    r_init: &ArrayD<f32>,
    conditions: &[Condition],
) -> Result<ArrayD<f32>> {
    if graph.is_empty() {
        return Err(ExplicarError::EmptyGraph);
    }
    if rules.len() != graph.len() {
        return Err(ExplicarError::RuleMapLength {
            expected: graph.len(),
            got: rules.len(),
        });
    }
    let output = graph.output()?;
    let out_shape = cache.output_of(output).shape();
    if r_init.shape() != out_shape {
        return Err(ExplicarError::shape(
            "initial relevance",
            out_shape,
            r_init.shape(),
        ));
    }

    // resolve condition names once; masks keyed by node index
    let mut masks: Vec<Option<&[usize]>> = vec![None; graph.len()];
    for cond in conditions {
        let id = graph
            .node_by_name(&cond.node)
            .ok_or_else(|| ExplicarError::UnknownNode(cond.node.clone()))?;
        masks[id.0] = Some(&cond.channels);
    }

    // relevance accumulated at each node's output
    let mut acc: Vec<Option<ArrayD<f32>>> = vec![None; graph.len()];
    acc[output.0] = Some(r_init.clone());
    let mut input_rel: Option<ArrayD<f32>> = None;

    for (id, node) in graph.nodes().collect::<Vec<_>>().into_iter().rev() {
        let Some(mut r_out) = acc[id.0].take() else {
            continue;
        };
        if let Some(channels) = masks[id.0] {
            mask_channels(&mut r_out, channels)?;
        }
        let rule = &rules[id.0];
        let node_in = &cache.inputs[id.0];

        if node.layer.kind() == crate::layer::LayerKind::Sum {
            TRACER.start(TraceStep::Merge);
            let parts = step::sum_split(node_in, &r_out, STABILIZER_DEFAULT)?;
            TRACER.end(TraceStep::Merge, format!("node {} fan-in", id.0));
            if node.inputs.is_empty() {
                deposit(&mut input_rel, parts.into_iter().next().expect("one part"));
            } else {
                for (src, part) in node.inputs.iter().zip(parts) {
                    deposit(&mut acc[src.0], part);
                }
            }
            continue;
        }

        TRACER.start(TraceStep::Step);
        let r_in = step::lrp_step(rule, &node.layer, &node_in[0], &r_out).map_err(|e| match e {
            // the step engine does not know arena positions
            ExplicarError::IncompatibleRule { rule, kind, .. } => {
                ExplicarError::IncompatibleRule {
                    rule,
                    kind,
                    node: id.0,
                }
            }
            other => other,
        })?;
        TRACER.end(
            TraceStep::Step,
            format!("{}/{}", node.layer.kind(), rule.name()),
        );

        match node.inputs.first() {
            Some(src) => deposit(&mut acc[src.0], r_in),
            None => deposit(&mut input_rel, r_in),
        }
    }

    input_rel.ok_or(ExplicarError::EmptyGraph)
}

fn deposit(slot: &mut Option<ArrayD<f32>>, r: ArrayD<f32>) {
    match slot {
        Some(acc) => *acc += &r,
        None => *slot = Some(r),
    }
}

fn mask_channels(r: &mut ArrayD<f32>, channels: &[usize]) -> Result<()> {
    let leading = r.shape().first().copied().unwrap_or(0);
    for &c in channels {
        if c >= leading {
            return Err(ExplicarError::shape("condition channels", &[leading], &[c]));
        }
    }
    for (i, mut lane) in r.outer_iter_mut().enumerate() {
        if !channels.contains(&i) {
            lane.fill(0.0);
        }
    }
    Ok(())
}

/// Record, assign and propagate in one call for a single output target.
pub fn attribute(
    graph: &Graph,
    composite: &crate::composite::Composite,
    x: &ArrayD<f32>,
    target: usize,
) -> Result<Attribution> {
    let targets = [target];
    let mut results = attribute_targets(graph, composite, x, &targets)?;
    Ok(results.pop().expect("one target yields one attribution"))
}

/// Attribute several output targets from a single forward recording. The
/// forward pass and rule assignment run once; only the backward walk
/// repeats per target.
pub fn attribute_targets(
    graph: &Graph,
    composite: &crate::composite::Composite,
    x: &ArrayD<f32>,
    targets: &[usize],
) -> Result<Vec<Attribution>> {
    TRACER.start(TraceStep::Assign);
    let rules = composite.assign(graph)?;
    TRACER.end(TraceStep::Assign, format!("{} nodes", rules.len()));
    let cache = graph.record(x)?;
    targets
        .iter()
        .map(|&t| {
            let r_init = output_relevance(&cache, t)?;
            let score = r_init.sum();
            let relevance = propagate(graph, &rules, &cache, &r_init)?;
            Ok(Attribution { relevance, score })
        })
        .collect()
}

/// Attribute one target for each sample. Samples are independent; each gets
/// its own forward recording.
pub fn attribute_batch(
    graph: &Graph,
    composite: &crate::composite::Composite,
    samples: &[ArrayD<f32>],
    target: usize,
) -> Result<Vec<Attribution>> {
    let rules = composite.assign(graph)?;
    samples
        .iter()
        .map(|x| {
            let cache = graph.record(x)?;
            let r_init = output_relevance(&cache, target)?;
            let score = r_init.sum();
            let relevance = propagate(graph, &rules, &cache, &r_init)?;
            Ok(Attribution { relevance, score })
        })
        .collect()
}

/// [`attribute`] with channel conditions applied during the backward walk.
pub fn attribute_conditional(
    graph: &Graph,
    composite: &crate::composite::Composite,
    x: &ArrayD<f32>,
    target: usize,
    conditions: &[Condition],
) -> Result<Attribution> {
    let rules = composite.assign(graph)?;
    let cache = graph.record(x)?;
    let r_init = output_relevance(&cache, target)?;
    let score = r_init.sum();
    let relevance = propagate_conditional(graph, &rules, &cache, &r_init, conditions)?;
    Ok(Attribution { relevance, score })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::{Composite, Matcher};
    use crate::layer::{Activation, Dense, Layer, LayerKind};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    fn zero_composite() -> Composite {
        // matched by kind: a broad Any matcher would pair Zero with
        // activation nodes and fail the eager compatibility check
        Composite::new(vec![(Matcher::Kind(LayerKind::Dense), Rule::Zero)])
    }

    #[test]
    fn test_any_matcher_rejected_on_incompatible_node() {
        let g = Graph::from_layers([
            Layer::Dense(Dense::new(arr2(&[[1.0, 2.0], [3.0, 0.5]]), None)),
            Layer::Activation(Activation::Relu),
        ]);
        let broad = Composite::new(vec![(Matcher::Any, Rule::Zero)]);
        assert!(matches!(
            broad.assign(&g),
            Err(ExplicarError::IncompatibleRule { node: 1, .. })
        ));
    }

    #[test]
    fn test_driver_matches_single_step_fixture() {
        let g = Graph::from_layers([Layer::Dense(Dense::new(
            arr2(&[[3.0, 4.0], [5.0, 6.0]]),
            Some(arr1(&[7.0, 8.0])),
        ))]);
        let rules = vec![Rule::Zero];
        let cache = g.record(&arr1(&[1.0, 2.0]).into_dyn()).unwrap();
        let r_init = arr1(&[1.0 / 3.0, 2.0 / 3.0]).into_dyn();
        let r = propagate(&g, &rules, &cache, &r_init).unwrap();
        assert_abs_diff_eq!(r[[0]], 17.0 / 90.0, epsilon = 1e-6);
        assert_abs_diff_eq!(r[[1]], 316.0 / 675.0, epsilon = 1e-6);
    }

    #[test]
    fn test_chain_conserves_without_bias() {
        let g = Graph::from_layers([
            Layer::Dense(Dense::new(arr2(&[[1.0, 2.0], [3.0, 0.5]]), None)),
            Layer::Activation(Activation::Relu),
            Layer::Dense(Dense::new(arr2(&[[0.5, 1.5], [2.0, 1.0]]), None)),
        ]);
        let rules = vec![Rule::Zero, Rule::Pass, Rule::Zero];
        let x = arr1(&[1.0, 2.0]).into_dyn();
        let cache = g.record(&x).unwrap();
        let r_init = output_relevance(&cache, 0).unwrap();
        let r = propagate(&g, &rules, &cache, &r_init).unwrap();
        assert_abs_diff_eq!(r.sum(), r_init.sum(), epsilon = 1e-3);
    }

    #[test]
    fn test_skip_connection_conserves_and_merges_fan_out() {
        let mut g = Graph::new();
        g.push(Layer::Identity);
        g.skip([Layer::Dense(Dense::new(
            arr2(&[[1.0, 0.5], [0.25, 2.0]]),
            None,
        ))]);
        let rules = vec![Rule::Pass, Rule::Zero, Rule::Zero];
        let x = arr1(&[1.0, 2.0]).into_dyn();
        let cache = g.record(&x).unwrap();
        let r_init = arr1(&[1.0, 1.0]).into_dyn();
        let r = propagate(&g, &rules, &cache, &r_init).unwrap();
        // all activations positive, all rules conservative
        assert_abs_diff_eq!(r.sum(), 2.0, epsilon = 1e-3);
    }

    #[test]
    fn test_parallel_branches_off_input_accumulate() {
        let mut g = Graph::new();
        let a = g.connect(
            Layer::Dense(Dense::new(arr2(&[[1.0, 0.0], [0.0, 1.0]]), None)),
            vec![],
        );
        let b = g.connect(
            Layer::Dense(Dense::new(arr2(&[[3.0, 0.0], [0.0, 3.0]]), None)),
            vec![],
        );
        g.connect(Layer::Sum, vec![a, b]);
        let rules = vec![Rule::Zero, Rule::Zero, Rule::Pass];
        let x = arr1(&[1.0, 1.0]).into_dyn();
        let cache = g.record(&x).unwrap();
        let r_init = arr1(&[2.0, 2.0]).into_dyn();
        let r = propagate(&g, &rules, &cache, &r_init).unwrap();
        assert_abs_diff_eq!(r.sum(), 4.0, epsilon = 1e-3);
        // both branches write to the same two input units
        assert_abs_diff_eq!(r[[0]], 2.0, epsilon = 1e-3);
    }

    #[test]
    fn test_rule_map_length_checked() {
        let g = Graph::from_layers([Layer::Identity, Layer::Identity]);
        let cache = g.record(&arr1(&[1.0]).into_dyn()).unwrap();
        let r = arr1(&[1.0]).into_dyn();
        assert!(matches!(
            propagate(&g, &[Rule::Pass], &cache, &r),
            Err(ExplicarError::RuleMapLength {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn test_initial_relevance_shape_checked() {
        let g = Graph::from_layers([Layer::Identity]);
        let cache = g.record(&arr1(&[1.0, 2.0]).into_dyn()).unwrap();
        let bad = arr1(&[1.0]).into_dyn();
        assert!(matches!(
            propagate(&g, &[Rule::Pass], &cache, &bad),
            Err(ExplicarError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_output_relevance_one_hot() {
        let g = Graph::from_layers([Layer::Dense(Dense::new(
            arr2(&[[1.0, 0.0], [0.0, 2.0]]),
            None,
        ))]);
        let cache = g.record(&arr1(&[3.0, 4.0]).into_dyn()).unwrap();
        let r = output_relevance(&cache, 1).unwrap();
        assert_eq!(r, arr1(&[0.0, 8.0]).into_dyn());
        assert!(output_relevance(&cache, 5).is_err());
    }

    #[test]
    fn test_attribute_end_to_end() {
        let g = Graph::from_layers([
            Layer::Dense(Dense::new(arr2(&[[1.0, 2.0], [3.0, 0.5]]), None)),
            Layer::Activation(Activation::Relu),
            Layer::Dense(Dense::new(arr2(&[[0.5, 1.5], [2.0, 1.0]]), None)),
        ]);
        let x = arr1(&[1.0, 2.0]).into_dyn();
        let attr = attribute(&g, &zero_composite(), &x, 0).unwrap();
        let cache = g.record(&x).unwrap();
        assert_abs_diff_eq!(attr.score, cache.output()[[0]], epsilon = 1e-6);
        assert_eq!(attr.relevance.shape(), x.shape());
        assert_abs_diff_eq!(attr.relevance.sum(), attr.score, epsilon = 1e-3);
    }

    #[test]
    fn test_attribute_targets_matches_individual_calls() {
        let g = Graph::from_layers([
            Layer::Dense(Dense::new(arr2(&[[1.0, 2.0], [3.0, 0.5]]), None)),
            Layer::Activation(Activation::Relu),
            Layer::Dense(Dense::new(arr2(&[[0.5, 1.5], [2.0, 1.0]]), None)),
        ]);
        let x = arr1(&[1.0, 2.0]).into_dyn();
        let both = attribute_targets(&g, &zero_composite(), &x, &[0, 1]).unwrap();
        let single0 = attribute(&g, &zero_composite(), &x, 0).unwrap();
        let single1 = attribute(&g, &zero_composite(), &x, 1).unwrap();
        assert_eq!(both.len(), 2);
        assert_eq!(both[0].relevance, single0.relevance);
        assert_eq!(both[1].relevance, single1.relevance);
    }

    #[test]
    fn test_attribute_batch_is_per_sample() {
        let g = Graph::from_layers([Layer::Dense(Dense::new(
            arr2(&[[1.0, 2.0], [3.0, 0.5]]),
            None,
        ))]);
        let samples = vec![
            arr1(&[1.0, 2.0]).into_dyn(),
            arr1(&[0.5, 0.25]).into_dyn(),
        ];
        let batch = attribute_batch(&g, &zero_composite(), &samples, 1).unwrap();
        assert_eq!(batch.len(), 2);
        for (sample, attr) in samples.iter().zip(&batch) {
            let single = attribute(&g, &zero_composite(), sample, 1).unwrap();
            assert_eq!(attr.relevance, single.relevance);
        }
    }

    #[test]
    fn test_condition_masks_channels() {
        let mut g = Graph::new();
        g.push_named(
            Layer::Dense(Dense::new(arr2(&[[1.0, 0.0], [0.0, 1.0]]), None)),
            "feat",
        );
        g.push(Layer::Dense(Dense::new(arr2(&[[1.0, 1.0]]), None)));
        let x = arr1(&[2.0, 3.0]).into_dyn();

        let full = attribute_conditional(&g, &zero_composite(), &x, 0, &[]).unwrap();
        let only0 = attribute_conditional(
            &g,
            &zero_composite(),
            &x,
            0,
            &[Condition::new("feat", vec![0])],
        )
        .unwrap();
        // masking channel 1 removes its share of the input relevance
        assert_abs_diff_eq!(only0.relevance[[1]], 0.0, epsilon = 1e-6);
        assert!(only0.relevance.sum() < full.relevance.sum());
        assert_abs_diff_eq!(only0.relevance[[0]], full.relevance[[0]], epsilon = 1e-4);
    }

    #[test]
    fn test_condition_unknown_node_rejected() {
        let g = Graph::from_layers([Layer::Identity]);
        let x = arr1(&[1.0]).into_dyn();
        let err = attribute_conditional(
            &g,
            &Composite::new(vec![]),
            &x,
            0,
            &[Condition::new("missing", vec![0])],
        );
        assert!(matches!(err, Err(ExplicarError::UnknownNode(_))));
    }

    #[test]
    fn test_condition_channel_out_of_range() {
        let mut g = Graph::new();
        g.push_named(Layer::Identity, "only");
        let x = arr1(&[1.0, 2.0]).into_dyn();
        let err = attribute_conditional(
            &g,
            &Composite::new(vec![]),
            &x,
            0,
            &[Condition::new("only", vec![7])],
        );
        assert!(matches!(err, Err(ExplicarError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_sum_kind_is_split_not_stepped() {
        let mut g = Graph::new();
        let a = g.connect(Layer::Identity, vec![]);
        let b = g.connect(Layer::Identity, vec![]);
        g.connect(Layer::Sum, vec![a, b]);
        assert_eq!(g.node(g.output().unwrap()).layer.kind(), LayerKind::Sum);
        let rules = vec![Rule::Pass, Rule::Pass, Rule::Pass];
        let x = arr1(&[1.0, 3.0]).into_dyn();
        let cache = g.record(&x).unwrap();
        let r_init = arr1(&[4.0, 4.0]).into_dyn();
        let r = propagate(&g, &rules, &cache, &r_init).unwrap();
        // both arms see the same activation, so each gets half, and both
        // deposit into the same network input
        assert_abs_diff_eq!(r[[0]], 4.0, epsilon = 1e-4);
        assert_abs_diff_eq!(r[[1]], 4.0, epsilon = 1e-4);
    }
}
