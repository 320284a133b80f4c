//! End-to-end propagation tests: full graphs through recording, rule
//! assignment and the backward walk.

use approx::assert_abs_diff_eq;
use explicar::canonize::canonize;
use explicar::composite::{Composite, Matcher};
use explicar::graph::Graph;
use explicar::layer::{
    Activation, BatchNorm, Conv1d, Dense, Flatten, Layer, LayerKind, MaxPool1d,
};
use explicar::propagate::{
    attribute, attribute_conditional, attribute_targets, output_relevance, propagate, Condition,
};
use explicar::rules::Rule;
use ndarray::{arr1, arr2, Array3};

fn zero_composite() -> Composite {
    Composite::new(vec![
        (Matcher::Kind(LayerKind::Dense), Rule::Zero),
        (Matcher::Kind(LayerKind::Convolution), Rule::Zero),
    ])
}

// ============================================================================
// Exact values on small dense graphs
// ============================================================================

#[test]
fn test_dense_layer_exact_attribution() {
    let g = Graph::from_layers([Layer::Dense(Dense::new(
        arr2(&[[3.0, 4.0], [5.0, 6.0]]),
        Some(arr1(&[7.0, 8.0])),
    ))]);
    let rules = zero_composite().assign(&g).unwrap();
    let cache = g.record(&arr1(&[1.0, 2.0]).into_dyn()).unwrap();
    let r_init = arr1(&[1.0 / 3.0, 2.0 / 3.0]).into_dyn();
    let r = propagate(&g, &rules, &cache, &r_init).unwrap();
    assert_abs_diff_eq!(r[[0]], 17.0 / 90.0, epsilon = 1e-6);
    assert_abs_diff_eq!(r[[1]], 316.0 / 675.0, epsilon = 1e-6);
}

#[test]
fn test_alpha_beta_exact_attribution() {
    let g = Graph::from_layers([Layer::Dense(Dense::new(
        arr2(&[[1.0, -1.0]]),
        Some(arr1(&[-1.0])),
    ))]);
    let cache = g.record(&arr1(&[1.0, 1.0]).into_dyn()).unwrap();
    let r_init = arr1(&[-1.0]).into_dyn();

    let zplus = vec![Rule::ZPlus];
    let r = propagate(&g, &zplus, &cache, &r_init).unwrap();
    assert_abs_diff_eq!(r[[0]], -1.0, epsilon = 1e-5);
    assert_abs_diff_eq!(r[[1]], 0.0, epsilon = 1e-5);

    let ab21 = vec![Rule::AlphaBeta {
        alpha: 2.0,
        beta: 1.0,
    }];
    let r = propagate(&g, &ab21, &cache, &r_init).unwrap();
    assert_abs_diff_eq!(r[[0]], -2.0, epsilon = 1e-5);
    assert_abs_diff_eq!(r[[1]], 0.5, epsilon = 1e-5);
}

// ============================================================================
// Convolutional pipeline
// ============================================================================

fn conv_net() -> Graph {
    // (2, 1, 2) kernel over a single input channel, all weights positive
    let w = Array3::from_shape_vec((2, 1, 2), vec![1.0, 2.0, 0.5, 1.5]).unwrap();
    Graph::from_layers([
        Layer::Conv1d(Conv1d::new(w, None, 1, 0)),
        Layer::Activation(Activation::Relu),
        Layer::Flatten(Flatten),
        Layer::Dense(Dense::new(arr2(&[[1.0, 0.5, 2.0, 1.0, 0.5, 1.5]]), None)),
    ])
}

#[test]
fn test_conv_pipeline_conserves_with_epsilon() {
    let g = conv_net();
    let x = arr1(&[1.0, 2.0, 0.5, 3.0])
        .into_shape_with_order((1, 4))
        .unwrap()
        .into_dyn();
    let attr = attribute(&g, &Composite::epsilon(1e-9), &x, 0).unwrap();
    assert_eq!(attr.relevance.shape(), &[1, 4]);
    // positive weights and activations, conservative rules throughout
    assert_abs_diff_eq!(attr.relevance.sum(), attr.score, epsilon = 1e-2);
}

#[test]
fn test_conv_pipeline_zbox_on_input_layer() {
    let g = conv_net();
    let x = arr1(&[0.2, 0.9, 0.1, 0.7])
        .into_shape_with_order((1, 4))
        .unwrap()
        .into_dyn();
    let attr = attribute(&g, &Composite::epsilon_gamma_box(0.0, 1.0, 0.25), &x, 0).unwrap();
    assert_eq!(attr.relevance.shape(), &[1, 4]);
    assert!(attr.relevance.iter().all(|v| v.is_finite()));
}

#[test]
fn test_max_pool_routes_to_winners() {
    let g = Graph::from_layers([
        Layer::MaxPool1d(MaxPool1d::new(2, 2)),
        Layer::Flatten(Flatten),
        Layer::Dense(Dense::new(arr2(&[[1.0, 1.0]]), None)),
    ]);
    let x = arr1(&[1.0, 3.0, 2.0, 5.0])
        .into_shape_with_order((1, 4))
        .unwrap()
        .into_dyn();
    let attr = attribute(&g, &zero_composite(), &x, 0).unwrap();
    // windows [1,3] and [2,5]: losers get nothing
    assert_abs_diff_eq!(attr.relevance[[0, 0]], 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(attr.relevance[[0, 1]], 3.0, epsilon = 1e-4);
    assert_abs_diff_eq!(attr.relevance[[0, 2]], 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(attr.relevance[[0, 3]], 5.0, epsilon = 1e-4);
}

// ============================================================================
// Branching topologies
// ============================================================================

#[test]
fn test_skip_connection_conserves() {
    let mut g = Graph::new();
    g.push(Layer::Dense(Dense::new(
        arr2(&[[1.0, 0.5], [0.25, 2.0]]),
        None,
    )));
    g.skip([
        Layer::Dense(Dense::new(arr2(&[[0.5, 1.0], [1.5, 0.25]]), None)),
        Layer::Activation(Activation::Relu),
    ]);
    let x = arr1(&[1.0, 2.0]).into_dyn();
    let rules = zero_composite().assign(&g).unwrap();
    let cache = g.record(&x).unwrap();
    let r_init = output_relevance(&cache, 0).unwrap();
    let r = propagate(&g, &rules, &cache, &r_init).unwrap();
    assert_abs_diff_eq!(r.sum(), r_init.sum(), epsilon = 1e-3);
}

#[test]
fn test_parallel_branches_conserve() {
    let mut g = Graph::new();
    g.push(Layer::Identity);
    g.parallel(vec![
        vec![Layer::Dense(Dense::new(arr2(&[[1.0, 2.0], [0.5, 1.0]]), None))],
        vec![Layer::Dense(Dense::new(
            arr2(&[[2.0, 0.25], [1.0, 3.0]]),
            None,
        ))],
    ]);
    let x = arr1(&[1.0, 1.5]).into_dyn();
    let rules = zero_composite().assign(&g).unwrap();
    let cache = g.record(&x).unwrap();
    let r_init = arr1(&[1.0, 2.0]).into_dyn();
    let r = propagate(&g, &rules, &cache, &r_init).unwrap();
    assert_abs_diff_eq!(r.sum(), 3.0, epsilon = 1e-3);
}

// ============================================================================
// Canonization in the pipeline
// ============================================================================

#[test]
fn test_canonized_batch_norm_attribution() {
    let mut g = Graph::new();
    g.push(Layer::Dense(Dense::new(
        arr2(&[[1.0, 2.0], [3.0, 0.5]]),
        Some(arr1(&[0.1, -0.1])),
    )));
    g.push_named(
        Layer::BatchNorm(BatchNorm::new(
            arr1(&[0.5, 1.0]),
            arr1(&[1.0, 2.0]),
            Some(arr1(&[1.5, 0.75])),
            Some(arr1(&[0.2, -0.3])),
            1e-5,
        )),
        "bn",
    );
    g.push(Layer::Dense(Dense::new(arr2(&[[1.0, -1.0]]), None)));

    let canon = canonize(&g).unwrap();
    assert_eq!(canon.len(), g.len() + 1);
    assert!(canon.node_by_name("bn.affine").is_some());

    let x = arr1(&[1.0, 2.0]).into_dyn();
    // identical forward function
    let raw = g.record(&x).unwrap();
    let split = canon.record(&x).unwrap();
    assert_abs_diff_eq!(raw.output()[[0]], split.output()[[0]], epsilon = 1e-5);

    let attr = attribute(&canon, &Composite::epsilon(1e-6), &x, 0).unwrap();
    assert_eq!(attr.relevance.shape(), x.shape());
    assert!(attr.relevance.iter().all(|v| v.is_finite()));
}

// ============================================================================
// Concept conditions and target reuse
// ============================================================================

#[test]
fn test_conditions_partition_relevance() {
    let mut g = Graph::new();
    g.push_named(
        Layer::Dense(Dense::new(arr2(&[[1.0, 2.0], [3.0, 0.5]]), None)),
        "feat",
    );
    g.push(Layer::Activation(Activation::Relu));
    g.push(Layer::Dense(Dense::new(arr2(&[[0.5, 1.5]]), None)));
    let x = arr1(&[1.0, 2.0]).into_dyn();
    let c = zero_composite();

    let full = attribute(&g, &c, &x, 0).unwrap();
    let ch0 = attribute_conditional(&g, &c, &x, 0, &[Condition::new("feat", vec![0])]).unwrap();
    let ch1 = attribute_conditional(&g, &c, &x, 0, &[Condition::new("feat", vec![1])]).unwrap();

    // the backward pass is linear in relevance for a fixed recording, so
    // disjoint channel conditions partition the unconditional result
    for i in 0..2 {
        assert_abs_diff_eq!(
            ch0.relevance[[i]] + ch1.relevance[[i]],
            full.relevance[[i]],
            epsilon = 1e-4
        );
    }
}

#[test]
fn test_multiple_targets_share_one_recording() {
    let g = Graph::from_layers([
        Layer::Dense(Dense::new(arr2(&[[1.0, 2.0], [3.0, 0.5]]), None)),
        Layer::Activation(Activation::Relu),
        Layer::Dense(Dense::new(arr2(&[[0.5, 1.5], [2.0, 1.0]]), None)),
    ]);
    let x = arr1(&[1.0, 2.0]).into_dyn();
    let attrs = attribute_targets(&g, &zero_composite(), &x, &[0, 1]).unwrap();
    assert_eq!(attrs.len(), 2);
    let cache = g.record(&x).unwrap();
    assert_abs_diff_eq!(attrs[0].score, cache.output()[[0]], epsilon = 1e-6);
    assert_abs_diff_eq!(attrs[1].score, cache.output()[[1]], epsilon = 1e-6);
    // conservative composite: each map sums to its own score
    assert_abs_diff_eq!(attrs[0].relevance.sum(), attrs[0].score, epsilon = 1e-3);
    assert_abs_diff_eq!(attrs[1].relevance.sum(), attrs[1].score, epsilon = 1e-3);
}
