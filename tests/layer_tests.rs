//! Behavioural tests of crossbar layers and the shared circuit model.
//!
//! - Sub-threshold conductances vanish from the forward pass but keep their gradient
//! - Sign routing only involves the negation circuit for negative conductances
//! - Soft counts report exact counts in the forward pass
//! - Pruning is one-way and idempotent
//! - All layers observe the same nonlinear circuits

use approx::assert_abs_diff_eq;
use ndarray::{array, s, Array2};
use pnn::autodiff::Tape;
use pnn::core::PruningCounts;
use pnn::{CircuitKind, CircuitLayer, ConductanceBounds, Config, Network, NonlinearCircuit, SurrogatePackage};
use std::rc::Rc;

fn circuits() -> (Rc<NonlinearCircuit>, Rc<NonlinearCircuit>) {
    let act = NonlinearCircuit::new(
        Rc::new(SurrogatePackage::nominal(CircuitKind::Activation)),
        &[0.0; 6],
    )
    .expect("activation circuit");
    let neg = NonlinearCircuit::new(
        Rc::new(SurrogatePackage::nominal(CircuitKind::Negation)),
        &[0.0; 9],
    )
    .expect("negation circuit");
    (Rc::new(act), Rc::new(neg))
}

fn bounds(gmin: f64) -> ConductanceBounds {
    ConductanceBounds {
        gmin,
        gmax: 10.0,
        pgmin: 1e-7,
    }
}

fn inputs() -> Array2<f64> {
    array![[0.1, 0.9], [0.7, 0.3], [0.5, 0.5], [0.0, 1.0]]
}

/// Sum of layer outputs for the given raw conductances.
fn output_sum(theta: &Array2<f64>, gmin: f64) -> f64 {
    let (act, neg) = circuits();
    let layer = CircuitLayer::from_theta(0, theta.clone(), act, neg, bounds(gmin)).expect("layer");
    let mut tape = Tape::detached();
    let x = tape.constant(inputs());
    let pass = layer.forward(&mut tape, x).expect("forward");
    let total = tape.sum(pass.output);
    tape.scalar(total)
}

#[test]
fn test_subthreshold_weight_has_zero_forward_contribution() {
    let (act, neg) = circuits();
    let snapped = array![[0.004, 0.8], [-0.6, 0.3], [0.5, -0.2], [1.0, 1.0]];
    let mut zeroed = snapped.clone();
    zeroed[[0, 0]] = 0.0;

    let a = CircuitLayer::from_theta(0, snapped, act.clone(), neg.clone(), bounds(0.01)).expect("layer");
    let b = CircuitLayer::from_theta(0, zeroed, act, neg, bounds(0.0)).expect("layer");

    let mut tape = Tape::detached();
    let x = tape.constant(inputs());
    let pa = a.forward(&mut tape, x).expect("forward");
    let pb = b.forward(&mut tape, x).expect("forward");
    assert_eq!(tape.value(pa.output), tape.value(pb.output));
    assert_eq!(tape.value(pa.theta)[[0, 0]], 0.0);
}

#[test]
fn test_subthreshold_weight_keeps_unclamped_gradient() {
    let (act, neg) = circuits();
    let raw = array![[0.004, 0.8], [-0.6, 0.3], [0.5, -0.2], [1.0, 1.0]];
    let layer = CircuitLayer::from_theta(0, raw.clone(), act, neg, bounds(0.01)).expect("layer");

    let mut tape = Tape::new();
    let x = tape.constant(inputs());
    let pass = layer.forward(&mut tape, x).expect("forward");
    let total = tape.sum(pass.output);
    let grads = tape.backward(total).expect("backward");
    let g = grads.get(layer.theta()).expect("theta gradient").clone();

    // Without snapping the same forward value is produced by a raw zero;
    // zero routes like a non-negative weight, so differentiate from the right.
    let mut effective = raw.clone();
    effective[[0, 0]] = 0.0;
    let h = 1e-6;
    let mut shifted = effective.clone();
    shifted[[0, 0]] += h;
    let numeric = (output_sum(&shifted, 0.0) - output_sum(&effective, 0.0)) / h;
    assert!(numeric.abs() > 1e-8, "sub-threshold weight should still matter: {numeric}");
    assert_abs_diff_eq!(g[[0, 0]], numeric, epsilon = 1e-4);

    // Regular weights match a central difference.
    for (i, j) in [(1, 0), (2, 1), (0, 1)] {
        let mut plus = effective.clone();
        plus[[i, j]] += h;
        let mut minus = effective.clone();
        minus[[i, j]] -= h;
        let numeric = (output_sum(&plus, 0.0) - output_sum(&minus, 0.0)) / (2.0 * h);
        assert_abs_diff_eq!(g[[i, j]], numeric, epsilon = 1e-5);
    }
}

#[test]
fn test_non_negative_layer_bypasses_negation() {
    let (act, neg) = circuits();
    let theta = array![[0.3, 0.05], [0.2, 0.9], [0.4, 0.1], [1.0, 2.0]];
    let layer = CircuitLayer::from_theta(0, theta.clone(), act.clone(), neg, bounds(0.01)).expect("layer");

    let mut tape = Tape::detached();
    let x = tape.constant(inputs());
    let pass = layer.forward(&mut tape, x).expect("forward");

    // Direct crossbar without any negated inputs.
    let n = inputs().nrows();
    let mut extended = Array2::zeros((n, 4));
    extended.slice_mut(s![.., ..2]).assign(&inputs());
    extended.column_mut(2).fill(1.0);
    let w = &theta / &(theta.sum_axis(ndarray::Axis(0)).insert_axis(ndarray::Axis(0)) + 1e-10);
    let expected = act.transfer(&extended.dot(&w)).expect("transfer");

    for (a, b) in tape.value(pass.output).iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn test_negative_weight_routes_through_negation() {
    let (act, neg) = circuits();
    let positive = array![[0.3, 0.05], [0.2, 0.9], [0.4, 0.1], [1.0, 2.0]];
    let mut negative = positive.clone();
    negative[[0, 0]] = -0.3;

    let a = CircuitLayer::from_theta(0, positive, act.clone(), neg.clone(), bounds(0.01)).expect("layer");
    let b = CircuitLayer::from_theta(0, negative, act, neg, bounds(0.01)).expect("layer");
    let mut tape = Tape::detached();
    let x = tape.constant(inputs());
    let pa = a.forward(&mut tape, x).expect("forward");
    let pb = b.forward(&mut tape, x).expect("forward");

    // Same magnitudes, so only column 0 changes.
    let (oa, ob) = (tape.value(pa.output), tape.value(pb.output));
    assert_eq!(oa.column(1), ob.column(1));
    assert!(oa.column(0).iter().zip(ob.column(0).iter()).any(|(p, q)| (p - q).abs() > 1e-6));
}

#[test]
fn test_equally_indexed_layers_keep_their_own_conductances() {
    let (act, neg) = circuits();
    let a = CircuitLayer::from_theta(
        0,
        array![[0.3, 0.05], [0.2, 0.9], [0.4, 0.1], [1.0, 2.0]],
        act.clone(),
        neg.clone(),
        bounds(0.01),
    )
    .expect("layer");
    let b = CircuitLayer::from_theta(
        0,
        array![[-0.7, 0.02], [0.5, -1.5], [0.1, 0.6], [3.0, 0.2]],
        act,
        neg,
        bounds(0.01),
    )
    .expect("layer");

    let mut alone = Tape::new();
    let x = alone.constant(inputs());
    let pb = b.forward(&mut alone, x).expect("forward");
    let mac_alone = alone.scalar(pb.mac_power);
    let grads_alone = alone.backward(pb.mac_power).expect("backward");

    let mut shared = Tape::new();
    let x = shared.constant(inputs());
    let pa = a.forward(&mut shared, x).expect("forward");
    let pb = b.forward(&mut shared, x).expect("forward");
    assert_eq!(shared.scalar(pb.mac_power), mac_alone);
    assert_ne!(shared.scalar(pa.mac_power), mac_alone);

    let grads = shared.backward(pb.mac_power).expect("backward");
    assert_eq!(grads.get(b.theta()), grads_alone.get(b.theta()));
    assert!(grads
        .get(a.theta())
        .map_or(true, |g| g.iter().all(|&v| v == 0.0)));
}

#[test]
fn test_soft_counts_forward_values_are_exact() {
    let (act, neg) = circuits();
    let theta = array![
        [0.004, 0.8, -0.3],
        [-0.6, 0.0, 0.002],
        [0.5, -0.2, 0.0],
        [1.0, 1.0, 1.0]
    ];
    let layer = CircuitLayer::from_theta(0, theta, act, neg, bounds(0.01)).expect("layer");
    let hard = layer.hard_theta();
    let nonzero = hard.iter().filter(|&&v| v != 0.0).count();

    let mut tape = Tape::new();
    let x = tape.constant(array![[0.2, 0.8]]);
    let pass = layer.forward(&mut tape, x).expect("forward");
    let counts = layer.soft_counts(&mut tape, pass.theta).expect("counts");

    assert_eq!(tape.scalar(counts.weights), nonzero as f64);
    // Input rows: [0, .8, -.3] and [-.6, 0, 0]; all three columns keep a live input.
    assert_eq!(tape.scalar(counts.activations), 3.0);
    // Both input rows contain a negative conductance.
    assert_eq!(tape.scalar(counts.negations), 2.0);

    let grads = tape.backward(counts.weights).expect("backward");
    let g = grads.get(layer.theta()).expect("soft count gradient");
    assert!(g.iter().any(|&v| v != 0.0));
}

#[test]
fn test_pruning_is_idempotent_and_fractions_bounded() {
    let (act, neg) = circuits();
    let theta = array![
        [0.004, 0.8, 0.003],
        [0.6, 0.0, 0.002],
        [0.5, -0.2, 0.3],
        [1.0, 1.0, 1.0]
    ];
    let mut layer = CircuitLayer::from_theta(0, theta, act, neg, bounds(0.01)).expect("layer");
    let first = layer.prune();
    let second = layer.prune();
    assert_eq!(first, second);
    assert_eq!(
        first,
        PruningCounts {
            // four snapped crosspoints plus the rest of the dead third column
            pruned_weights: 6,
            total_weights: 12,
            pruned_activations: 1,
            total_activations: 3,
            pruned_negations: 2,
            total_negations: 4,
        }
    );
    assert!(layer.is_pruned());

    let mut network = Network::from_config(&[3, 4, 2], &Config::default()).expect("network");
    network.layers()[0].theta().update(|t| t.slice_mut(s![0, ..]).fill(0.001));
    let report = network.prune();
    for fraction in [report.weight_fraction, report.activation_fraction, report.negation_fraction] {
        assert!((0.0..=1.0).contains(&fraction));
    }
    assert!(report.counts.pruned_weights >= 4);
    assert_eq!(network.prune(), report);
    assert_eq!(network.pruning_report(), report);
}

#[test]
fn test_pruned_counts_are_constants() {
    let (act, neg) = circuits();
    let theta = array![[0.4, -0.8], [0.6, 0.2], [0.5, -0.2], [1.0, 1.0]];
    let mut layer = CircuitLayer::from_theta(0, theta, act, neg, bounds(0.01)).expect("layer");
    layer.prune();

    let mut tape = Tape::new();
    let x = tape.constant(array![[0.2, 0.8]]);
    let pass = layer.forward(&mut tape, x).expect("forward");
    let counts = layer.soft_counts(&mut tape, pass.theta).expect("counts");
    assert_eq!(tape.scalar(counts.weights), 8.0);
    let w = tape.add(counts.weights, counts.activations);
    let total = tape.add(w, counts.negations);
    let grads = tape.backward(total).expect("backward");
    assert!(grads
        .get(layer.theta())
        .map_or(true, |g| g.iter().all(|&v| v == 0.0)));
}

#[test]
fn test_pruned_negation_forces_non_negative_rows() {
    let (act, neg) = circuits();
    let theta = array![[0.4, 0.8], [0.6, 0.2], [0.5, -0.2], [1.0, 1.0]];
    let mut layer = CircuitLayer::from_theta(0, theta, act, neg, bounds(0.01)).expect("layer");
    layer.prune();
    assert_eq!(layer.negation_mask().column(0).to_vec(), vec![0.0, 0.0, 1.0, 1.0]);

    // Training pushes a weight of a negation-free row below zero.
    layer.theta().update(|t| t[[0, 0]] = -0.5);
    let mut tape = Tape::detached();
    let effective = layer.effective_theta(&mut tape).expect("theta");
    assert_eq!(tape.value(effective)[[0, 0]], 0.0);
    assert_eq!(tape.value(effective)[[2, 1]], -0.2);
}

#[test]
fn test_layers_observe_shared_circuit_updates() {
    let network = Network::from_config(&[2, 3, 2], &Config::default()).expect("network");
    let first = &network.layers()[0];
    let second = &network.layers()[1];
    assert!(Rc::ptr_eq(first.activation(), second.activation()));
    assert!(Rc::ptr_eq(first.negation(), second.negation()));

    let before = network.predict(&inputs()).expect("predict");
    let eta_before = second.activation().coefficient_values().expect("coefficients");
    network.activation().design().update(|d| d.mapv_inplace(|v| v + 2.0));
    let eta_after = second.activation().coefficient_values().expect("coefficients");
    let after = network.predict(&inputs()).expect("predict");

    assert_ne!(eta_before, eta_after);
    assert_eq!(
        first.activation().coefficient_values().expect("coefficients"),
        eta_after
    );
    assert_ne!(before, after);
}

#[test]
fn test_mac_power_is_non_negative() {
    let network = Network::from_config(&[2, 4, 2], &Config::default()).expect("network");
    network.layers()[0].theta().update(|t| {
        t[[0, 1]] = -2.0;
        t[[1, 3]] = -0.5;
    });
    let mut tape = Tape::detached();
    let pass = network.forward(&mut tape, &inputs()).expect("forward");
    for layer in &pass.layers {
        assert!(tape.scalar(layer.mac_power) >= 0.0);
    }
}
