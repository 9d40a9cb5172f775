// Tests for activation layers: element-wise derivatives, the coupled softmax Jacobian, and
// how activation selection is parsed.

use approx::assert_relative_eq;
use rust_convnet::layers::{ActivationLayer, Layer, SampleLayer};
use rust_convnet::tensor::{Shape, Volume};
use rust_convnet::utils::{Activation, EngineRng};
use rust_convnet::Error;

const ELEMENTWISE: [&str; 8] = [
    "identity", "relu", "leaky_relu", "sigmoid", "tanh", "elu", "softplus", "swish",
];

fn probe() -> Volume {
    Volume::from_slice(&[-2.0, -0.7, -0.1, 0.3, 1.1, 2.5])
}

// ============================================================================
// Element-wise
// ============================================================================

#[test]
fn test_elementwise_backward_matches_finite_difference() {
    let x = probe();
    let eps = 1e-6;
    for name in ELEMENTWISE {
        let act = Activation::from_name(name, None).unwrap();
        let mut layer = ActivationLayer::new(x.shape(), act).unwrap();
        let batch = vec![x.clone()];
        layer.forward(&batch);
        layer.backward(&[Volume::filled(x.shape(), 1.0)], &batch, true);
        let dx = &layer.input_gradient()[0];
        for k in 0..x.len() {
            let numeric = (act.apply(x[k] + eps) - act.apply(x[k] - eps)) / (2.0 * eps);
            assert_relative_eq!(dx[k], numeric, epsilon = 1e-6);
        }
    }
}

#[test]
fn test_sample_local_derivative() {
    let mut layer = ActivationLayer::new(Shape::flat(6), Activation::Sigmoid).unwrap();
    layer.forward_sample(&probe());
    let y = layer.sample_output().clone();
    for (d, v) in layer.local_derivative().data().iter().zip(y.data()) {
        assert_relative_eq!(*d, v * (1.0 - v), epsilon = 1e-15);
    }

    let mut g = Volume::filled(Shape::flat(6), 2.0);
    layer.backward_sample(&mut g);
    for (gv, d) in g.data().iter().zip(layer.local_derivative().data()) {
        assert_relative_eq!(*gv, 2.0 * d, epsilon = 1e-15);
    }
    assert_eq!(layer.propagated_gradient(), &g);
}

#[test]
fn test_alpha_variants() {
    let leaky = Activation::from_name("leaky_relu", Some(0.2)).unwrap();
    assert_relative_eq!(leaky.apply(-3.0), -0.6);
    assert_relative_eq!(leaky.apply(3.0), 3.0);
    assert_eq!(Activation::from_name("leaky_relu", None).unwrap().alpha(), 0.01);

    let elu = Activation::from_name("elu", Some(2.0)).unwrap();
    assert_relative_eq!(elu.apply(-1.0), 2.0 * ((-1.0f64).exp() - 1.0));
    assert_eq!(Activation::from_name("elu", None).unwrap().alpha(), 1.0);
}

#[test]
fn test_relu_clips_negative_gradients() {
    let mut layer = ActivationLayer::new(Shape::flat(6), Activation::ReLU).unwrap();
    layer.forward_sample(&probe());
    assert_eq!(layer.local_derivative().data(), &[0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    assert_eq!(layer.sample_output().data(), &[0.0, 0.0, 0.0, 0.3, 1.1, 2.5]);
}

// ============================================================================
// Softmax
// ============================================================================

#[test]
fn test_softmax_normalizes_whole_volume() {
    let layer = ActivationLayer::new(Shape::new(2, 2, 2), Activation::Softmax).unwrap();
    let mut rng = EngineRng::new(3);
    let mut x = Volume::new(2, 2, 2);
    x.randomize(&mut rng, 0.0, 2.0);
    let y = &layer.forward_output(std::slice::from_ref(&x))[0];
    assert_relative_eq!(y.sum(), 1.0, epsilon = 1e-12);
    assert!(y.data().iter().all(|&v| v > 0.0));
    assert_eq!(y.argmax(), x.argmax());
}

#[test]
fn test_softmax_is_stable_for_large_inputs() {
    let layer = ActivationLayer::new(Shape::flat(3), Activation::Softmax).unwrap();
    let y = &layer.forward_output(&[Volume::from_slice(&[1000.0, 1001.0, 999.0])])[0];
    assert!(y.data().iter().all(|v| v.is_finite()));
    assert_relative_eq!(y.sum(), 1.0, epsilon = 1e-12);
    assert!(y[1] > y[0] && y[0] > y[2]);
}

#[test]
fn test_softmax_backward_uses_full_jacobian() {
    let x = Volume::from_slice(&[0.2, -0.4, 1.3, 0.0]);
    let g = Volume::from_slice(&[0.5, -1.0, 0.25, 2.0]);
    let mut layer = ActivationLayer::new(x.shape(), Activation::Softmax).unwrap();

    let objective = |v: &Volume| -> f64 {
        let y = &layer.forward_output(std::slice::from_ref(v))[0];
        y.data().iter().zip(g.data()).map(|(a, b)| a * b).sum()
    };
    let eps = 1e-6;
    let numeric: Vec<f64> = (0..x.len())
        .map(|k| {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus[k] += eps;
            minus[k] -= eps;
            (objective(&plus) - objective(&minus)) / (2.0 * eps)
        })
        .collect();

    let batch = vec![x.clone()];
    layer.forward(&batch);
    layer.backward(std::slice::from_ref(&g), &batch, true);
    for (a, n) in layer.input_gradient()[0].data().iter().zip(&numeric) {
        assert_relative_eq!(*a, *n, epsilon = 1e-8);
    }

    // The single-sample convention routes through the same Jacobian
    layer.forward_sample(&x);
    let mut buffer = g.clone();
    layer.backward_sample(&mut buffer);
    for (a, n) in buffer.data().iter().zip(&numeric) {
        assert_relative_eq!(*a, *n, epsilon = 1e-8);
    }
}

// ============================================================================
// Selection
// ============================================================================

#[test]
fn test_unknown_activation() {
    assert!(matches!(
        Activation::from_name("gelu", None),
        Err(Error::UnknownLayer(_))
    ));
}

#[test]
fn test_names_round_trip() {
    for name in ELEMENTWISE.iter().chain(["softmax"].iter()) {
        let act = Activation::from_name(name, None).unwrap();
        assert_eq!(act.name(), *name);
        assert_eq!(act.to_string(), *name);
    }
}
