// Tests for backward propagation: gradient routing, weight-gradient accumulation and the
// agreement between the batched and single-sample conventions.

use approx::assert_relative_eq;
use rust_convnet::layers::{
    ActivationLayer, AvgPoolLayer, ConvBatchLayer, ConvLayer, FullyConnectedLayer, Layer,
    MaxPoolLayer, SampleLayer,
};
use rust_convnet::optimizers::{Optimizer, UpdateRule};
use rust_convnet::tensor::{Shape, Volume};
use rust_convnet::utils::{Activation, EngineRng};

fn random_volume(shape: Shape, rng: &mut EngineRng) -> Volume {
    let mut v = Volume::zeros(shape);
    v.randomize(rng, 0.0, 1.0);
    v
}

// ============================================================================
// Pooling
// ============================================================================

fn pool_input() -> Volume {
    Volume::from_planes(
        4,
        4,
        &[vec![
            1.0, 9.0, 2.0, 3.0, //
            4.0, 5.0, 8.0, 6.0, //
            7.0, 0.0, 9.0, 1.0, //
            2.0, 7.0, 4.0, 9.0,
        ]],
    )
    .unwrap()
}

#[test]
fn test_maxpool_backward_reference_scenario() {
    let mut layer = MaxPoolLayer::new(Shape::new(4, 4, 1), 2).unwrap();
    let x = vec![pool_input()];
    layer.forward(&x);
    let g = Volume::from_planes(2, 2, &[vec![1.2, 1.9, 0.9, 0.3]]).unwrap();
    layer.backward(&[g], &x, true);

    // Ties resolve to the last maximum in row-major order: (3, 1) and (3, 3)
    let expected = vec![
        0.0, 1.2, 0.0, 0.0, //
        0.0, 0.0, 1.9, 0.0, //
        0.0, 0.0, 0.0, 0.0, //
        0.0, 0.9, 0.0, 0.3,
    ];
    assert_eq!(layer.input_gradient()[0].plane(0), expected);
}

#[test]
fn test_maxpool_sample_convention_matches() {
    let mut layer = MaxPoolLayer::new(Shape::new(4, 4, 1), 2).unwrap();
    layer.forward_sample(&pool_input());
    let mut g = Volume::from_planes(2, 2, &[vec![1.2, 1.9, 0.9, 0.3]]).unwrap();
    layer.backward_sample(&mut g);
    assert_eq!(g.shape(), Shape::new(4, 4, 1));
    assert_eq!(g.sum(), 1.2 + 1.9 + 0.9 + 0.3);
    assert_eq!(g.get(3, 1, 0), 0.9);
    assert_eq!(layer.propagated_gradient().plane(0), vec![1.2, 1.9, 0.9, 0.3]);
}

#[test]
fn test_avgpool_backward_spreads_evenly() {
    let mut layer = AvgPoolLayer::new(Shape::new(4, 4, 1), 2).unwrap();
    let x = vec![pool_input()];
    layer.forward(&x);
    let g = Volume::from_planes(2, 2, &[vec![4.0, 8.0, -4.0, 2.0]]).unwrap();
    layer.backward(&[g], &x, true);
    let dx = &layer.input_gradient()[0];
    assert_relative_eq!(dx.get(0, 0, 0), 1.0);
    assert_relative_eq!(dx.get(1, 1, 0), 1.0);
    assert_relative_eq!(dx.get(0, 3, 0), 2.0);
    assert_relative_eq!(dx.get(3, 0, 0), -1.0);
    assert_relative_eq!(dx.get(2, 2, 0), 0.5);
}

// ============================================================================
// Fully Connected
// ============================================================================

#[test]
fn test_fc_backward_known_values() {
    // y = W x + b with identity activation; dL/dy = g
    let mut rng = EngineRng::new(0);
    let mut layer =
        FullyConnectedLayer::new(Shape::flat(2), 2, Activation::Identity, &mut rng).unwrap();
    let w = [[1.0, 2.0], [3.0, 4.0]];
    for n in 0..2 {
        for k in 0..2 {
            layer.weights_mut().set(n, k, 0, w[n][k]);
        }
    }
    let x = vec![Volume::from_slice(&[0.5, -1.0])];
    layer.forward(&x);
    let g = vec![Volume::from_slice(&[1.0, 2.0])];
    layer.backward(&g, &x, true);

    // dx = W^T g
    assert_eq!(layer.input_gradient()[0].data(), &[7.0, 10.0]);
    // dW[n][k] = g[n] * x[k], then biases
    let expected = [0.5, -1.0, 1.0, -2.0, 1.0, 2.0];
    for (i, &want) in expected.iter().enumerate() {
        assert_relative_eq!(layer.gradient(i), want);
    }
}

#[test]
fn test_fc_gradient_is_batch_average() {
    let mut rng = EngineRng::new(0);
    let mut layer =
        FullyConnectedLayer::new(Shape::flat(1), 1, Activation::Identity, &mut rng).unwrap();
    let x = vec![Volume::from_slice(&[1.0]), Volume::from_slice(&[3.0])];
    layer.forward(&x);
    let g = vec![Volume::from_slice(&[1.0]), Volume::from_slice(&[1.0])];
    layer.backward(&g, &x, false);
    assert_relative_eq!(layer.gradient(0), 2.0);
    assert_relative_eq!(layer.gradient(1), 1.0);
    assert!(layer.input_gradient().is_empty());
}

#[test]
fn test_fc_sample_and_batched_gradients_agree() {
    let mut rng = EngineRng::new(8);
    let mut batched =
        FullyConnectedLayer::new(Shape::flat(4), 3, Activation::Sigmoid, &mut rng).unwrap();
    let mut rng = EngineRng::new(8);
    let mut single =
        FullyConnectedLayer::new(Shape::flat(4), 3, Activation::Sigmoid, &mut rng).unwrap();

    let mut data_rng = EngineRng::new(9);
    let x = random_volume(Shape::flat(4), &mut data_rng);
    let g = random_volume(Shape::flat(3), &mut data_rng);

    batched.forward(std::slice::from_ref(&x));
    batched.backward(std::slice::from_ref(&g), std::slice::from_ref(&x), true);

    single.forward_sample(&x);
    let mut buffer = g.clone();
    single.backward_sample(&mut buffer);

    for (a, b) in buffer.data().iter().zip(batched.input_gradient()[0].data()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-12);
    }
    for i in 0..batched.trainable_params() {
        assert_relative_eq!(batched.gradient(i), single.gradient(i), epsilon = 1e-12);
    }
}

// ============================================================================
// Convolution
// ============================================================================

// Input gradient of a linear layer is the transpose of its Jacobian: check it against
// finite differences of <g, y(x)>.
#[test]
fn test_conv_batch_input_gradient_matches_finite_difference() {
    let mut rng = EngineRng::new(21);
    let shape = Shape::new(5, 5, 2);
    let mut layer = ConvBatchLayer::new(shape, 3, 3, 2, 1, &mut rng).unwrap();
    let x = random_volume(shape, &mut rng);
    let g = random_volume(layer.output_shape(), &mut rng);

    layer.forward(std::slice::from_ref(&x));
    layer.backward(std::slice::from_ref(&g), std::slice::from_ref(&x), true);
    let dx = layer.input_gradient()[0].clone();

    let objective = |v: &Volume| -> f64 {
        let y = layer.forward_output(std::slice::from_ref(v));
        y[0].data().iter().zip(g.data()).map(|(a, b)| a * b).sum()
    };
    let eps = 1e-6;
    for idx in 0..x.len() {
        let mut plus = x.clone();
        plus[idx] += eps;
        let mut minus = x.clone();
        minus[idx] -= eps;
        let numeric = (objective(&plus) - objective(&minus)) / (2.0 * eps);
        assert_relative_eq!(dx[idx], numeric, epsilon = 1e-7);
    }
}

#[test]
fn test_conv_bias_gradient_is_spatial_sum() {
    let mut rng = EngineRng::new(2);
    let shape = Shape::new(4, 4, 1);
    let mut layer = ConvBatchLayer::new(shape, 2, 3, 1, 1, &mut rng).unwrap();
    let x = vec![random_volume(shape, &mut rng)];
    layer.forward(&x);
    let g = random_volume(layer.output_shape(), &mut rng);
    layer.backward(std::slice::from_ref(&g), &x, false);

    let weights = 2 * 3 * 3;
    assert_relative_eq!(layer.gradient(weights), g.plane(0).iter().sum::<f64>(), epsilon = 1e-12);
    assert_relative_eq!(
        layer.gradient(weights + 1),
        g.plane(1).iter().sum::<f64>(),
        epsilon = 1e-12
    );
}

#[test]
fn test_fused_relu_conv_zeroes_clipped_gradient() {
    let mut rng = EngineRng::new(6);
    let shape = Shape::new(4, 4, 1);
    let mut layer = ConvLayer::new(shape, 2, 3, 1, 1, &mut rng).unwrap();
    let x = random_volume(shape, &mut rng);
    layer.forward_sample(&x);
    let y = layer.sample_output().clone();
    let derivative = layer.local_derivative().clone();
    for (v, d) in y.data().iter().zip(derivative.data()) {
        assert_eq!(*d, if *v > 0.0 { 1.0 } else { 0.0 });
    }

    let mut g = Volume::filled(layer.output_shape(), 1.0);
    layer.backward_sample(&mut g);
    assert_eq!(layer.propagated_gradient(), &derivative);
    assert_eq!(g.shape(), shape);
}

// ============================================================================
// Activations and weight updates
// ============================================================================

#[test]
fn test_activation_layers_have_no_parameters() {
    let layer = ActivationLayer::new(Shape::flat(4), Activation::Tanh).unwrap();
    assert_eq!(layer.trainable_params(), 0);
}

#[test]
#[should_panic(expected = "no trainable parameter")]
fn test_activation_layer_param_access_panics() {
    let layer = ActivationLayer::new(Shape::flat(4), Activation::Tanh).unwrap();
    layer.param(0);
}

#[test]
fn test_update_applies_batch_average_and_clears() {
    let mut rng = EngineRng::new(0);
    let mut layer =
        FullyConnectedLayer::new(Shape::flat(1), 1, Activation::Identity, &mut rng).unwrap();
    layer.set_param(0, 1.0);
    let x = vec![Volume::from_slice(&[1.0]), Volume::from_slice(&[3.0])];
    layer.forward(&x);
    layer.backward(
        &[Volume::from_slice(&[1.0]), Volume::from_slice(&[1.0])],
        &x,
        false,
    );
    layer.update_weights(&Optimizer::new(UpdateRule::Sgd, 0.1));
    // mean gradient 2.0
    assert_relative_eq!(layer.param(0), 0.8);
    assert_relative_eq!(layer.param(1), -0.1);
    assert_eq!(layer.gradient(0), 0.0);

    // No accumulated samples: update is a no-op
    layer.update_weights(&Optimizer::new(UpdateRule::Sgd, 0.1));
    assert_relative_eq!(layer.param(0), 0.8);
}
