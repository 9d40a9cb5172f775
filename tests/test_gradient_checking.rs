// Finite-difference gradient checks over whole networks.
//
// Every network here uses smooth nonlinearities only, so a central difference with a small
// step agrees with the analytic gradient up to rounding.

use rust_convnet::config::Params;
use rust_convnet::layers::{Chain, CompositeLayer, Layer, Merge};
use rust_convnet::loss::Loss;
use rust_convnet::network::Network;
use rust_convnet::tensor::{Shape, Volume};
use rust_convnet::utils::EngineRng;
use rust_convnet::Error;

const EPSILON: f64 = 1e-5;
const TOLERANCE: f64 = 1e-7;

fn batch(shape: Shape, count: usize, seed: u64) -> Vec<Volume> {
    let mut rng = EngineRng::new(seed);
    (0..count)
        .map(|_| {
            let mut v = Volume::zeros(shape);
            v.randomize(&mut rng, 0.0, 1.0);
            v
        })
        .collect()
}

fn one_hot_targets(classes: usize, count: usize) -> Vec<Volume> {
    (0..count)
        .map(|i| {
            let mut t = Volume::zeros(Shape::flat(classes));
            t[i % classes] = 1.0;
            t
        })
        .collect()
}

fn add(net: &mut Network, kind: &str, pairs: &[(&str, &str)]) {
    net.add_from_params(kind, &Params::from_pairs(pairs.iter().copied()))
        .unwrap();
}

fn check(net: &mut Network, inputs: &[Volume], targets: &[Volume]) {
    let report = net
        .gradient_check(inputs, targets, EPSILON, TOLERANCE)
        .unwrap();
    assert_eq!(report.checked, net.trainable_params());
    assert!(report.max_difference <= TOLERANCE);
}

// ============================================================================
// Plain chains
// ============================================================================

#[test]
fn test_mlp_with_smooth_activations() {
    let mut net = Network::new(Shape::flat(5), 1).unwrap();
    add(&mut net, "fc", &[("neurons", "6"), ("activation", "tanh")]);
    add(&mut net, "fc", &[("neurons", "4"), ("activation", "sigmoid")]);
    add(&mut net, "fc", &[("neurons", "3")]);
    let inputs = batch(Shape::flat(5), 4, 2);
    let targets = batch(Shape::flat(3), 4, 3);
    check(&mut net, &inputs, &targets);
}

#[test]
fn test_separate_activation_layers() {
    let mut net = Network::new(Shape::flat(4), 2).unwrap();
    add(&mut net, "fc", &[("neurons", "5")]);
    add(&mut net, "elu", &[]);
    add(&mut net, "fc", &[("neurons", "5")]);
    add(&mut net, "softplus", &[]);
    add(&mut net, "fc", &[("neurons", "2")]);
    add(&mut net, "swish", &[]);
    let inputs = batch(Shape::flat(4), 3, 4);
    let targets = batch(Shape::flat(2), 3, 5);
    check(&mut net, &inputs, &targets);
}

#[test]
fn test_softmax_with_cross_entropy() {
    let mut net = Network::new(Shape::flat(4), 3).unwrap();
    add(&mut net, "fc", &[("neurons", "6"), ("activation", "tanh")]);
    add(&mut net, "fc", &[("neurons", "3")]);
    add(&mut net, "softmax", &[]);
    net.set_loss(Loss::CrossEntropy);
    let inputs = batch(Shape::flat(4), 5, 6);
    let targets = one_hot_targets(3, 5);
    check(&mut net, &inputs, &targets);
}

#[test]
fn test_sigmoid_with_binary_cross_entropy() {
    let mut net = Network::new(Shape::flat(3), 4).unwrap();
    add(&mut net, "fc", &[("neurons", "4"), ("activation", "tanh")]);
    add(&mut net, "fc", &[("neurons", "2"), ("activation", "sigmoid")]);
    net.set_loss(Loss::BinaryCrossEntropy);
    let inputs = batch(Shape::flat(3), 4, 7);
    let targets = vec![
        Volume::from_slice(&[1.0, 0.0]),
        Volume::from_slice(&[0.0, 1.0]),
        Volume::from_slice(&[1.0, 1.0]),
        Volume::from_slice(&[0.0, 0.0]),
    ];
    check(&mut net, &inputs, &targets);
}

#[test]
fn test_convolution_and_average_pooling() {
    let input = Shape::new(6, 6, 2);
    let mut net = Network::new(input, 5).unwrap();
    add(
        &mut net,
        "conv_batch",
        &[("filters", "3"), ("size", "3"), ("padding", "1")],
    );
    add(&mut net, "tanh", &[]);
    add(&mut net, "avgpool", &[("scale", "2")]);
    add(
        &mut net,
        "conv_batch",
        &[("filters", "2"), ("size", "3"), ("stride", "2"), ("padding", "1")],
    );
    add(&mut net, "fc", &[("neurons", "2")]);
    let inputs = batch(input, 3, 8);
    let targets = batch(Shape::flat(2), 3, 9);
    check(&mut net, &inputs, &targets);
}

#[test]
fn test_upsample_and_reshape() {
    let input = Shape::new(2, 2, 2);
    let mut net = Network::new(input, 6).unwrap();
    add(&mut net, "upsample", &[("scale", "2")]);
    add(&mut net, "conv_batch", &[("filters", "1"), ("size", "3")]);
    add(
        &mut net,
        "reshape",
        &[("width", "1"), ("height", "1"), ("depth", "4")],
    );
    add(&mut net, "sigmoid", &[]);
    let inputs = batch(input, 2, 10);
    let targets = batch(Shape::flat(4), 2, 11);
    check(&mut net, &inputs, &targets);
}

#[test]
fn test_batch_normalization_layers() {
    let input = Shape::new(4, 4, 2);
    let mut net = Network::new(input, 7).unwrap();
    add(&mut net, "conv_batch", &[("filters", "3"), ("size", "3")]);
    add(&mut net, "batchnorm2d", &[]);
    add(&mut net, "tanh", &[]);
    add(&mut net, "fc", &[("neurons", "4")]);
    add(&mut net, "batchnorm", &[]);
    add(&mut net, "fc", &[("neurons", "2")]);
    let inputs = batch(input, 6, 12);
    let targets = batch(Shape::flat(2), 6, 13);
    check(&mut net, &inputs, &targets);
}

// ============================================================================
// Composites
// ============================================================================

fn branch(input: Shape, kinds: &[(&str, &[(&str, &str)])], rng: &mut EngineRng) -> Chain {
    let mut chain = Chain::new(input);
    for (kind, pairs) in kinds {
        let params = Params::from_pairs(pairs.iter().copied());
        let layer =
            rust_convnet::layers::create_layer(kind, chain.output_shape(), &params, rng).unwrap();
        chain.push(layer).unwrap();
    }
    chain
}

#[test]
fn test_inception_with_identity_branch() {
    let input = Shape::new(4, 4, 2);
    let mut net = Network::new(input, 8).unwrap();
    let rng = net.rng_mut();
    let branches = vec![
        branch(input, &[("conv_batch", &[("filters", "2"), ("size", "1")])], rng),
        branch(
            input,
            &[
                ("conv_batch", &[("filters", "1"), ("size", "3"), ("padding", "1")]),
                ("tanh", &[]),
            ],
            rng,
        ),
        Chain::new(input),
    ];
    let inception = CompositeLayer::inception(input, branches).unwrap();
    assert_eq!(inception.output_shape(), Shape::new(4, 4, 5));
    net.add_layer(Box::new(inception)).unwrap();
    add(&mut net, "fc", &[("neurons", "3")]);

    let inputs = batch(input, 3, 14);
    let targets = batch(Shape::flat(3), 3, 15);
    check(&mut net, &inputs, &targets);
}

#[test]
fn test_sum_block() {
    let input = Shape::flat(4);
    let mut net = Network::new(input, 9).unwrap();
    let rng = net.rng_mut();
    let branches = vec![
        branch(input, &[("fc", &[("neurons", "3"), ("activation", "tanh")])], rng),
        branch(input, &[("fc", &[("neurons", "3"), ("activation", "sigmoid")])], rng),
    ];
    let block = CompositeLayer::block(input, branches, Merge::Sum).unwrap();
    net.add_layer(Box::new(block)).unwrap();
    add(&mut net, "fc", &[("neurons", "2")]);

    let inputs = batch(input, 4, 16);
    let targets = batch(Shape::flat(2), 4, 17);
    check(&mut net, &inputs, &targets);
}

#[test]
fn test_residual_identity_and_projection() {
    let input = Shape::new(4, 4, 2);
    let mut net = Network::new(input, 10).unwrap();

    let same = {
        let rng = net.rng_mut();
        let main = branch(
            input,
            &[
                ("conv_batch", &[("filters", "2"), ("size", "3"), ("padding", "1")]),
                ("tanh", &[]),
            ],
            rng,
        );
        CompositeLayer::residual(input, main, rng).unwrap()
    };
    assert_eq!(same.shortcut().len(), 0);
    net.add_layer(Box::new(same)).unwrap();

    let projected = {
        let rng = net.rng_mut();
        let main = branch(
            input,
            &[(
                "conv_batch",
                &[("filters", "3"), ("size", "3"), ("stride", "2"), ("padding", "1")],
            )],
            rng,
        );
        CompositeLayer::residual(input, main, rng).unwrap()
    };
    assert_eq!(projected.shortcut().len(), 1);
    assert_eq!(projected.output_shape(), Shape::new(2, 2, 3));
    net.add_layer(Box::new(projected)).unwrap();
    add(&mut net, "fc", &[("neurons", "2")]);

    let inputs = batch(input, 3, 18);
    let targets = batch(Shape::flat(2), 3, 19);
    check(&mut net, &inputs, &targets);
}

// ============================================================================
// Failure reporting
// ============================================================================

#[test]
fn test_mismatch_is_reported_with_location() {
    let mut net = Network::new(Shape::flat(3), 11).unwrap();
    add(&mut net, "fc", &[("neurons", "2"), ("activation", "tanh")]);
    let inputs = batch(Shape::flat(3), 2, 20);
    let targets = batch(Shape::flat(2), 2, 21);

    // A step this coarse makes the central difference visibly wrong
    let err = net.gradient_check(&inputs, &targets, 1.0, 1e-12).err().unwrap();
    match err {
        Error::GradientCheck { layer, kind, index, .. } => {
            assert_eq!(layer, 0);
            assert_eq!(kind, "fc");
            assert_eq!(index, 0);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_parameters_restored_after_check() {
    let mut net = Network::new(Shape::flat(3), 12).unwrap();
    add(&mut net, "fc", &[("neurons", "2"), ("activation", "tanh")]);
    let before: Vec<f64> = (0..net.trainable_params())
        .map(|i| net.layers()[0].param(i))
        .collect();
    let inputs = batch(Shape::flat(3), 2, 22);
    let targets = batch(Shape::flat(2), 2, 23);
    net.gradient_check(&inputs, &targets, EPSILON, TOLERANCE)
        .unwrap();
    for (i, &w) in before.iter().enumerate() {
        assert_eq!(net.layers()[0].param(i), w);
        assert_eq!(net.layers()[0].gradient(i), 0.0);
    }
}
