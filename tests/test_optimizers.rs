// Integration tests for the optimizer state machine: selection from key/value lookups,
// per-weight accumulators owned by layers, resets and the epoch counter.

use approx::assert_relative_eq;
use rust_convnet::config::Params;
use rust_convnet::layers::{FullyConnectedLayer, Layer};
use rust_convnet::network::{Network, TrainOptions};
use rust_convnet::optimizers::{Optimizer, UpdateRule};
use rust_convnet::tensor::{Shape, Volume};
use rust_convnet::utils::{Activation, EngineRng};
use rust_convnet::Error;

const RULES: [&str; 11] = [
    "sgd", "momentum", "adagrad", "rmsprop", "adadelta", "nesterov", "adam", "adamax", "nadam",
    "amsgrad", "adabound",
];

// ============================================================================
// Selection
// ============================================================================

#[test]
fn test_from_params_selects_every_rule() {
    for name in RULES {
        let opt = Optimizer::from_params(&Params::from_pairs([("optimizer", name)])).unwrap();
        assert_eq!(opt.rule().name(), name);
        assert_eq!(opt.epoch(), 0);
    }
}

#[test]
fn test_default_learning_rates() {
    let sgd = Optimizer::from_params(&Params::new()).unwrap();
    assert_eq!(sgd.rule(), UpdateRule::Sgd);
    assert_relative_eq!(sgd.learning_rate(), 0.01);

    let adam = Optimizer::from_params(&Params::from_pairs([("optimizer", "adam")])).unwrap();
    assert_relative_eq!(adam.learning_rate(), 0.001);

    let adadelta =
        Optimizer::from_params(&Params::from_pairs([("optimizer", "adadelta")])).unwrap();
    assert_relative_eq!(adadelta.learning_rate(), 1.0);
}

#[test]
fn test_rule_specific_keys() {
    let params = Params::from_pairs([
        ("optimizer", "momentum"),
        ("lr", "0.05"),
        ("momentum", "0.5"),
        ("decay", "0.001"),
    ]);
    let opt = Optimizer::from_params(&params).unwrap();
    assert_eq!(opt.rule(), UpdateRule::Momentum { momentum: 0.5 });
    assert_relative_eq!(opt.learning_rate(), 0.05);
    assert_relative_eq!(opt.decay(), 0.001);
}

#[test]
fn test_invalid_selections() {
    let unknown = Optimizer::from_params(&Params::from_pairs([("optimizer", "lion")]));
    assert!(matches!(unknown, Err(Error::UnknownOptimizer(_))));

    let bad_beta =
        Optimizer::from_params(&Params::from_pairs([("optimizer", "adam"), ("beta1", "1.5")]));
    assert!(matches!(bad_beta, Err(Error::InvalidParameter { .. })));

    let bad_lr = Optimizer::from_params(&Params::from_pairs([("lr", "-1")]));
    assert!(matches!(bad_lr, Err(Error::InvalidParameter { .. })));

    let unparsable = Optimizer::from_params(&Params::from_pairs([("lr", "fast")]));
    assert!(matches!(unparsable, Err(Error::InvalidParameter { .. })));

    let negative_decay = Optimizer::from_params(&Params::from_pairs([("decay", "-0.1")]));
    assert!(matches!(negative_decay, Err(Error::InvalidParameter { .. })));

    let endless_decay = Optimizer::from_params(&Params::from_pairs([("decay", "inf")]));
    assert!(matches!(endless_decay, Err(Error::InvalidParameter { .. })));

    assert_eq!(Optimizer::from_params(&Params::new()).unwrap().decay(), 0.0);
}

// ============================================================================
// Accumulators owned by layers
// ============================================================================

fn single_weight_layer() -> FullyConnectedLayer {
    let mut rng = EngineRng::new(0);
    let mut layer =
        FullyConnectedLayer::new(Shape::flat(1), 1, Activation::Identity, &mut rng).unwrap();
    layer.set_param(0, 1.0);
    layer
}

fn step(layer: &mut FullyConnectedLayer, opt: &Optimizer) {
    let x = vec![Volume::from_slice(&[1.0])];
    layer.forward(&x);
    layer.backward(&[Volume::from_slice(&[1.0])], &x, false);
    layer.update_weights(opt);
}

#[test]
fn test_momentum_state_persists_between_updates() {
    let opt = Optimizer::new(UpdateRule::Momentum { momentum: 0.9 }, 0.1);
    let mut layer = single_weight_layer();
    step(&mut layer, &opt);
    assert_relative_eq!(layer.param(0), 0.9, epsilon = 1e-12);
    step(&mut layer, &opt);
    // velocity -0.1 then -0.19
    assert_relative_eq!(layer.param(0), 0.71, epsilon = 1e-12);
}

#[test]
fn test_reset_optimizer_state_forgets_velocity() {
    let opt = Optimizer::new(UpdateRule::Momentum { momentum: 0.9 }, 0.1);
    let mut layer = single_weight_layer();
    step(&mut layer, &opt);
    layer.reset_optimizer_state();
    step(&mut layer, &opt);
    assert_relative_eq!(layer.param(0), 0.8, epsilon = 1e-12);
}

#[test]
fn test_adam_bias_correction_uses_epoch() {
    let mut opt = Optimizer::new(
        UpdateRule::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        },
        0.01,
    );
    let mut first = single_weight_layer();
    step(&mut first, &opt);
    // t = 1: bias-corrected first step has size lr
    assert_relative_eq!(first.param(0), 0.99, epsilon = 1e-8);

    opt.advance_epoch();
    opt.advance_epoch();
    assert_eq!(opt.epoch(), 2);
    let mut later = single_weight_layer();
    step(&mut later, &opt);
    // fresh moments with t = 3 under-correct, so the step is smaller than lr
    assert!(later.param(0) > 0.99);

    opt.reset_epoch();
    assert_eq!(opt.epoch(), 0);
}

// ============================================================================
// Every rule trains
// ============================================================================

fn regression_net(rule: &str) -> Network {
    let mut net = Network::new(Shape::flat(2), 3).unwrap();
    net.add_from_params(
        "fc",
        &Params::from_pairs([("neurons", "6"), ("activation", "tanh")]),
    )
    .unwrap();
    net.add_from_params("fc", &Params::from_pairs([("neurons", "1")]))
        .unwrap();
    let lr = match rule {
        "adadelta" => "1.0",
        "sgd" | "momentum" | "nesterov" => "0.05",
        _ => "0.01",
    };
    net.set_optimizer(
        Optimizer::from_params(&Params::from_pairs([("optimizer", rule), ("lr", lr)])).unwrap(),
    );
    net
}

#[test]
fn test_every_rule_reduces_training_loss() {
    let inputs: Vec<Volume> = (0..8)
        .map(|i| {
            let a = i as f64 / 8.0 - 0.5;
            Volume::from_slice(&[a, -a * 0.5])
        })
        .collect();
    let targets: Vec<Volume> = inputs
        .iter()
        .map(|x| Volume::from_slice(&[0.8 * x[0] - 0.3 * x[1] + 0.1]))
        .collect();
    let options = TrainOptions {
        epochs: 60,
        batch_size: 4,
        reset_optimizer: false,
        shuffle: true,
    };

    for rule in RULES {
        let mut net = regression_net(rule);
        let before = net.get_error(&inputs, &targets).unwrap();
        net.train(&inputs, &targets, &options).unwrap();
        let after = net.get_error(&inputs, &targets).unwrap();
        assert!(after < before, "{}: {} -> {}", rule, before, after);
        assert_eq!(net.optimizer().epoch(), 60);
    }
}
