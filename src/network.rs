//! Network orchestration
//!
//! A [`Network`] owns an ordered [`Chain`] of layers together with the optimizer, the loss
//! and the generator that initializes new layers and shuffles training data. It runs the
//! training loop (shuffle, mini-batch forward, loss, reverse backward, one weight update per
//! batch), inference, finite-difference gradient checking, and the text model format.
//!
//! # Example
//!
//! ```
//! use rust_convnet::config::Params;
//! use rust_convnet::network::{Network, TrainOptions};
//! use rust_convnet::tensor::{Shape, Volume};
//!
//! let mut net = Network::new(Shape::flat(2), 7).unwrap();
//! net.add_from_params("fc", &Params::from_pairs([("neurons", "4"), ("activation", "tanh")]))
//!     .unwrap();
//! net.add_from_params("fc", &Params::from_pairs([("neurons", "1")])).unwrap();
//!
//! let inputs = vec![Volume::from_slice(&[0.0, 1.0]), Volume::from_slice(&[1.0, 0.0])];
//! let targets = vec![Volume::from_slice(&[1.0]), Volume::from_slice(&[0.0])];
//! let options = TrainOptions { epochs: 5, batch_size: 2, ..TrainOptions::default() };
//! let report = net.train(&inputs, &targets, &options).unwrap();
//! assert_eq!(report.epoch_losses.len(), 5);
//! ```

use crate::config::{Params, TrainingConfig};
use crate::error::{shape_mismatch, Error, Result};
use crate::layers::{create_layer, read_layer, Chain, Layer};
use crate::loss::Loss;
use crate::optimizers::Optimizer;
use crate::serialization::TokenReader;
use crate::tensor::{Shape, Volume};
use crate::utils::EngineRng;
use log::{debug, error, info};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::Instant;

/// Options of one [`Network::train`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOptions {
    pub epochs: usize,
    pub batch_size: usize,
    /// Zero every optimizer accumulator at the start of each epoch
    pub reset_optimizer: bool,
    pub shuffle: bool,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 32,
            reset_optimizer: false,
            shuffle: true,
        }
    }
}

impl From<&TrainingConfig> for TrainOptions {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            reset_optimizer: config.reset_optimizer,
            shuffle: config.shuffle,
        }
    }
}

/// Mean training loss of every epoch, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    pub epoch_losses: Vec<f64>,
}

impl TrainReport {
    pub fn final_loss(&self) -> Option<f64> {
        self.epoch_losses.last().copied()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GradientCheckReport {
    /// Number of trainable scalars compared
    pub checked: usize,
    /// Largest absolute analytic/numeric difference seen
    pub max_difference: f64,
}

pub struct Network {
    chain: Chain,
    rng: EngineRng,
    optimizer: Optimizer,
    loss: Loss,
}

impl Network {
    /// Empty network taking volumes of `input_shape`; `seed` drives initialization,
    /// shuffling and dropout.
    pub fn new(input_shape: Shape, seed: u64) -> Result<Self> {
        input_shape.validate()?;
        Ok(Self {
            chain: Chain::new(input_shape),
            rng: EngineRng::new(seed),
            optimizer: Optimizer::default(),
            loss: Loss::default(),
        })
    }

    /// Appends a layer; its input shape must equal the current output shape.
    pub fn add_layer(&mut self, layer: Box<dyn Layer>) -> Result<()> {
        self.chain.push(layer)
    }

    /// Appends a layer created by [`create_layer`] on the current output shape.
    pub fn add_from_params(&mut self, kind: &str, params: &Params) -> Result<()> {
        let layer = create_layer(kind, self.output_shape(), params, &mut self.rng)?;
        self.chain.push(layer)
    }

    /// Generator for building layers outside the network before adding them.
    pub fn rng_mut(&mut self) -> &mut EngineRng {
        &mut self.rng
    }

    pub fn set_optimizer(&mut self, optimizer: Optimizer) {
        self.optimizer = optimizer;
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn set_loss(&mut self, loss: Loss) {
        self.loss = loss;
    }

    pub fn loss(&self) -> Loss {
        self.loss
    }

    /// Selects optimizer and loss from a training configuration and returns its options.
    pub fn configure(&mut self, config: &TrainingConfig) -> Result<TrainOptions> {
        self.optimizer = Optimizer::from_params(&config.optimizer_params())?;
        self.loss = Loss::from_name(&config.loss)?;
        Ok(TrainOptions::from(config))
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        self.chain.layers()
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        self.chain.layers_mut()
    }

    pub fn input_shape(&self) -> Shape {
        self.chain.input_shape()
    }

    pub fn output_shape(&self) -> Shape {
        self.chain.output_shape()
    }

    pub fn trainable_params(&self) -> usize {
        self.chain.trainable_params()
    }

    fn check_dataset(&self, inputs: &[Volume], targets: &[Volume]) -> Result<()> {
        if inputs.is_empty() {
            return Err(Error::EmptyDataset("no samples".to_string()));
        }
        if inputs.len() != targets.len() {
            return Err(Error::DimensionMismatch(format!(
                "{} inputs but {} targets",
                inputs.len(),
                targets.len()
            )));
        }
        let (input_shape, output_shape) = (self.input_shape(), self.output_shape());
        for (i, (x, t)) in inputs.iter().zip(targets).enumerate() {
            if x.shape() != input_shape {
                return Err(shape_mismatch(format!(
                    "sample {} has shape {}, network expects {}",
                    i,
                    x.shape(),
                    input_shape
                )));
            }
            if t.shape() != output_shape {
                return Err(shape_mismatch(format!(
                    "target {} has shape {}, network outputs {}",
                    i,
                    t.shape(),
                    output_shape
                )));
            }
        }
        Ok(())
    }

    fn check_options(options: &TrainOptions) -> Result<()> {
        if options.batch_size == 0 {
            return Err(Error::InvalidParameter {
                key: "batch_size".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// One forward/backward/update cycle over a mini-batch. Returns the mean batch loss.
    ///
    /// # Panics
    ///
    /// Panics if a volume does not have the network's input or output shape.
    pub fn train_batch(&mut self, inputs: &[Volume], targets: &[Volume]) -> f64 {
        self.chain.forward(inputs);
        let (loss, grads) = self.loss.evaluate(self.chain.output(inputs), targets);
        self.chain.backward(&grads, inputs, false);
        self.chain.update_weights(&self.optimizer);
        loss
    }

    /// Mini-batch training with the batched layer convention.
    pub fn train(
        &mut self,
        inputs: &[Volume],
        targets: &[Volume],
        options: &TrainOptions,
    ) -> Result<TrainReport> {
        self.check_dataset(inputs, targets)?;
        Self::check_options(options)?;

        let mut order: Vec<usize> = (0..inputs.len()).collect();
        let mut report = TrainReport::default();
        for epoch in 0..options.epochs {
            let start = Instant::now();
            self.begin_epoch(options, &mut order);

            let mut total = 0.0;
            for (b, batch) in order.chunks(options.batch_size).enumerate() {
                let xs: Vec<Volume> = batch.iter().map(|&i| inputs[i].clone()).collect();
                let ts: Vec<Volume> = batch.iter().map(|&i| targets[i].clone()).collect();
                let loss = self.train_batch(&xs, &ts);
                debug!("epoch {} batch {}: loss {:.6}", epoch + 1, b + 1, loss);
                total += loss * batch.len() as f64;
            }

            let mean = total / inputs.len() as f64;
            self.optimizer.advance_epoch();
            info!(
                "epoch {}/{}: loss {:.6} ({:.2?})",
                epoch + 1,
                options.epochs,
                mean,
                start.elapsed()
            );
            report.epoch_losses.push(mean);
        }
        Ok(report)
    }

    fn begin_epoch(&mut self, options: &TrainOptions, order: &mut [usize]) {
        if options.reset_optimizer {
            debug!("resetting optimizer state");
            self.chain.reset_optimizer_state();
        }
        if options.shuffle {
            self.rng.shuffle_usize(order);
        }
    }

    /// Training with the single-sample layer convention.
    ///
    /// Each sample is pushed forward layer by layer, and one gradient buffer is threaded
    /// backward through every layer. Weights are updated after every `batch_size` samples.
    /// Fails with [`Error::Unsupported`] if a layer has no single-sample form.
    pub fn train_per_sample(
        &mut self,
        inputs: &[Volume],
        targets: &[Volume],
        options: &TrainOptions,
    ) -> Result<TrainReport> {
        self.check_dataset(inputs, targets)?;
        Self::check_options(options)?;
        for layer in self.chain.layers_mut() {
            if layer.as_sample_layer().is_none() {
                return Err(Error::Unsupported(format!(
                    "{} layer has no single-sample form",
                    layer.kind()
                )));
            }
        }

        let mut order: Vec<usize> = (0..inputs.len()).collect();
        let mut report = TrainReport::default();
        for epoch in 0..options.epochs {
            let start = Instant::now();
            self.begin_epoch(options, &mut order);

            let mut total = 0.0;
            for batch in order.chunks(options.batch_size) {
                for &i in batch {
                    let output = self.forward_sample(&inputs[i]);
                    total += self.loss.sample_loss(&output, &targets[i]);
                    let mut gradient = self.loss.sample_gradient(&output, &targets[i]);
                    self.backward_sample(&mut gradient);
                }
                self.chain.update_weights(&self.optimizer);
            }

            let mean = total / inputs.len() as f64;
            self.optimizer.advance_epoch();
            info!(
                "epoch {}/{}: loss {:.6} ({:.2?}, per sample)",
                epoch + 1,
                options.epochs,
                mean,
                start.elapsed()
            );
            report.epoch_losses.push(mean);
        }
        Ok(report)
    }

    fn forward_sample(&mut self, input: &Volume) -> Volume {
        let mut current = input.clone();
        for layer in self.chain.layers_mut() {
            if let Some(sample) = layer.as_sample_layer() {
                sample.forward_sample(&current);
                current = sample.sample_output().clone();
            }
        }
        current
    }

    fn backward_sample(&mut self, gradient: &mut Volume) {
        for layer in self.chain.layers_mut().iter_mut().rev() {
            if let Some(sample) = layer.as_sample_layer() {
                sample.backward_sample(gradient);
            }
        }
    }

    /// Inference-mode output for one sample.
    pub fn get_output(&self, input: &Volume) -> Volume {
        let mut outputs = self.chain.forward_output(std::slice::from_ref(input));
        outputs.remove(0)
    }

    /// Inference-mode outputs for a batch.
    pub fn predict_batch(&self, inputs: &[Volume]) -> Vec<Volume> {
        self.chain.forward_output(inputs)
    }

    /// Mean inference-mode loss over a dataset.
    pub fn get_error(&self, inputs: &[Volume], targets: &[Volume]) -> Result<f64> {
        self.check_dataset(inputs, targets)?;
        let outputs = self.chain.forward_output(inputs);
        Ok(self.loss.evaluate(&outputs, targets).0)
    }

    /// Fraction of samples whose output arg-max equals the target arg-max.
    pub fn accuracy(&self, inputs: &[Volume], targets: &[Volume]) -> Result<f64> {
        self.check_dataset(inputs, targets)?;
        let outputs = self.chain.forward_output(inputs);
        let correct = outputs
            .iter()
            .zip(targets)
            .filter(|(y, t)| y.argmax() == t.argmax())
            .count();
        Ok(correct as f64 / inputs.len() as f64)
    }

    /// Training-mode mean loss; perturbation probe for gradient checking.
    fn training_loss(&mut self, inputs: &[Volume], targets: &[Volume]) -> f64 {
        self.chain.forward(inputs);
        self.loss.evaluate(self.chain.output(inputs), targets).0
    }

    /// Compares every analytic parameter gradient with a central difference.
    ///
    /// The analytic gradients come from one training-mode forward and backward over the
    /// whole batch. Each trainable scalar is then moved by `±epsilon` and the loss
    /// recomputed. Fails with [`Error::GradientCheck`] on the first scalar whose gradients
    /// differ by more than `tolerance`. Parameters are restored and gradients cleared
    /// either way; batch-norm running statistics are updated by the probes.
    pub fn gradient_check(
        &mut self,
        inputs: &[Volume],
        targets: &[Volume],
        epsilon: f64,
        tolerance: f64,
    ) -> Result<GradientCheckReport> {
        self.check_dataset(inputs, targets)?;
        if let Some(layer) = self.layers().iter().find(|l| l.is_stochastic()) {
            return Err(Error::Unsupported(format!(
                "gradient check through a {} layer",
                layer.kind()
            )));
        }

        self.chain.zero_gradients();
        self.chain.forward(inputs);
        let (_, grads) = self.loss.evaluate(self.chain.output(inputs), targets);
        self.chain.backward(&grads, inputs, false);

        let mut report = GradientCheckReport::default();
        let result = self.compare_gradients(inputs, targets, epsilon, tolerance, &mut report);
        self.chain.zero_gradients();
        result.map(|_| {
            debug!(
                "gradient check passed: {} parameters, max difference {:e}",
                report.checked, report.max_difference
            );
            report
        })
    }

    fn compare_gradients(
        &mut self,
        inputs: &[Volume],
        targets: &[Volume],
        epsilon: f64,
        tolerance: f64,
        report: &mut GradientCheckReport,
    ) -> Result<()> {
        for l in 0..self.chain.len() {
            for p in 0..self.layers()[l].trainable_params() {
                let analytic = self.layers()[l].gradient(p);
                let original = self.layers()[l].param(p);

                self.layers_mut()[l].set_param(p, original + epsilon);
                let plus = self.training_loss(inputs, targets);
                self.layers_mut()[l].set_param(p, original - epsilon);
                let minus = self.training_loss(inputs, targets);
                self.layers_mut()[l].set_param(p, original);

                let numeric = (plus - minus) / (2.0 * epsilon);
                let difference = (analytic - numeric).abs();
                report.checked += 1;
                report.max_difference = report.max_difference.max(difference);
                if !(difference <= tolerance) {
                    let kind = self.layers()[l].kind().to_string();
                    error!(
                        "gradient mismatch in layer {} ({}) parameter {}: analytic {:e}, numeric {:e}",
                        l, kind, p, analytic, numeric
                    );
                    return Err(Error::GradientCheck {
                        layer: l,
                        kind,
                        index: p,
                        analytic,
                        numeric,
                    });
                }
            }
        }
        Ok(())
    }

    /// Writes the model: the input shape line, then one record per layer.
    pub fn save(&self, out: &mut dyn Write) -> Result<()> {
        self.input_shape().write_to(out)?;
        writeln!(out)?;
        self.chain.save(out)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.save(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn to_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        self.save(&mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Malformed(e.to_string()))
    }

    /// Reads a model written by [`Network::save`].
    ///
    /// The loaded network uses the default optimizer and loss and a generator seeded with 0.
    pub fn load<R: Read>(reader: R) -> Result<Self> {
        let mut tokens = TokenReader::from_reader(reader)?;
        Self::read(&mut tokens)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        Self::read(&mut TokenReader::new(text))
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(File::open(path)?)
    }

    fn read(tokens: &mut TokenReader) -> Result<Self> {
        let input = tokens.shape("network input shape")?;
        let mut network = Self::new(input, 0)?;
        while !tokens.is_exhausted() {
            let layer = read_layer(tokens, &mut network.rng)?;
            network.chain.push(layer)?;
        }
        debug!(
            "loaded network: {} layers, {} parameters, {} -> {}",
            network.chain.len(),
            network.trainable_params(),
            network.input_shape(),
            network.output_shape()
        );
        Ok(network)
    }
}
