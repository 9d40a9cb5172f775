//! Fully connected layer implementation
//!
//! This module provides a FullyConnectedLayer that flattens its input volume and performs
//! the transformation: output = activation(W · x + b)
//!
//! The weight matrix is stored as a `in_len × neurons` volume (one row per neuron), so the
//! weight-gradient pass can be split across neurons: each neuron's row is owned by exactly
//! one worker.

use crate::error::{invalid_hyperparameter, Result};
use crate::layers::params::{self, ParamGroup, SampleCount};
use crate::layers::r#trait::{check_batch, write_header, Layer, SampleLayer};
use crate::optimizers::Optimizer;
use crate::serialization::{format_value, write_group, TokenReader};
use crate::tensor::{Shape, Volume};
use crate::utils::{Activation, EngineRng};
use rayon::prelude::*;
use std::io::Write;

/// Fully connected layer with an element-wise activation.
///
/// # Fields
///
/// * `input_shape` - Shape of the incoming volume (flattened in storage order)
/// * `neurons` - Number of output neurons; the output shape is `1 × 1 × neurons`
/// * `activation` - Element-wise nonlinearity applied to `W · x + b`
/// * `weights` - Row `n` holds the incoming weights of neuron `n`
/// * `biases` - One bias per neuron
///
/// # Example
///
/// ```ignore
/// use rust_convnet::layers::FullyConnectedLayer;
/// use rust_convnet::tensor::Shape;
/// use rust_convnet::utils::{Activation, EngineRng};
///
/// let mut rng = EngineRng::new(42);
/// let layer = FullyConnectedLayer::new(Shape::new(4, 4, 2), 10, Activation::ReLU, &mut rng)?;
/// assert_eq!(layer.output_shape().depth, 10);
/// ```
pub struct FullyConnectedLayer {
    input_shape: Shape,
    neurons: usize,
    activation: Activation,
    weights: ParamGroup,
    biases: ParamGroup,
    samples: SampleCount,

    pre_activations: Vec<Volume>,
    outputs: Vec<Volume>,
    input_grads: Vec<Volume>,

    sample_input: Volume,
    sample_pre: Volume,
    sample_output: Volume,
    local_derivative: Volume,
    propagated: Volume,
}

impl FullyConnectedLayer {
    /// Create a new layer with Gaussian weights and zero biases.
    ///
    /// Weights are drawn from `N(0, 2 / in_len)` for rectifier activations and
    /// `N(0, 1 / in_len)` otherwise.
    ///
    /// # Arguments
    ///
    /// * `input_shape` - Shape of the incoming volume
    /// * `neurons` - Number of output neurons
    /// * `activation` - Any element-wise activation; softmax belongs in its own layer
    /// * `rng` - Generator used for weight initialization
    pub fn new(
        input_shape: Shape,
        neurons: usize,
        activation: Activation,
        rng: &mut EngineRng,
    ) -> Result<Self> {
        let mut layer = Self::with_zero_weights(input_shape, neurons, activation)?;
        let fan_in = input_shape.len() as f64;
        let gain = match activation {
            Activation::ReLU | Activation::LeakyReLU { .. } | Activation::Elu { .. } => 2.0,
            _ => 1.0,
        };
        layer
            .weights
            .values
            .randomize(rng, 0.0, (gain / fan_in).sqrt());
        Ok(layer)
    }

    fn with_zero_weights(input_shape: Shape, neurons: usize, activation: Activation) -> Result<Self> {
        input_shape.validate()?;
        if neurons == 0 {
            return Err(invalid_hyperparameter("fc layer needs at least one neuron"));
        }
        if !activation.is_elementwise() {
            return Err(invalid_hyperparameter(
                "fc layer activation must be element-wise; use a softmax layer",
            ));
        }
        let output = Shape::flat(neurons);
        let weight_shape = Shape::new(input_shape.len(), neurons, 1);
        weight_shape.validate()?;
        Ok(Self {
            input_shape,
            neurons,
            activation,
            weights: ParamGroup::zeros(weight_shape),
            biases: ParamGroup::zeros(output),
            samples: SampleCount::default(),
            pre_activations: Vec::new(),
            outputs: Vec::new(),
            input_grads: Vec::new(),
            sample_input: Volume::zeros(input_shape),
            sample_pre: Volume::zeros(output),
            sample_output: Volume::zeros(output),
            local_derivative: Volume::zeros(output),
            propagated: Volume::zeros(output),
        })
    }

    /// Reads the body of an `fc` record.
    pub fn load(input_shape: Shape, reader: &mut TokenReader) -> Result<Self> {
        let neurons: usize = reader.parse("fc neuron count")?;
        let name = reader.next_token("fc activation")?.to_string();
        let alpha: f64 = reader.parse("fc activation alpha")?;
        let activation = Activation::from_name(&name, Some(alpha))?;
        let mut layer = Self::with_zero_weights(input_shape, neurons, activation)?;
        let count = layer.weights.len();
        layer.weights.values = Volume::from_vec(layer.weights.values.shape(), reader.group("weights", count)?)?;
        layer.biases.values = Volume::from_vec(Shape::flat(neurons), reader.group("biases", neurons)?)?;
        Ok(layer)
    }

    pub fn neurons(&self) -> usize {
        self.neurons
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Weight matrix; element `(n, k, 0)` connects input `k` to neuron `n`.
    pub fn weights(&self) -> &Volume {
        &self.weights.values
    }

    pub fn weights_mut(&mut self) -> &mut Volume {
        &mut self.weights.values
    }

    pub fn biases(&self) -> &Volume {
        &self.biases.values
    }

    pub fn biases_mut(&mut self) -> &mut Volume {
        &mut self.biases.values
    }

    fn pre_activation(&self, input: &Volume) -> Volume {
        let x = input.data();
        let in_len = x.len();
        let w = self.weights.values.data();
        let mut z = self.biases.values.clone();
        for (n, out) in z.data_mut().iter_mut().enumerate() {
            let row = &w[n * in_len..(n + 1) * in_len];
            *out += row.iter().zip(x).map(|(a, b)| a * b).sum::<f64>();
        }
        z
    }

    fn activate(&self, z: &Volume) -> Volume {
        let mut y = z.clone();
        y.data_mut()
            .iter_mut()
            .for_each(|v| *v = self.activation.apply(*v));
        y
    }

    /// `dout ⊙ f'(z)` for one sample.
    fn delta(&self, dout: &Volume, z: &Volume, y: &Volume) -> Volume {
        let mut delta = dout.clone();
        for ((d, &zv), &yv) in delta.data_mut().iter_mut().zip(z.data()).zip(y.data()) {
            *d *= self.activation.derivative(zv, yv);
        }
        delta
    }

    /// `Wᵀ · delta`, shaped like the input.
    fn back_project(&self, delta: &Volume) -> Volume {
        let in_len = self.input_shape.len();
        let w = self.weights.values.data();
        let mut dx = Volume::zeros(self.input_shape);
        for (n, &d) in delta.data().iter().enumerate() {
            if d == 0.0 {
                continue;
            }
            let row = &w[n * in_len..(n + 1) * in_len];
            for (g, &wv) in dx.data_mut().iter_mut().zip(row) {
                *g += d * wv;
            }
        }
        dx
    }

    /// Adds `delta ⊗ x` for every sample; parallel over neurons.
    fn accumulate_gradients(&mut self, deltas: &[Volume], input: &[Volume]) {
        let in_len = self.input_shape.len();
        self.weights
            .grads
            .data_mut()
            .par_chunks_mut(in_len)
            .enumerate()
            .for_each(|(n, row)| {
                for (delta, x) in deltas.iter().zip(input) {
                    let d = delta[n];
                    if d == 0.0 {
                        continue;
                    }
                    for (g, &xv) in row.iter_mut().zip(x.data()) {
                        *g += d * xv;
                    }
                }
            });
        for delta in deltas {
            self.biases.grads.add_assign(delta);
        }
        self.samples.add(deltas.len());
    }
}

impl Layer for FullyConnectedLayer {
    fn kind(&self) -> &'static str {
        "fc"
    }

    fn input_shape(&self) -> Shape {
        self.input_shape
    }

    fn output_shape(&self) -> Shape {
        Shape::flat(self.neurons)
    }

    fn forward(&mut self, input: &[Volume]) {
        check_batch("fc", "input", input, self.input_shape);
        let (pre, out): (Vec<Volume>, Vec<Volume>) = input
            .par_iter()
            .map(|x| {
                let z = self.pre_activation(x);
                let y = self.activate(&z);
                (z, y)
            })
            .unzip();
        self.pre_activations = pre;
        self.outputs = out;
    }

    fn output(&self) -> &[Volume] {
        &self.outputs
    }

    fn forward_output(&self, input: &[Volume]) -> Vec<Volume> {
        check_batch("fc", "input", input, self.input_shape);
        input
            .par_iter()
            .map(|x| self.activate(&self.pre_activation(x)))
            .collect()
    }

    fn backward(&mut self, dout: &[Volume], input: &[Volume], calc_dx: bool) {
        assert_eq!(
            dout.len(),
            self.outputs.len(),
            "fc backward batch mismatch: expected {}, got {}",
            self.outputs.len(),
            dout.len()
        );
        check_batch("fc", "gradient", dout, self.output_shape());
        let deltas: Vec<Volume> = dout
            .par_iter()
            .zip(self.pre_activations.par_iter())
            .zip(self.outputs.par_iter())
            .map(|((g, z), y)| self.delta(g, z, y))
            .collect();
        self.accumulate_gradients(&deltas, input);
        if calc_dx {
            self.input_grads = deltas.par_iter().map(|d| self.back_project(d)).collect();
        }
    }

    fn input_gradient(&self) -> &[Volume] {
        &self.input_grads
    }

    fn update_weights(&mut self, optimizer: &Optimizer) {
        if self.samples.get() == 0 {
            return;
        }
        let scale = self.samples.scale();
        self.weights.apply(optimizer, scale);
        self.biases.apply(optimizer, scale);
        self.zero_gradients();
    }

    fn reset_optimizer_state(&mut self) {
        self.weights.state.reset();
        self.biases.state.reset();
    }

    fn trainable_params(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn param(&self, index: usize) -> f64 {
        params::get_param(&[&self.weights, &self.biases], index)
    }

    fn set_param(&mut self, index: usize, value: f64) {
        params::set_param(&mut [&mut self.weights, &mut self.biases], index, value)
    }

    fn gradient(&self, index: usize) -> f64 {
        params::get_gradient(&[&self.weights, &self.biases], index, self.samples)
    }

    fn zero_gradients(&mut self) {
        self.weights.zero_grad();
        self.biases.zero_grad();
        self.samples.clear();
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        write_header(out, "fc", self.input_shape)?;
        writeln!(
            out,
            " {} {} {}",
            self.neurons,
            self.activation.name(),
            format_value(self.activation.alpha())
        )?;
        write_group(out, "weights", self.weights.values.data())?;
        write_group(out, "biases", self.biases.values.data())?;
        Ok(())
    }

    fn as_sample_layer(&mut self) -> Option<&mut dyn SampleLayer> {
        Some(self)
    }
}

impl SampleLayer for FullyConnectedLayer {
    fn forward_sample(&mut self, input: &Volume) {
        check_batch("fc", "input", std::slice::from_ref(input), self.input_shape);
        self.sample_input = input.clone();
        self.sample_pre = self.pre_activation(input);
        self.sample_output = self.activate(&self.sample_pre);
        let ones = Volume::filled(self.sample_pre.shape(), 1.0);
        self.local_derivative = self.delta(&ones, &self.sample_pre, &self.sample_output);
    }

    fn sample_output(&self) -> &Volume {
        &self.sample_output
    }

    fn local_derivative(&self) -> &Volume {
        &self.local_derivative
    }

    fn propagated_gradient(&self) -> &Volume {
        &self.propagated
    }

    fn backward_sample(&mut self, gradient: &mut Volume) {
        gradient.mul_assign(&self.local_derivative);
        let delta = gradient.clone();
        let input = self.sample_input.clone();
        self.accumulate_gradients(std::slice::from_ref(&delta), std::slice::from_ref(&input));
        *gradient = self.back_project(&delta);
        self.propagated = delta;
    }
}
