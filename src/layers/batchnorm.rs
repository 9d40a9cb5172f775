//! Batch normalization layer implementation
//!
//! This module provides a BatchNormLayer that normalizes every feature of its input volume
//! across the batch, and the [`Normalizer`] core it shares with
//! [`BatchNorm2DLayer`](crate::layers::BatchNorm2DLayer).
//!
//! # Batch Normalization Theory
//!
//! Within each mini-batch every normalization group (one feature here, one channel for the
//! 2-D variant) is normalized to zero mean and unit variance, then scaled and shifted by
//! learnable parameters:
//!
//! 1. Compute batch statistics: mean μ and biased variance σ² over the group
//! 2. Normalize: x̂ = (x - μ) / sqrt(σ² + ε)
//! 3. Scale and shift: y = γ x̂ + β
//!
//! Training-mode forward also updates the running statistics,
//! `running = momentum * running + (1 - momentum) * batch`. Inference
//! ([`Layer::forward_output`]) normalizes with the running statistics only, so it works on
//! a batch of one and never mutates the layer.
//!
//! # Backward
//!
//! With `M` values per group, `dx̂ = dout · γ`, `d1 = Σ dx̂` and `d2 = Σ dx̂ · x̂`:
//!
//! ```text
//! dx = (1 / M) · (1 / sqrt(σ² + ε)) · (M · dx̂ - d1 - x̂ · d2)
//! dγ = Σ dout · x̂
//! dβ = Σ dout
//! ```
//!
//! # References
//!
//! Ioffe, S., & Szegedy, C. (2015). Batch Normalization: Accelerating Deep Network Training
//! by Reducing Internal Covariate Shift. ICML.

use crate::error::{invalid_hyperparameter, Result};
use crate::layers::params::{self, ParamGroup, SampleCount};
use crate::layers::r#trait::{check_batch, write_header, Layer};
use crate::optimizers::Optimizer;
use crate::serialization::{write_group, write_values, TokenReader};
use crate::tensor::{Shape, Volume};
use rayon::prelude::*;
use std::io::Write;

/// Numerical-stability constant added to the variance.
pub const BATCHNORM_EPS: f64 = 1e-8;

/// Default running-statistics momentum.
pub const DEFAULT_MOMENTUM: f64 = 0.9;

/// Normalization state shared by both batch-norm kinds.
///
/// Element `k` of a volume belongs to group `k % groups`: with `groups = len` every element
/// is its own group, with `groups = depth` the groups are the channels.
#[derive(Debug, Clone)]
pub struct Normalizer {
    shape: Shape,
    groups: usize,
    momentum: f64,
    gamma: ParamGroup,
    beta: ParamGroup,
    running_mean: Vec<f64>,
    running_var: Vec<f64>,
    samples: SampleCount,

    // Cached by the last training-mode forward
    normalized: Vec<Volume>,
    inv_std: Vec<f64>,
    outputs: Vec<Volume>,
    input_grads: Vec<Volume>,
}

impl Normalizer {
    pub fn new(shape: Shape, groups: usize, momentum: f64) -> Result<Self> {
        shape.validate()?;
        if !(0.0..=1.0).contains(&momentum) {
            return Err(invalid_hyperparameter(format!(
                "batch norm momentum must be in [0, 1], got {}",
                momentum
            )));
        }
        let group_shape = Shape::flat(groups);
        Ok(Self {
            shape,
            groups,
            momentum,
            gamma: ParamGroup::new(Volume::filled(group_shape, 1.0)),
            beta: ParamGroup::zeros(group_shape),
            running_mean: vec![0.0; groups],
            running_var: vec![1.0; groups],
            samples: SampleCount::default(),
            normalized: Vec::new(),
            inv_std: Vec::new(),
            outputs: Vec::new(),
            input_grads: Vec::new(),
        })
    }

    /// Reads `momentum` and the four value groups of a batch-norm record.
    pub fn read(shape: Shape, groups: usize, reader: &mut TokenReader) -> Result<Self> {
        let momentum = reader.parse("batch norm momentum")?;
        let mut norm = Self::new(shape, groups, momentum)?;
        let group_shape = Shape::flat(groups);
        norm.gamma = ParamGroup::new(Volume::from_vec(group_shape, reader.group("gamma", groups)?)?);
        norm.beta = ParamGroup::new(Volume::from_vec(group_shape, reader.group("beta", groups)?)?);
        norm.running_mean = reader.group("running_mean", groups)?;
        norm.running_var = reader.group("running_var", groups)?;
        Ok(norm)
    }

    pub fn write(&self, kind: &str, out: &mut dyn Write) -> Result<()> {
        write_header(out, kind, self.shape)?;
        write!(out, " ")?;
        write_values(out, &[self.momentum])?;
        write_group(out, "gamma", self.gamma.values.data())?;
        write_group(out, "beta", self.beta.values.data())?;
        write_group(out, "running_mean", &self.running_mean)?;
        write_group(out, "running_var", &self.running_var)?;
        Ok(())
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    pub fn gamma(&self) -> &Volume {
        &self.gamma.values
    }

    pub fn gamma_mut(&mut self) -> &mut Volume {
        &mut self.gamma.values
    }

    pub fn beta(&self) -> &Volume {
        &self.beta.values
    }

    pub fn beta_mut(&mut self) -> &mut Volume {
        &mut self.beta.values
    }

    pub fn running_mean(&self) -> &[f64] {
        &self.running_mean
    }

    pub fn running_var(&self) -> &[f64] {
        &self.running_var
    }

    /// Normalized values `x̂` of the last training-mode forward.
    pub fn normalized(&self) -> &[Volume] {
        &self.normalized
    }

    /// Flat offsets belonging to group `g` within one volume.
    fn members(&self, g: usize) -> impl Iterator<Item = usize> {
        (g..self.shape.len()).step_by(self.groups)
    }

    fn scale_shift(&self, xhat: &Volume) -> Volume {
        let mut y = xhat.clone();
        let (gamma, beta) = (self.gamma.values.data(), self.beta.values.data());
        for (k, v) in y.data_mut().iter_mut().enumerate() {
            let g = k % self.groups;
            *v = gamma[g] * *v + beta[g];
        }
        y
    }

    pub fn forward(&mut self, input: &[Volume]) {
        check_batch("batchnorm", "input", input, self.shape);
        assert!(!input.is_empty(), "batch norm forward needs at least one sample");
        let count = (input.len() * self.shape.len() / self.groups) as f64;

        // Parallel over groups: each worker reduces one group over batch and space
        let stats: Vec<(f64, f64)> = (0..self.groups)
            .into_par_iter()
            .map(|g| {
                let mut sum = 0.0;
                for x in input {
                    sum += self.members(g).map(|k| x[k]).sum::<f64>();
                }
                let mean = sum / count;
                let mut sq = 0.0;
                for x in input {
                    sq += self.members(g).map(|k| (x[k] - mean) * (x[k] - mean)).sum::<f64>();
                }
                (mean, sq / count)
            })
            .collect();

        let m = self.momentum;
        for (g, &(mean, var)) in stats.iter().enumerate() {
            self.running_mean[g] = m * self.running_mean[g] + (1.0 - m) * mean;
            self.running_var[g] = m * self.running_var[g] + (1.0 - m) * var;
        }
        self.inv_std = stats
            .iter()
            .map(|&(_, var)| 1.0 / (var + BATCHNORM_EPS).sqrt())
            .collect();

        let groups = self.groups;
        let inv_std = &self.inv_std;
        self.normalized = input
            .par_iter()
            .map(|x| {
                let mut xhat = x.clone();
                for (k, v) in xhat.data_mut().iter_mut().enumerate() {
                    let g = k % groups;
                    *v = (*v - stats[g].0) * inv_std[g];
                }
                xhat
            })
            .collect();
        self.outputs = self.normalized.par_iter().map(|xh| self.scale_shift(xh)).collect();
    }

    pub fn outputs(&self) -> &[Volume] {
        &self.outputs
    }

    pub fn forward_output(&self, input: &[Volume]) -> Vec<Volume> {
        check_batch("batchnorm", "input", input, self.shape);
        input
            .par_iter()
            .map(|x| {
                let mut xhat = x.clone();
                for (k, v) in xhat.data_mut().iter_mut().enumerate() {
                    let g = k % self.groups;
                    *v = (*v - self.running_mean[g]) / (self.running_var[g] + BATCHNORM_EPS).sqrt();
                }
                self.scale_shift(&xhat)
            })
            .collect()
    }

    pub fn backward(&mut self, dout: &[Volume], calc_dx: bool) {
        check_batch("batchnorm", "gradient", dout, self.shape);
        assert_eq!(
            dout.len(),
            self.normalized.len(),
            "batch norm backward batch mismatch: expected {}, got {}",
            self.normalized.len(),
            dout.len()
        );
        let count = (dout.len() * self.shape.len() / self.groups) as f64;
        let gamma = self.gamma.values.data();

        // (dγ, dβ, d1, d2) per group
        let sums: Vec<[f64; 4]> = (0..self.groups)
            .into_par_iter()
            .map(|g| {
                let mut acc = [0.0; 4];
                for (d, xhat) in dout.iter().zip(&self.normalized) {
                    for k in self.members(g) {
                        let dxhat = d[k] * gamma[g];
                        acc[0] += d[k] * xhat[k];
                        acc[1] += d[k];
                        acc[2] += dxhat;
                        acc[3] += dxhat * xhat[k];
                    }
                }
                acc
            })
            .collect();

        if calc_dx {
            let groups = self.groups;
            let inv_std = &self.inv_std;
            self.input_grads = dout
                .par_iter()
                .zip(self.normalized.par_iter())
                .map(|(d, xhat)| {
                    let mut dx = Volume::zeros(d.shape());
                    for (k, v) in dx.data_mut().iter_mut().enumerate() {
                        let g = k % groups;
                        let dxhat = d[k] * gamma[g];
                        *v = inv_std[g] / count * (count * dxhat - sums[g][2] - xhat[k] * sums[g][3]);
                    }
                    dx
                })
                .collect();
        }

        for (g, s) in sums.iter().enumerate() {
            self.gamma.grads[g] += s[0];
            self.beta.grads[g] += s[1];
        }
        self.samples.add(dout.len());
    }

    pub fn input_gradient(&self) -> &[Volume] {
        &self.input_grads
    }

    pub fn update(&mut self, optimizer: &Optimizer) {
        if self.samples.get() == 0 {
            return;
        }
        let scale = self.samples.scale();
        self.gamma.apply(optimizer, scale);
        self.beta.apply(optimizer, scale);
        self.zero_gradients();
    }

    pub fn reset_state(&mut self) {
        self.gamma.state.reset();
        self.beta.state.reset();
    }

    pub fn len(&self) -> usize {
        2 * self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups == 0
    }

    pub fn param(&self, index: usize) -> f64 {
        params::get_param(&[&self.gamma, &self.beta], index)
    }

    pub fn set_param(&mut self, index: usize, value: f64) {
        params::set_param(&mut [&mut self.gamma, &mut self.beta], index, value)
    }

    pub fn gradient(&self, index: usize) -> f64 {
        params::get_gradient(&[&self.gamma, &self.beta], index, self.samples)
    }

    pub fn zero_gradients(&mut self) {
        self.gamma.zero_grad();
        self.beta.zero_grad();
        self.samples.clear();
    }
}

/// Batch normalization with one (γ, β) pair per input element.
///
/// # Example
///
/// ```
/// use rust_convnet::layers::{BatchNormLayer, Layer};
/// use rust_convnet::tensor::{Shape, Volume};
///
/// let mut layer = BatchNormLayer::new(Shape::flat(2), 0.9).unwrap();
/// let batch = vec![Volume::from_slice(&[1.0, 10.0]), Volume::from_slice(&[3.0, 30.0])];
/// layer.forward(&batch);
/// // Each feature is normalized independently
/// assert!((layer.output()[0][0] + 1.0).abs() < 1e-6);
/// assert!((layer.output()[1][1] - 1.0).abs() < 1e-6);
/// ```
pub struct BatchNormLayer {
    norm: Normalizer,
}

impl BatchNormLayer {
    /// # Arguments
    ///
    /// * `shape` - Input (and output) shape
    /// * `momentum` - Running-statistics momentum in `[0, 1]` (typical: 0.9)
    pub fn new(shape: Shape, momentum: f64) -> Result<Self> {
        Ok(Self {
            norm: Normalizer::new(shape, shape.len(), momentum)?,
        })
    }

    /// Reads the body of a `batchnorm` record.
    pub fn load(shape: Shape, reader: &mut TokenReader) -> Result<Self> {
        Ok(Self {
            norm: Normalizer::read(shape, shape.len(), reader)?,
        })
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.norm
    }

    pub fn normalizer_mut(&mut self) -> &mut Normalizer {
        &mut self.norm
    }
}

impl Layer for BatchNormLayer {
    fn kind(&self) -> &'static str {
        "batchnorm"
    }

    fn input_shape(&self) -> Shape {
        self.norm.shape()
    }

    fn output_shape(&self) -> Shape {
        self.norm.shape()
    }

    fn forward(&mut self, input: &[Volume]) {
        self.norm.forward(input);
    }

    fn output(&self) -> &[Volume] {
        self.norm.outputs()
    }

    fn forward_output(&self, input: &[Volume]) -> Vec<Volume> {
        self.norm.forward_output(input)
    }

    fn backward(&mut self, dout: &[Volume], _input: &[Volume], calc_dx: bool) {
        self.norm.backward(dout, calc_dx);
    }

    fn input_gradient(&self) -> &[Volume] {
        self.norm.input_gradient()
    }

    fn update_weights(&mut self, optimizer: &Optimizer) {
        self.norm.update(optimizer);
    }

    fn reset_optimizer_state(&mut self) {
        self.norm.reset_state();
    }

    fn trainable_params(&self) -> usize {
        self.norm.len()
    }

    fn param(&self, index: usize) -> f64 {
        self.norm.param(index)
    }

    fn set_param(&mut self, index: usize, value: f64) {
        self.norm.set_param(index, value)
    }

    fn gradient(&self, index: usize) -> f64 {
        self.norm.gradient(index)
    }

    fn zero_gradients(&mut self) {
        self.norm.zero_gradients();
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        self.norm.write("batchnorm", out)
    }
}
