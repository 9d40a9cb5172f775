//! Convolution layer with a fused ReLU
//!
//! `ConvLayer` (token `conv`) applies `max(0, x ∗ w + b)` in a single pass and caches the
//! rectifier derivative alongside the output. It supports both calling conventions. The
//! batched [`ConvBatchLayer`](crate::layers::ConvBatchLayer) (token `conv_batch`) is the
//! same convolution without the nonlinearity; the two are distinct layer kinds and
//! serialize under different tokens.

use crate::error::Result;
use crate::layers::conv2d::{ConvGeometry, FilterBank};
use crate::layers::r#trait::{check_batch, write_header, Layer, SampleLayer};
use crate::optimizers::Optimizer;
use crate::serialization::TokenReader;
use crate::tensor::{Shape, Volume};
use crate::utils::EngineRng;
use rayon::prelude::*;
use std::io::Write;

pub struct ConvLayer {
    geometry: ConvGeometry,
    bank: FilterBank,
    outputs: Vec<Volume>,
    input_grads: Vec<Volume>,

    sample_input: Volume,
    sample_output: Volume,
    local_derivative: Volume,
    propagated: Volume,
}

/// `relu(z)` in place; returns the 0/1 derivative mask.
fn rectify(z: &mut Volume) -> Volume {
    let mut mask = Volume::zeros(z.shape());
    for (v, m) in z.data_mut().iter_mut().zip(mask.data_mut()) {
        if *v > 0.0 {
            *m = 1.0;
        } else {
            *v = 0.0;
        }
    }
    mask
}

impl ConvLayer {
    /// # Arguments
    ///
    /// * `input` - Input volume shape
    /// * `filters` - Number of filters (output depth)
    /// * `size` - Square filter side
    /// * `stride` - Step between output positions
    /// * `padding` - Zero padding on every side
    /// * `rng` - Generator for He-initialized filters
    pub fn new(
        input: Shape,
        filters: usize,
        size: usize,
        stride: usize,
        padding: usize,
        rng: &mut EngineRng,
    ) -> Result<Self> {
        let geometry = ConvGeometry::new(input, filters, size, stride, padding)?;
        let bank = FilterBank::new(&geometry, rng);
        Ok(Self::from_parts(geometry, bank))
    }

    fn from_parts(geometry: ConvGeometry, bank: FilterBank) -> Self {
        Self {
            sample_input: Volume::zeros(geometry.input),
            sample_output: Volume::zeros(geometry.output),
            local_derivative: Volume::zeros(geometry.output),
            propagated: Volume::zeros(geometry.output),
            geometry,
            bank,
            outputs: Vec::new(),
            input_grads: Vec::new(),
        }
    }

    /// Reads the body of a `conv` record.
    pub fn load(input: Shape, reader: &mut TokenReader) -> Result<Self> {
        let geometry = ConvGeometry::read(input, reader)?;
        let bank = FilterBank::read(&geometry, reader)?;
        Ok(Self::from_parts(geometry, bank))
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    /// Filter `f` as a `K × K × C` volume.
    pub fn filter_mut(&mut self, f: usize) -> &mut Volume {
        &mut self.bank.filters[f].values
    }

    pub fn bias_mut(&mut self) -> &mut Volume {
        &mut self.bank.bias.values
    }

    fn activate(&self, input: &Volume) -> (Volume, Volume) {
        let mut out = self
            .geometry
            .correlate(input, &self.bank.filters, &self.bank.bias);
        let mask = rectify(&mut out);
        (out, mask)
    }
}

impl Layer for ConvLayer {
    fn kind(&self) -> &'static str {
        "conv"
    }

    fn input_shape(&self) -> Shape {
        self.geometry.input
    }

    fn output_shape(&self) -> Shape {
        self.geometry.output
    }

    fn forward(&mut self, input: &[Volume]) {
        self.outputs = self.forward_output(input);
    }

    fn output(&self) -> &[Volume] {
        &self.outputs
    }

    fn forward_output(&self, input: &[Volume]) -> Vec<Volume> {
        check_batch("conv", "input", input, self.geometry.input);
        input.par_iter().map(|x| self.activate(x).0).collect()
    }

    fn backward(&mut self, dout: &[Volume], input: &[Volume], calc_dx: bool) {
        check_batch("conv", "gradient", dout, self.geometry.output);
        assert_eq!(dout.len(), self.outputs.len(), "conv backward batch mismatch");
        // The rectifier passed exactly the positive outputs
        let deltas: Vec<Volume> = dout
            .par_iter()
            .zip(self.outputs.par_iter())
            .map(|(g, y)| {
                let mut d = g.clone();
                for (v, &o) in d.data_mut().iter_mut().zip(y.data()) {
                    if o <= 0.0 {
                        *v = 0.0;
                    }
                }
                d
            })
            .collect();
        self.bank.accumulate(&self.geometry, &deltas, input);
        if calc_dx {
            self.input_grads = deltas
                .par_iter()
                .map(|d| self.geometry.input_gradient(d, &self.bank.filters))
                .collect();
        }
    }

    fn input_gradient(&self) -> &[Volume] {
        &self.input_grads
    }

    fn update_weights(&mut self, optimizer: &Optimizer) {
        self.bank.update(optimizer);
    }

    fn reset_optimizer_state(&mut self) {
        self.bank.reset_state();
    }

    fn trainable_params(&self) -> usize {
        self.bank.len()
    }

    fn param(&self, index: usize) -> f64 {
        self.bank.param(index)
    }

    fn set_param(&mut self, index: usize, value: f64) {
        self.bank.set_param(index, value)
    }

    fn gradient(&self, index: usize) -> f64 {
        self.bank.gradient(index)
    }

    fn zero_gradients(&mut self) {
        self.bank.zero_gradients();
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        write_header(out, "conv", self.geometry.input)?;
        self.geometry.write_hyperparameters(out)?;
        self.bank.write(out)?;
        Ok(())
    }

    fn as_sample_layer(&mut self) -> Option<&mut dyn SampleLayer> {
        Some(self)
    }
}

impl SampleLayer for ConvLayer {
    fn forward_sample(&mut self, input: &Volume) {
        check_batch("conv", "input", std::slice::from_ref(input), self.geometry.input);
        let (out, mask) = self.activate(input);
        self.sample_input = input.clone();
        self.sample_output = out;
        self.local_derivative = mask;
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
        self.bank.accumulate(
            &self.geometry,
            std::slice::from_ref(&delta),
            std::slice::from_ref(&self.sample_input),
        );
        *gradient = self.geometry.input_gradient(&delta, &self.bank.filters);
        self.propagated = delta;
    }
}
