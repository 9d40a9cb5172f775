//! Ordered layer sequences
//!
//! A [`Chain`] owns its layers and threads activations forward and gradients backward
//! through them. The network is a chain, and so is every branch of a composite layer.
//! An empty chain is the identity: its output is its input and its input gradient is the
//! upstream gradient.

use crate::error::{shape_mismatch, Result};
use crate::layers::r#trait::Layer;
use crate::layers::read_layer;
use crate::optimizers::Optimizer;
use crate::serialization::TokenReader;
use crate::tensor::{Shape, Volume};
use crate::utils::EngineRng;
use std::io::Write;

pub struct Chain {
    input_shape: Shape,
    layers: Vec<Box<dyn Layer>>,
}

impl Chain {
    pub fn new(input_shape: Shape) -> Self {
        Self {
            input_shape,
            layers: Vec::new(),
        }
    }

    /// Appends a layer whose input shape must equal the current output shape.
    pub fn push(&mut self, layer: Box<dyn Layer>) -> Result<()> {
        let expected = self.output_shape();
        if layer.input_shape() != expected {
            return Err(shape_mismatch(format!(
                "{} layer expects input {}, previous output is {}",
                layer.kind(),
                layer.input_shape(),
                expected
            )));
        }
        self.layers.push(layer);
        Ok(())
    }

    /// Reads `count` consecutive layer records.
    pub fn load(
        input_shape: Shape,
        count: usize,
        reader: &mut TokenReader,
        rng: &mut EngineRng,
    ) -> Result<Self> {
        let mut chain = Self::new(input_shape);
        for _ in 0..count {
            chain.push(read_layer(reader, rng)?)?;
        }
        Ok(chain)
    }

    pub fn input_shape(&self) -> Shape {
        self.input_shape
    }

    pub fn output_shape(&self) -> Shape {
        self.layers
            .last()
            .map(|l| l.output_shape())
            .unwrap_or(self.input_shape)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }

    /// Training-mode forward through every layer.
    pub fn forward(&mut self, input: &[Volume]) {
        for k in 0..self.layers.len() {
            let (before, rest) = self.layers.split_at_mut(k);
            let x = match before.last() {
                Some(prev) => prev.output(),
                None => input,
            };
            rest[0].forward(x);
        }
    }

    /// Outputs of the last [`Chain::forward`]; `input` itself for an empty chain.
    pub fn output<'a>(&'a self, input: &'a [Volume]) -> &'a [Volume] {
        match self.layers.last() {
            Some(last) => last.output(),
            None => input,
        }
    }

    pub fn forward_output(&self, input: &[Volume]) -> Vec<Volume> {
        let mut current = input.to_vec();
        for layer in &self.layers {
            current = layer.forward_output(&current);
        }
        current
    }

    /// Backward through every layer in reverse order.
    ///
    /// `input` must be the batch passed to the preceding [`Chain::forward`]. The first
    /// layer computes an input gradient only when `calc_dx` is true.
    pub fn backward(&mut self, dout: &[Volume], input: &[Volume], calc_dx: bool) {
        for k in (0..self.layers.len()).rev() {
            let (before, rest) = self.layers.split_at_mut(k);
            let (current, after) = rest.split_at_mut(1);
            let x = match before.last() {
                Some(prev) => prev.output(),
                None => input,
            };
            let upstream = match after.first() {
                Some(next) => next.input_gradient(),
                None => dout,
            };
            current[0].backward(upstream, x, k > 0 || calc_dx);
        }
    }

    /// Input gradient of the last [`Chain::backward`] with `calc_dx = true`.
    pub fn input_gradient<'a>(&'a self, dout: &'a [Volume]) -> &'a [Volume] {
        match self.layers.first() {
            Some(first) => first.input_gradient(),
            None => dout,
        }
    }

    pub fn update_weights(&mut self, optimizer: &Optimizer) {
        for layer in &mut self.layers {
            layer.update_weights(optimizer);
        }
    }

    pub fn reset_optimizer_state(&mut self) {
        for layer in &mut self.layers {
            layer.reset_optimizer_state();
        }
    }

    pub fn zero_gradients(&mut self) {
        for layer in &mut self.layers {
            layer.zero_gradients();
        }
    }

    pub fn trainable_params(&self) -> usize {
        self.layers.iter().map(|l| l.trainable_params()).sum()
    }

    fn locate(&self, index: usize) -> (usize, usize) {
        crate::layers::params::locate(self.layers.iter().map(|l| l.trainable_params()), index)
    }

    pub fn param(&self, index: usize) -> f64 {
        let (l, p) = self.locate(index);
        self.layers[l].param(p)
    }

    pub fn set_param(&mut self, index: usize, value: f64) {
        let (l, p) = self.locate(index);
        self.layers[l].set_param(p, value)
    }

    pub fn gradient(&self, index: usize) -> f64 {
        let (l, p) = self.locate(index);
        self.layers[l].gradient(p)
    }

    /// Writes every layer record in order.
    pub fn save(&self, out: &mut dyn Write) -> Result<()> {
        for layer in &self.layers {
            layer.save(out)?;
        }
        Ok(())
    }
}
