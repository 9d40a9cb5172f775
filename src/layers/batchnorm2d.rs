//! Spatial batch normalization
//!
//! `BatchNorm2DLayer` keeps one (γ, β) pair and one pair of running statistics per
//! channel; statistics are reduced over the batch and the whole spatial extent. The
//! arithmetic is the shared [`Normalizer`] with one group per channel.

use crate::error::Result;
use crate::layers::batchnorm::Normalizer;
use crate::layers::r#trait::Layer;
use crate::optimizers::Optimizer;
use crate::serialization::TokenReader;
use crate::tensor::{Shape, Volume};
use std::io::Write;

pub struct BatchNorm2DLayer {
    norm: Normalizer,
}

impl BatchNorm2DLayer {
    pub fn new(shape: Shape, momentum: f64) -> Result<Self> {
        Ok(Self {
            norm: Normalizer::new(shape, shape.depth, momentum)?,
        })
    }

    /// Reads the body of a `batchnorm2d` record.
    pub fn load(shape: Shape, reader: &mut TokenReader) -> Result<Self> {
        Ok(Self {
            norm: Normalizer::read(shape, shape.depth, reader)?,
        })
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.norm
    }

    pub fn normalizer_mut(&mut self) -> &mut Normalizer {
        &mut self.norm
    }
}

impl Layer for BatchNorm2DLayer {
    fn kind(&self) -> &'static str {
        "batchnorm2d"
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
        self.norm.write("batchnorm2d", out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::EngineRng;

    #[test]
    fn test_one_parameter_pair_per_channel() {
        let layer = BatchNorm2DLayer::new(Shape::new(4, 4, 3), 0.9).unwrap();
        assert_eq!(layer.trainable_params(), 6);
        assert_eq!(layer.normalizer().running_mean().len(), 3);
    }

    #[test]
    fn test_channels_standardized_over_batch_and_space() {
        let mut rng = EngineRng::new(4);
        let shape = Shape::new(3, 2, 2);
        let batch: Vec<Volume> = (0..4)
            .map(|b| {
                let mut v = Volume::zeros(shape);
                v.randomize(&mut rng, b as f64, 2.0);
                v
            })
            .collect();
        let mut layer = BatchNorm2DLayer::new(shape, 0.9).unwrap();
        layer.forward(&batch);

        for d in 0..2 {
            let values: Vec<f64> = layer.output().iter().flat_map(|v| v.plane(d)).collect();
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let var = values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
            assert_eq!(values.len(), 4 * 6);
            assert!(mean.abs() < 1e-12);
            assert!((var - 1.0).abs() < 1e-6);
        }
    }
}
