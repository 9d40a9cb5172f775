//! Dropout layer implementation
//!
//! This module provides a DropoutLayer that randomly zeroes activations during training
//! to prevent overfitting (Srivastava et al., 2014).
//!
//! Inverted dropout is used: kept units are scaled by `1 / (1 - rate)` during training so
//! that inference is a plain pass-through and needs no rescaling.
//!
//! - **Training mode** ([`Layer::forward`]): draws a fresh mask per sample from the layer's
//!   own generator
//! - **Inference mode** ([`Layer::forward_output`]): identity

use crate::error::{invalid_hyperparameter, Result};
use crate::layers::r#trait::{check_batch, write_header, Layer, SampleLayer};
use crate::serialization::{format_value, TokenReader};
use crate::tensor::{Shape, Volume};
use crate::utils::EngineRng;
use std::io::Write;

/// Dropout layer with an owned random generator.
///
/// # Fields
///
/// * `shape` - Input (and output) shape
/// * `rate` - Probability of dropping a unit, in `[0, 1)`
/// * `rng` - Generator forked from the one passed at construction
/// * `masks` - Per-sample scaled masks of the last training forward (`0` or `1 / (1 - rate)`)
///
/// # Example
///
/// ```ignore
/// let mut rng = EngineRng::new(42);
/// let mut layer = DropoutLayer::new(Shape::flat(512), 0.5, &mut rng)?;
/// layer.forward(&batch);                    // random mask
/// let y = layer.forward_output(&batch);     // identity
/// ```
pub struct DropoutLayer {
    shape: Shape,
    rate: f64,
    rng: EngineRng,
    masks: Vec<Volume>,
    outputs: Vec<Volume>,
    input_grads: Vec<Volume>,

    sample_output: Volume,
    sample_mask: Volume,
    propagated: Volume,
}

impl DropoutLayer {
    /// Create a new dropout layer.
    ///
    /// # Arguments
    ///
    /// * `shape` - Input (and output) shape
    /// * `rate` - Drop probability in `[0, 1)`
    /// * `rng` - Parent generator; the layer keeps a fork of it
    pub fn new(shape: Shape, rate: f64, rng: &mut EngineRng) -> Result<Self> {
        shape.validate()?;
        if !(0.0..1.0).contains(&rate) {
            return Err(invalid_hyperparameter(format!(
                "dropout rate must be in [0, 1), got {}",
                rate
            )));
        }
        Ok(Self {
            shape,
            rate,
            rng: rng.fork(),
            masks: Vec::new(),
            outputs: Vec::new(),
            input_grads: Vec::new(),
            sample_output: Volume::zeros(shape),
            sample_mask: Volume::filled(shape, 1.0),
            propagated: Volume::zeros(shape),
        })
    }

    /// Reads the body of a `dropout` record.
    pub fn load(shape: Shape, reader: &mut TokenReader, rng: &mut EngineRng) -> Result<Self> {
        Self::new(shape, reader.parse("dropout rate")?, rng)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Masks of the last training-mode forward.
    pub fn masks(&self) -> &[Volume] {
        &self.masks
    }

    fn draw_mask(&mut self) -> Volume {
        let scale = 1.0 / (1.0 - self.rate);
        let mut mask = Volume::zeros(self.shape);
        for m in mask.data_mut() {
            if self.rng.next_f64() >= self.rate {
                *m = scale;
            }
        }
        mask
    }
}

impl Layer for DropoutLayer {
    fn kind(&self) -> &'static str {
        "dropout"
    }

    fn is_stochastic(&self) -> bool {
        true
    }

    fn input_shape(&self) -> Shape {
        self.shape
    }

    fn output_shape(&self) -> Shape {
        self.shape
    }

    fn forward(&mut self, input: &[Volume]) {
        check_batch("dropout", "input", input, self.shape);
        // Masks are drawn sequentially so a seed fixes every mask of the run
        self.masks = (0..input.len()).map(|_| self.draw_mask()).collect();
        self.outputs = input
            .iter()
            .zip(&self.masks)
            .map(|(x, m)| {
                let mut y = x.clone();
                y.mul_assign(m);
                y
            })
            .collect();
    }

    fn output(&self) -> &[Volume] {
        &self.outputs
    }

    fn forward_output(&self, input: &[Volume]) -> Vec<Volume> {
        check_batch("dropout", "input", input, self.shape);
        input.to_vec()
    }

    fn backward(&mut self, dout: &[Volume], _input: &[Volume], calc_dx: bool) {
        check_batch("dropout", "gradient", dout, self.shape);
        assert_eq!(dout.len(), self.masks.len(), "dropout backward batch mismatch");
        if calc_dx {
            self.input_grads = dout
                .iter()
                .zip(&self.masks)
                .map(|(g, m)| {
                    let mut dx = g.clone();
                    dx.mul_assign(m);
                    dx
                })
                .collect();
        }
    }

    fn input_gradient(&self) -> &[Volume] {
        &self.input_grads
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        write_header(out, "dropout", self.shape)?;
        writeln!(out, " {}", format_value(self.rate))?;
        Ok(())
    }

    fn as_sample_layer(&mut self) -> Option<&mut dyn SampleLayer> {
        Some(self)
    }
}

impl SampleLayer for DropoutLayer {
    fn forward_sample(&mut self, input: &Volume) {
        check_batch("dropout", "input", std::slice::from_ref(input), self.shape);
        self.sample_mask = self.draw_mask();
        let mut y = input.clone();
        y.mul_assign(&self.sample_mask);
        self.sample_output = y;
    }

    fn sample_output(&self) -> &Volume {
        &self.sample_output
    }

    fn local_derivative(&self) -> &Volume {
        &self.sample_mask
    }

    fn propagated_gradient(&self) -> &Volume {
        &self.propagated
    }

    fn backward_sample(&mut self, gradient: &mut Volume) {
        gradient.mul_assign(&self.sample_mask);
        self.propagated = gradient.clone();
    }
}
