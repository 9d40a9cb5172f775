//! Stand-alone activation layers
//!
//! One layer kind per [`Activation`] variant, serialized under the activation's name
//! (`relu`, `leaky_relu`, `sigmoid`, `tanh`, `elu`, `softplus`, `swish`, `softmax`).
//! Element-wise activations cache `f'(x)` as their local derivative. Softmax couples the
//! whole volume, so its backward pass applies the full Jacobian product; its cached local
//! derivative is only the Jacobian diagonal `y (1 - y)`.

use crate::error::Result;
use crate::layers::r#trait::{check_batch, write_header, Layer, SampleLayer};
use crate::serialization::{format_value, TokenReader};
use crate::tensor::{Shape, Volume};
use crate::utils::activations::{softmax, softmax_backward};
use crate::utils::Activation;
use rayon::prelude::*;
use std::io::Write;

pub struct ActivationLayer {
    activation: Activation,
    shape: Shape,
    outputs: Vec<Volume>,
    input_grads: Vec<Volume>,

    sample_output: Volume,
    local_derivative: Volume,
    propagated: Volume,
}

impl ActivationLayer {
    pub fn new(shape: Shape, activation: Activation) -> Result<Self> {
        shape.validate()?;
        Ok(Self {
            activation,
            shape,
            outputs: Vec::new(),
            input_grads: Vec::new(),
            sample_output: Volume::zeros(shape),
            local_derivative: Volume::zeros(shape),
            propagated: Volume::zeros(shape),
        })
    }

    /// Reads the body of an activation record; `name` is the record token.
    pub fn load(name: &str, shape: Shape, reader: &mut TokenReader) -> Result<Self> {
        let alpha = match name {
            "leaky_relu" | "elu" => Some(reader.parse("activation alpha")?),
            _ => None,
        };
        Self::new(shape, Activation::from_name(name, alpha)?)
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    fn apply(&self, x: &Volume) -> Volume {
        let mut y = Volume::zeros(x.shape());
        if self.activation.is_elementwise() {
            for (o, &v) in y.data_mut().iter_mut().zip(x.data()) {
                *o = self.activation.apply(v);
            }
        } else {
            softmax(x.data(), y.data_mut());
        }
        y
    }

    /// Gradient with respect to the input, given input `x`, output `y` and output gradient.
    fn input_grad(&self, x: &Volume, y: &Volume, dout: &Volume) -> Volume {
        let mut dx = Volume::zeros(x.shape());
        if self.activation.is_elementwise() {
            let terms = x.data().iter().zip(y.data()).zip(dout.data());
            for (d, ((&xv, &yv), &g)) in dx.data_mut().iter_mut().zip(terms) {
                *d = g * self.activation.derivative(xv, yv);
            }
        } else {
            softmax_backward(y.data(), dout.data(), dx.data_mut());
        }
        dx
    }
}

impl Layer for ActivationLayer {
    fn kind(&self) -> &'static str {
        self.activation.name()
    }

    fn input_shape(&self) -> Shape {
        self.shape
    }

    fn output_shape(&self) -> Shape {
        self.shape
    }

    fn forward(&mut self, input: &[Volume]) {
        self.outputs = self.forward_output(input);
    }

    fn output(&self) -> &[Volume] {
        &self.outputs
    }

    fn forward_output(&self, input: &[Volume]) -> Vec<Volume> {
        check_batch(self.kind(), "input", input, self.shape);
        input.par_iter().map(|x| self.apply(x)).collect()
    }

    fn backward(&mut self, dout: &[Volume], input: &[Volume], calc_dx: bool) {
        check_batch(self.kind(), "gradient", dout, self.shape);
        if calc_dx {
            self.input_grads = input
                .par_iter()
                .zip(self.outputs.par_iter())
                .zip(dout.par_iter())
                .map(|((x, y), g)| self.input_grad(x, y, g))
                .collect();
        }
    }

    fn input_gradient(&self) -> &[Volume] {
        &self.input_grads
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        write_header(out, self.activation.name(), self.shape)?;
        match self.activation {
            Activation::LeakyReLU { alpha } | Activation::Elu { alpha } => {
                writeln!(out, " {}", format_value(alpha))?
            }
            _ => writeln!(out)?,
        }
        Ok(())
    }

    fn as_sample_layer(&mut self) -> Option<&mut dyn SampleLayer> {
        Some(self)
    }
}

impl SampleLayer for ActivationLayer {
    fn forward_sample(&mut self, input: &Volume) {
        check_batch(self.kind(), "input", std::slice::from_ref(input), self.shape);
        self.sample_output = self.apply(input);
        let mut derivative = Volume::zeros(self.shape);
        let pairs = input.data().iter().zip(self.sample_output.data());
        for (d, (&x, &y)) in derivative.data_mut().iter_mut().zip(pairs) {
            *d = if self.activation.is_elementwise() {
                self.activation.derivative(x, y)
            } else {
                y * (1.0 - y)
            };
        }
        self.local_derivative = derivative;
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
        if self.activation.is_elementwise() {
            gradient.mul_assign(&self.local_derivative);
        } else {
            let mut dx = Volume::zeros(self.shape);
            softmax_backward(self.sample_output.data(), gradient.data(), dx.data_mut());
            *gradient = dx;
        }
        // Activation layers have no weights: the gradient at the pre-activation is the
        // gradient handed to the previous layer
        self.propagated = gradient.clone();
    }
}
