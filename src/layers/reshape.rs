//! Metadata-only reshape between two shapes with the same element count.

use crate::error::{Error, Result};
use crate::layers::r#trait::{check_batch, write_header, Layer, SampleLayer};
use crate::serialization::TokenReader;
use crate::tensor::{Shape, Volume};
use std::io::Write;

pub struct ReshapeLayer {
    input: Shape,
    output: Shape,
    outputs: Vec<Volume>,
    input_grads: Vec<Volume>,

    sample_output: Volume,
    local_derivative: Volume,
    propagated: Volume,
}

/// Same data, new dimensions. Shapes are checked at construction.
fn reinterpret(v: &Volume, shape: Shape) -> Volume {
    match v.clone().reshaped(shape) {
        Ok(r) => r,
        Err(e) => panic!("{}", e),
    }
}

impl ReshapeLayer {
    pub fn new(input: Shape, output: Shape) -> Result<Self> {
        input.validate()?;
        output.validate()?;
        if input.len() != output.len() {
            return Err(Error::DimensionMismatch(format!(
                "cannot reshape {} into {}",
                input, output
            )));
        }
        Ok(Self {
            input,
            output,
            outputs: Vec::new(),
            input_grads: Vec::new(),
            sample_output: Volume::zeros(output),
            local_derivative: Volume::filled(output, 1.0),
            propagated: Volume::zeros(output),
        })
    }

    /// Reads the body of a `reshape` record.
    pub fn load(input: Shape, reader: &mut TokenReader) -> Result<Self> {
        let output = reader.shape("reshape output shape")?;
        Self::new(input, output)
    }
}

impl Layer for ReshapeLayer {
    fn kind(&self) -> &'static str {
        "reshape"
    }

    fn input_shape(&self) -> Shape {
        self.input
    }

    fn output_shape(&self) -> Shape {
        self.output
    }

    fn forward(&mut self, input: &[Volume]) {
        self.outputs = self.forward_output(input);
    }

    fn output(&self) -> &[Volume] {
        &self.outputs
    }

    fn forward_output(&self, input: &[Volume]) -> Vec<Volume> {
        check_batch("reshape", "input", input, self.input);
        input.iter().map(|x| reinterpret(x, self.output)).collect()
    }

    fn backward(&mut self, dout: &[Volume], _input: &[Volume], calc_dx: bool) {
        check_batch("reshape", "gradient", dout, self.output);
        if calc_dx {
            self.input_grads = dout.iter().map(|g| reinterpret(g, self.input)).collect();
        }
    }

    fn input_gradient(&self) -> &[Volume] {
        &self.input_grads
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        write_header(out, "reshape", self.input)?;
        write!(out, " ")?;
        self.output.write_to(out)?;
        writeln!(out)?;
        Ok(())
    }

    fn as_sample_layer(&mut self) -> Option<&mut dyn SampleLayer> {
        Some(self)
    }
}

impl SampleLayer for ReshapeLayer {
    fn forward_sample(&mut self, input: &Volume) {
        check_batch("reshape", "input", std::slice::from_ref(input), self.input);
        self.sample_output = reinterpret(input, self.output);
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
        self.propagated = gradient.clone();
        *gradient = reinterpret(gradient, self.input);
    }
}
