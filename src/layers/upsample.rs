//! Nearest-neighbour upsampling by an integer factor.
//!
//! Output element `(i, j, d)` copies input `(i / scale, j / scale, d)`, so backward sums
//! the output gradient over each `scale × scale` block. Used by decoder stacks.

use crate::error::{invalid_hyperparameter, Result};
use crate::layers::r#trait::{check_batch, write_header, Layer, SampleLayer};
use crate::serialization::TokenReader;
use crate::tensor::{Shape, Volume};
use rayon::prelude::*;
use std::io::Write;

pub struct UpsampleLayer {
    input: Shape,
    output: Shape,
    scale: usize,
    outputs: Vec<Volume>,
    input_grads: Vec<Volume>,

    sample_output: Volume,
    local_derivative: Volume,
    propagated: Volume,
}

impl UpsampleLayer {
    pub fn new(input: Shape, scale: usize) -> Result<Self> {
        input.validate()?;
        if scale == 0 {
            return Err(invalid_hyperparameter("upsample scale must be >= 1"));
        }
        let output = match (input.width.checked_mul(scale), input.height.checked_mul(scale)) {
            (Some(width), Some(height)) => Shape::new(width, height, input.depth),
            _ => {
                return Err(invalid_hyperparameter(format!(
                    "upsample scale {} overflows {}",
                    scale, input
                )))
            }
        };
        output.validate()?;
        Ok(Self {
            input,
            output,
            scale,
            outputs: Vec::new(),
            input_grads: Vec::new(),
            sample_output: Volume::zeros(output),
            local_derivative: Volume::filled(output, 1.0),
            propagated: Volume::zeros(output),
        })
    }

    /// Reads the body of an `upsample` record.
    pub fn load(input: Shape, reader: &mut TokenReader) -> Result<Self> {
        Self::new(input, reader.parse("upsample scale")?)
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    fn expand(&self, x: &Volume) -> Volume {
        let mut y = Volume::zeros(self.output);
        for i in 0..self.output.height {
            for j in 0..self.output.width {
                for d in 0..self.output.depth {
                    y.set(i, j, d, x.get(i / self.scale, j / self.scale, d));
                }
            }
        }
        y
    }

    fn collapse(&self, g: &Volume) -> Volume {
        let mut dx = Volume::zeros(self.input);
        for i in 0..self.output.height {
            for j in 0..self.output.width {
                for d in 0..self.output.depth {
                    dx.add(i / self.scale, j / self.scale, d, g.get(i, j, d));
                }
            }
        }
        dx
    }
}

impl Layer for UpsampleLayer {
    fn kind(&self) -> &'static str {
        "upsample"
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
        check_batch("upsample", "input", input, self.input);
        input.par_iter().map(|x| self.expand(x)).collect()
    }

    fn backward(&mut self, dout: &[Volume], _input: &[Volume], calc_dx: bool) {
        check_batch("upsample", "gradient", dout, self.output);
        if calc_dx {
            self.input_grads = dout.par_iter().map(|g| self.collapse(g)).collect();
        }
    }

    fn input_gradient(&self) -> &[Volume] {
        &self.input_grads
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        write_header(out, "upsample", self.input)?;
        writeln!(out, " {}", self.scale)?;
        Ok(())
    }

    fn as_sample_layer(&mut self) -> Option<&mut dyn SampleLayer> {
        Some(self)
    }
}

impl SampleLayer for UpsampleLayer {
    fn forward_sample(&mut self, input: &Volume) {
        check_batch("upsample", "input", std::slice::from_ref(input), self.input);
        self.sample_output = self.expand(input);
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
        *gradient = self.collapse(&self.propagated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsample_forward_backward() {
        let mut layer = UpsampleLayer::new(Shape::new(2, 1, 1), 2).unwrap();
        assert_eq!(layer.output_shape(), Shape::new(4, 2, 1));
        let x = vec![Volume::from_planes(2, 1, &[vec![1.0, 2.0]]).unwrap()];
        layer.forward(&x);
        assert_eq!(layer.output()[0].plane(0), vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);

        let g = Volume::from_planes(4, 2, &[vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]]).unwrap();
        layer.backward(&[g], &x, true);
        assert_eq!(layer.input_gradient()[0].plane(0), vec![14.0, 22.0]);
    }
}
