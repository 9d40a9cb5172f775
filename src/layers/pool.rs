//! Max and average pooling over non-overlapping `scale × scale` windows
//!
//! Both layers require the input width and height to be multiples of `scale`; the output
//! is `(width / scale) × (height / scale) × depth`.
//!
//! In the single-sample convention the local derivative of a pooling layer is shaped like
//! its input: the arg-max mask for max pooling, `1 / scale²` everywhere for average
//! pooling. `backward_sample` keeps the incoming output gradient as the propagated
//! gradient, expands it over each window and multiplies it by that derivative.

use crate::error::{invalid_hyperparameter, Result};
use crate::layers::r#trait::{check_batch, write_header, Layer, SampleLayer};
use crate::serialization::TokenReader;
use crate::tensor::{Shape, Volume};
use rayon::prelude::*;
use std::io::Write;

fn pooled_shape(kind: &str, input: Shape, scale: usize) -> Result<Shape> {
    input.validate()?;
    if scale == 0 {
        return Err(invalid_hyperparameter(format!("{} scale must be >= 1", kind)));
    }
    if input.width % scale != 0 || input.height % scale != 0 {
        return Err(invalid_hyperparameter(format!(
            "{} input {} is not divisible by scale {}",
            kind, input, scale
        )));
    }
    Ok(Shape::new(input.width / scale, input.height / scale, input.depth))
}

/// Repeats every output element over its window: `dx(i, j, d) = g(i / s, j / s, d)`.
fn expand(gradient: &Volume, input: Shape, scale: usize) -> Volume {
    let mut dx = Volume::zeros(input);
    for i in 0..input.height {
        for j in 0..input.width {
            for d in 0..input.depth {
                dx.set(i, j, d, gradient.get(i / scale, j / scale, d));
            }
        }
    }
    dx
}

/// Max pooling layer.
///
/// Forward records, per window and channel, the position of the maximum in a mask shaped
/// like the input. Ties go to the last maximal element in row-major scan order. Backward
/// routes the whole window gradient to that position.
pub struct MaxPoolLayer {
    input: Shape,
    output: Shape,
    scale: usize,
    outputs: Vec<Volume>,
    masks: Vec<Volume>,
    input_grads: Vec<Volume>,

    sample_output: Volume,
    sample_mask: Volume,
    propagated: Volume,
}

impl MaxPoolLayer {
    pub fn new(input: Shape, scale: usize) -> Result<Self> {
        let output = pooled_shape("maxpool", input, scale)?;
        Ok(Self {
            input,
            output,
            scale,
            outputs: Vec::new(),
            masks: Vec::new(),
            input_grads: Vec::new(),
            sample_output: Volume::zeros(output),
            sample_mask: Volume::zeros(input),
            propagated: Volume::zeros(output),
        })
    }

    /// Reads the body of a `maxpool` record.
    pub fn load(input: Shape, reader: &mut TokenReader) -> Result<Self> {
        Self::new(input, reader.parse("pool scale")?)
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    /// Pooled output and arg-max mask for one sample.
    fn pool(&self, x: &Volume) -> (Volume, Volume) {
        let s = self.scale;
        let mut out = Volume::zeros(self.output);
        let mut mask = Volume::zeros(self.input);
        for oy in 0..self.output.height {
            for ox in 0..self.output.width {
                for d in 0..self.input.depth {
                    let (mut best_i, mut best_j) = (oy * s, ox * s);
                    let mut best = x.get(best_i, best_j, d);
                    for i in oy * s..(oy + 1) * s {
                        for j in ox * s..(ox + 1) * s {
                            let v = x.get(i, j, d);
                            if v >= best {
                                best = v;
                                best_i = i;
                                best_j = j;
                            }
                        }
                    }
                    out.set(oy, ox, d, best);
                    mask.set(best_i, best_j, d, 1.0);
                }
            }
        }
        (out, mask)
    }

    fn route(&self, gradient: &Volume, mask: &Volume) -> Volume {
        let mut dx = expand(gradient, self.input, self.scale);
        dx.mul_assign(mask);
        dx
    }
}

impl Layer for MaxPoolLayer {
    fn kind(&self) -> &'static str {
        "maxpool"
    }

    fn input_shape(&self) -> Shape {
        self.input
    }

    fn output_shape(&self) -> Shape {
        self.output
    }

    fn forward(&mut self, input: &[Volume]) {
        check_batch("maxpool", "input", input, self.input);
        let (outputs, masks): (Vec<Volume>, Vec<Volume>) =
            input.par_iter().map(|x| self.pool(x)).unzip();
        self.outputs = outputs;
        self.masks = masks;
    }

    fn output(&self) -> &[Volume] {
        &self.outputs
    }

    fn forward_output(&self, input: &[Volume]) -> Vec<Volume> {
        check_batch("maxpool", "input", input, self.input);
        input.par_iter().map(|x| self.pool(x).0).collect()
    }

    fn backward(&mut self, dout: &[Volume], _input: &[Volume], calc_dx: bool) {
        check_batch("maxpool", "gradient", dout, self.output);
        assert_eq!(dout.len(), self.masks.len(), "maxpool backward batch mismatch");
        if calc_dx {
            self.input_grads = dout
                .par_iter()
                .zip(self.masks.par_iter())
                .map(|(g, m)| self.route(g, m))
                .collect();
        }
    }

    fn input_gradient(&self) -> &[Volume] {
        &self.input_grads
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        write_header(out, "maxpool", self.input)?;
        writeln!(out, " {}", self.scale)?;
        Ok(())
    }

    fn as_sample_layer(&mut self) -> Option<&mut dyn SampleLayer> {
        Some(self)
    }
}

impl SampleLayer for MaxPoolLayer {
    fn forward_sample(&mut self, input: &Volume) {
        check_batch("maxpool", "input", std::slice::from_ref(input), self.input);
        let (out, mask) = self.pool(input);
        self.sample_output = out;
        self.sample_mask = mask;
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
        self.propagated = gradient.clone();
        let dx = self.route(&self.propagated, &self.sample_mask);
        *gradient = dx;
    }
}

/// Average pooling layer.
pub struct AvgPoolLayer {
    input: Shape,
    output: Shape,
    scale: usize,
    outputs: Vec<Volume>,
    input_grads: Vec<Volume>,

    sample_output: Volume,
    local_derivative: Volume,
    propagated: Volume,
}

impl AvgPoolLayer {
    pub fn new(input: Shape, scale: usize) -> Result<Self> {
        let output = pooled_shape("avgpool", input, scale)?;
        Ok(Self {
            input,
            output,
            scale,
            outputs: Vec::new(),
            input_grads: Vec::new(),
            sample_output: Volume::zeros(output),
            local_derivative: Volume::filled(input, 1.0 / (scale * scale) as f64),
            propagated: Volume::zeros(output),
        })
    }

    /// Reads the body of an `avgpool` record.
    pub fn load(input: Shape, reader: &mut TokenReader) -> Result<Self> {
        Self::new(input, reader.parse("pool scale")?)
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    fn pool(&self, x: &Volume) -> Volume {
        let s = self.scale;
        let area = (s * s) as f64;
        let mut out = Volume::zeros(self.output);
        for i in 0..self.input.height {
            for j in 0..self.input.width {
                for d in 0..self.input.depth {
                    out.add(i / s, j / s, d, x.get(i, j, d));
                }
            }
        }
        out.scale(1.0 / area);
        out
    }

    fn spread(&self, gradient: &Volume) -> Volume {
        let mut dx = expand(gradient, self.input, self.scale);
        dx.scale(1.0 / (self.scale * self.scale) as f64);
        dx
    }
}

impl Layer for AvgPoolLayer {
    fn kind(&self) -> &'static str {
        "avgpool"
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
        check_batch("avgpool", "input", input, self.input);
        input.par_iter().map(|x| self.pool(x)).collect()
    }

    fn backward(&mut self, dout: &[Volume], _input: &[Volume], calc_dx: bool) {
        check_batch("avgpool", "gradient", dout, self.output);
        if calc_dx {
            self.input_grads = dout.par_iter().map(|g| self.spread(g)).collect();
        }
    }

    fn input_gradient(&self) -> &[Volume] {
        &self.input_grads
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        write_header(out, "avgpool", self.input)?;
        writeln!(out, " {}", self.scale)?;
        Ok(())
    }

    fn as_sample_layer(&mut self) -> Option<&mut dyn SampleLayer> {
        Some(self)
    }
}

impl SampleLayer for AvgPoolLayer {
    fn forward_sample(&mut self, input: &Volume) {
        check_batch("avgpool", "input", std::slice::from_ref(input), self.input);
        self.sample_output = self.pool(input);
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
        let mut dx = expand(gradient, self.input, self.scale);
        dx.mul_assign(&self.local_derivative);
        *gradient = dx;
    }
}
