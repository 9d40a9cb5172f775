//! 2D convolution kernels and the batched convolution layer
//!
//! This module provides [`ConvGeometry`], which owns the stride/padding arithmetic and the
//! three convolution kernels (forward correlation, input gradient, filter gradient), and
//! [`ConvBatchLayer`], the batched convolution without a fused nonlinearity.
//!
//! # Output size
//!
//! ```text
//! out = (in - K + 2P) / S + 1
//! ```
//!
//! Construction fails unless `in - K + 2P` is a non-negative multiple of `S` in both
//! spatial dimensions.

use crate::error::{invalid_hyperparameter, Result};
use crate::layers::params::{self, ParamGroup, SampleCount};
use crate::layers::r#trait::{check_batch, write_header, Layer};
use crate::optimizers::Optimizer;
use crate::serialization::{write_group, TokenReader};
use crate::tensor::{Shape, Volume};
use crate::utils::EngineRng;
use rayon::prelude::*;
use std::io::Write;

/// Spatial hyperparameters of a convolution plus its derived output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub input: Shape,
    pub output: Shape,
    pub filters: usize,
    pub size: usize,
    pub stride: usize,
    pub padding: usize,
}

fn output_extent(extent: usize, size: usize, stride: usize, padding: usize, axis: &str) -> Result<usize> {
    let padded = padding
        .checked_mul(2)
        .and_then(|p| p.checked_add(extent))
        .ok_or_else(|| invalid_hyperparameter(format!("padding {} overflows {}", padding, axis)))?;
    if padded < size {
        return Err(invalid_hyperparameter(format!(
            "filter size {} exceeds padded {} {}",
            size, axis, padded
        )));
    }
    if (padded - size) % stride != 0 {
        return Err(invalid_hyperparameter(format!(
            "({} - {} + 2*{}) is not divisible by stride {} along {}",
            extent, size, padding, stride, axis
        )));
    }
    Ok((padded - size) / stride + 1)
}

impl ConvGeometry {
    /// # Arguments
    ///
    /// * `input` - Input volume shape
    /// * `filters` - Number of filters (output depth)
    /// * `size` - Square filter side `K`
    /// * `stride` - Step `S` between output positions
    /// * `padding` - Zero padding `P` on every side
    pub fn new(input: Shape, filters: usize, size: usize, stride: usize, padding: usize) -> Result<Self> {
        input.validate()?;
        if filters == 0 || size == 0 || stride == 0 {
            return Err(invalid_hyperparameter(format!(
                "convolution needs filters, size and stride >= 1 (got {}, {}, {})",
                filters, size, stride
            )));
        }
        let width = output_extent(input.width, size, stride, padding, "width")?;
        let height = output_extent(input.height, size, stride, padding, "height")?;
        let output = Shape::new(width, height, filters);
        output.validate()?;
        Shape::new(size, size, input.depth).validate()?;
        Ok(Self {
            input,
            output,
            filters,
            size,
            stride,
            padding,
        })
    }

    /// Shape of one filter: `K × K × input depth`.
    pub fn filter_shape(&self) -> Shape {
        Shape::new(self.size, self.size, self.input.depth)
    }

    /// Input coordinate under kernel offset `k` at output position `o`, if inside the input.
    #[inline]
    fn source(&self, o: usize, k: usize, extent: usize) -> Option<usize> {
        let pos = (o * self.stride + k) as isize - self.padding as isize;
        if pos < 0 || pos as usize >= extent {
            None
        } else {
            Some(pos as usize)
        }
    }

    /// Cross-correlation of `input` with every filter, plus the per-filter bias.
    pub fn correlate(&self, input: &Volume, filters: &[ParamGroup], bias: &ParamGroup) -> Volume {
        let depth = self.input.depth;
        let x = input.data();
        let mut out = Volume::zeros(self.output);
        for oy in 0..self.output.height {
            for ox in 0..self.output.width {
                for (f, filter) in filters.iter().enumerate() {
                    let w = &filter.values;
                    let mut sum = bias.values[f];
                    for a in 0..self.size {
                        let Some(y) = self.source(oy, a, self.input.height) else {
                            continue;
                        };
                        for b in 0..self.size {
                            let Some(xx) = self.source(ox, b, self.input.width) else {
                                continue;
                            };
                            let xo = input.offset(y, xx, 0);
                            let wo = w.offset(a, b, 0);
                            sum += w.data()[wo..wo + depth]
                                .iter()
                                .zip(&x[xo..xo + depth])
                                .map(|(p, q)| p * q)
                                .sum::<f64>();
                        }
                    }
                    out.set(oy, ox, f, sum);
                }
            }
        }
        out
    }

    /// Gradient with respect to the input for one sample.
    ///
    /// Full correlation of `dout` with each filter rotated by 180°, using padding
    /// `K - 1 - P`. With stride `S` only every `S`-th position of the dilated output
    /// gradient is non-zero, so offsets that do not land on it are skipped.
    pub fn input_gradient(&self, dout: &Volume, filters: &[ParamGroup]) -> Volume {
        let k = self.size as isize;
        let pad = k - 1 - self.padding as isize;
        let stride = self.stride as isize;
        let mut dx = Volume::zeros(self.input);
        for y in 0..self.input.height {
            for xx in 0..self.input.width {
                for a in 0..k {
                    let ty = y as isize + a - pad;
                    if ty < 0 || ty % stride != 0 || (ty / stride) as usize >= self.output.height {
                        continue;
                    }
                    let oy = (ty / stride) as usize;
                    let wa = (k - 1 - a) as usize;
                    for b in 0..k {
                        let tx = xx as isize + b - pad;
                        if tx < 0 || tx % stride != 0 || (tx / stride) as usize >= self.output.width {
                            continue;
                        }
                        let ox = (tx / stride) as usize;
                        let wb = (k - 1 - b) as usize;
                        for (f, filter) in filters.iter().enumerate() {
                            let g = dout.get(oy, ox, f);
                            if g == 0.0 {
                                continue;
                            }
                            let w = &filter.values;
                            let wo = w.offset(wa, wb, 0);
                            let xo = dx.offset(y, xx, 0);
                            for c in 0..self.input.depth {
                                dx[xo + c] += g * w[wo + c];
                            }
                        }
                    }
                }
            }
        }
        dx
    }

    /// Accumulates filter and bias gradients over a batch.
    ///
    /// Parallel over filters: every worker owns one filter's gradient volume, and returns
    /// that filter's bias gradient.
    pub fn accumulate_gradients(
        &self,
        filters: &mut [ParamGroup],
        bias: &mut ParamGroup,
        dout: &[Volume],
        input: &[Volume],
    ) {
        let depth = self.input.depth;
        let bias_sums: Vec<f64> = filters
            .par_iter_mut()
            .enumerate()
            .map(|(f, filter)| {
                let mut bias_sum = 0.0;
                for (g, x) in dout.iter().zip(input) {
                    for oy in 0..self.output.height {
                        for ox in 0..self.output.width {
                            let d = g.get(oy, ox, f);
                            if d == 0.0 {
                                continue;
                            }
                            bias_sum += d;
                            for a in 0..self.size {
                                let Some(y) = self.source(oy, a, self.input.height) else {
                                    continue;
                                };
                                for b in 0..self.size {
                                    let Some(xx) = self.source(ox, b, self.input.width) else {
                                        continue;
                                    };
                                    let xo = x.offset(y, xx, 0);
                                    let wo = filter.grads.offset(a, b, 0);
                                    let grads = &mut filter.grads.data_mut()[wo..wo + depth];
                                    for (gw, &xv) in grads.iter_mut().zip(&x.data()[xo..xo + depth]) {
                                        *gw += d * xv;
                                    }
                                }
                            }
                        }
                    }
                }
                bias_sum
            })
            .collect();
        for (f, sum) in bias_sums.into_iter().enumerate() {
            bias.grads[f] += sum;
        }
    }

    /// Writes `filters size stride padding` after the record header.
    pub(crate) fn write_hyperparameters(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, " {} {} {} {}", self.filters, self.size, self.stride, self.padding)
    }

    pub(crate) fn read(input: Shape, reader: &mut TokenReader) -> Result<Self> {
        let filters = reader.parse("filter count")?;
        let size = reader.parse("filter size")?;
        let stride = reader.parse("stride")?;
        let padding = reader.parse("padding")?;
        Self::new(input, filters, size, stride, padding)
    }
}

/// Filter bank plus biases shared by the convolution layer kinds.
#[derive(Debug, Clone)]
pub struct FilterBank {
    pub filters: Vec<ParamGroup>,
    pub bias: ParamGroup,
    pub samples: SampleCount,
}

impl FilterBank {
    /// He-initialized filters (`N(0, 2 / (K·K·C))`) and zero biases.
    pub fn new(geometry: &ConvGeometry, rng: &mut EngineRng) -> Self {
        let shape = geometry.filter_shape();
        let std_dev = (2.0 / shape.len() as f64).sqrt();
        let filters = (0..geometry.filters)
            .map(|_| {
                let mut values = Volume::zeros(shape);
                values.randomize(rng, 0.0, std_dev);
                ParamGroup::new(values)
            })
            .collect();
        Self {
            filters,
            bias: ParamGroup::zeros(Shape::flat(geometry.filters)),
            samples: SampleCount::default(),
        }
    }

    /// Reads `filter` groups followed by one `biases` group.
    pub fn read(geometry: &ConvGeometry, reader: &mut TokenReader) -> Result<Self> {
        let shape = geometry.filter_shape();
        let mut filters = Vec::with_capacity(geometry.filters);
        for _ in 0..geometry.filters {
            let values = reader.group("filter", shape.len())?;
            filters.push(ParamGroup::new(Volume::from_vec(shape, values)?));
        }
        let biases = reader.group("biases", geometry.filters)?;
        Ok(Self {
            filters,
            bias: ParamGroup::new(Volume::from_vec(Shape::flat(geometry.filters), biases)?),
            samples: SampleCount::default(),
        })
    }

    pub fn write(&self, out: &mut dyn Write) -> std::io::Result<()> {
        for filter in &self.filters {
            write_group(out, "filter", filter.values.data())?;
        }
        write_group(out, "biases", self.bias.values.data())
    }

    fn groups(&self) -> Vec<&ParamGroup> {
        self.filters.iter().chain(std::iter::once(&self.bias)).collect()
    }

    pub fn len(&self) -> usize {
        self.filters.iter().map(ParamGroup::len).sum::<usize>() + self.bias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn param(&self, index: usize) -> f64 {
        params::get_param(&self.groups(), index)
    }

    pub fn set_param(&mut self, index: usize, value: f64) {
        let mut groups: Vec<&mut ParamGroup> = self
            .filters
            .iter_mut()
            .chain(std::iter::once(&mut self.bias))
            .collect();
        params::set_param(&mut groups, index, value)
    }

    pub fn gradient(&self, index: usize) -> f64 {
        params::get_gradient(&self.groups(), index, self.samples)
    }

    pub fn accumulate(&mut self, geometry: &ConvGeometry, dout: &[Volume], input: &[Volume]) {
        geometry.accumulate_gradients(&mut self.filters, &mut self.bias, dout, input);
        self.samples.add(dout.len());
    }

    /// Parallel over filters, then the bias group.
    pub fn update(&mut self, optimizer: &Optimizer) {
        if self.samples.get() == 0 {
            return;
        }
        let scale = self.samples.scale();
        self.filters
            .par_iter_mut()
            .for_each(|filter| filter.apply(optimizer, scale));
        self.bias.apply(optimizer, scale);
        self.zero_gradients();
    }

    pub fn reset_state(&mut self) {
        for filter in &mut self.filters {
            filter.state.reset();
        }
        self.bias.state.reset();
    }

    pub fn zero_gradients(&mut self) {
        for filter in &mut self.filters {
            filter.zero_grad();
        }
        self.bias.zero_grad();
        self.samples.clear();
    }
}

/// Batched convolution layer without activation.
///
/// # Example
///
/// ```ignore
/// let mut rng = EngineRng::new(42);
/// // 3-channel 32x32 input, 16 filters of 3x3, stride 1, padding 1
/// let layer = ConvBatchLayer::new(Shape::new(32, 32, 3), 16, 3, 1, 1, &mut rng)?;
/// assert_eq!(layer.output_shape(), Shape::new(32, 32, 16));
/// ```
pub struct ConvBatchLayer {
    geometry: ConvGeometry,
    bank: FilterBank,
    outputs: Vec<Volume>,
    input_grads: Vec<Volume>,
}

impl ConvBatchLayer {
    pub fn new(
        input: Shape,
        filters: usize,
        size: usize,
        stride: usize,
        padding: usize,
        rng: &mut EngineRng,
    ) -> Result<Self> {
        let geometry = ConvGeometry::new(input, filters, size, stride, padding)?;
        Ok(Self {
            bank: FilterBank::new(&geometry, rng),
            geometry,
            outputs: Vec::new(),
            input_grads: Vec::new(),
        })
    }

    /// Reads the body of a `conv_batch` record.
    pub fn load(input: Shape, reader: &mut TokenReader) -> Result<Self> {
        let geometry = ConvGeometry::read(input, reader)?;
        Ok(Self {
            bank: FilterBank::read(&geometry, reader)?,
            geometry,
            outputs: Vec::new(),
            input_grads: Vec::new(),
        })
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
}

impl Layer for ConvBatchLayer {
    fn kind(&self) -> &'static str {
        "conv_batch"
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
        check_batch("conv_batch", "input", input, self.geometry.input);
        input
            .par_iter()
            .map(|x| self.geometry.correlate(x, &self.bank.filters, &self.bank.bias))
            .collect()
    }

    fn backward(&mut self, dout: &[Volume], input: &[Volume], calc_dx: bool) {
        check_batch("conv_batch", "gradient", dout, self.geometry.output);
        assert_eq!(dout.len(), input.len(), "conv_batch backward batch mismatch");
        self.bank.accumulate(&self.geometry, dout, input);
        if calc_dx {
            self.input_grads = dout
                .par_iter()
                .map(|g| self.geometry.input_gradient(g, &self.bank.filters))
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
        write_header(out, "conv_batch", self.geometry.input)?;
        self.geometry.write_hyperparameters(out)?;
        self.bank.write(out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_output_size_formula() {
        let g = ConvGeometry::new(Shape::new(5, 5, 3), 2, 3, 2, 1).unwrap();
        assert_eq!(g.output, Shape::new(3, 3, 2));
        let g = ConvGeometry::new(Shape::new(28, 28, 1), 8, 3, 1, 1).unwrap();
        assert_eq!(g.output, Shape::new(28, 28, 8));
        let g = ConvGeometry::new(Shape::new(7, 9, 1), 1, 3, 1, 0).unwrap();
        assert_eq!(g.output, Shape::new(5, 7, 1));
    }

    #[test]
    fn test_non_integral_output_rejected() {
        let err = ConvGeometry::new(Shape::new(6, 6, 1), 1, 3, 2, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidHyperparameter(_)));
        assert!(ConvGeometry::new(Shape::new(2, 2, 1), 1, 5, 1, 0).is_err());
        assert!(ConvGeometry::new(Shape::new(4, 4, 1), 1, 3, 0, 0).is_err());
    }

    #[test]
    fn test_input_gradient_matches_scatter() {
        // Scatter form: every output gradient spreads over its receptive field
        let mut rng = EngineRng::new(3);
        let layer = ConvBatchLayer::new(Shape::new(5, 5, 2), 3, 3, 2, 1, &mut rng).unwrap();
        let g = *layer.geometry();
        let mut dout = Volume::zeros(g.output);
        dout.randomize(&mut rng, 0.0, 1.0);

        let mut expected = Volume::zeros(g.input);
        for oy in 0..g.output.height {
            for ox in 0..g.output.width {
                for f in 0..g.filters {
                    for a in 0..g.size {
                        for b in 0..g.size {
                            let y = (oy * g.stride + a) as isize - g.padding as isize;
                            let x = (ox * g.stride + b) as isize - g.padding as isize;
                            if y < 0 || x < 0 || y >= 5 || x >= 5 {
                                continue;
                            }
                            for c in 0..2 {
                                let w = layer.bank.filters[f].values.get(a, b, c);
                                expected.add(y as usize, x as usize, c, dout.get(oy, ox, f) * w);
                            }
                        }
                    }
                }
            }
        }

        let dx = g.input_gradient(&dout, &layer.bank.filters);
        for (a, b) in dx.data().iter().zip(expected.data()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_bias_gradient_is_spatial_sum() {
        let mut rng = EngineRng::new(5);
        let mut layer = ConvBatchLayer::new(Shape::new(4, 4, 1), 2, 3, 1, 1, &mut rng).unwrap();
        let x = vec![Volume::filled(Shape::new(4, 4, 1), 1.0)];
        layer.forward(&x);
        let dout = vec![Volume::filled(Shape::new(4, 4, 2), 0.5)];
        layer.backward(&dout, &x, false);
        let bias_index = layer.trainable_params() - 2;
        assert!((layer.gradient(bias_index) - 8.0).abs() < 1e-12);
        assert!(layer.input_gradient().is_empty());
    }
}
