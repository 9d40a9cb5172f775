//! Trainable parameter groups
//!
//! A [`ParamGroup`] keeps a block of weights together with its summed gradients and the
//! optimizer accumulators that belong to each weight. Convolution filters, dense weight
//! matrices, biases and normalization scales are all stored this way, which gives every
//! layer the same flat parameter indexing for gradient checking.

use crate::optimizers::{Optimizer, ParamState};
use crate::tensor::{Shape, Volume};

#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub values: Volume,
    pub grads: Volume,
    pub state: ParamState,
}

impl ParamGroup {
    pub fn new(values: Volume) -> Self {
        let shape = values.shape();
        Self {
            grads: Volume::zeros(shape),
            state: ParamState::new(shape.len()),
            values,
        }
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::new(Volume::zeros(shape))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Applies `grads * scale` through the optimizer.
    pub fn apply(&mut self, optimizer: &Optimizer, scale: f64) {
        optimizer.update_group(
            self.values.data_mut(),
            self.grads.data(),
            scale,
            &mut self.state,
        );
    }

    pub fn zero_grad(&mut self) {
        self.grads.zero();
    }
}

/// Maps a flat parameter index onto `(group, offset)`.
pub fn locate(lengths: impl IntoIterator<Item = usize>, index: usize) -> (usize, usize) {
    let mut remaining = index;
    for (g, len) in lengths.into_iter().enumerate() {
        if remaining < len {
            return (g, remaining);
        }
        remaining -= len;
    }
    panic!("parameter index {} out of range", index)
}

/// Value of flat parameter `index` across `groups`.
pub fn get_param(groups: &[&ParamGroup], index: usize) -> f64 {
    let (g, o) = locate(groups.iter().map(|p| p.len()), index);
    groups[g].values[o]
}

pub fn set_param(groups: &mut [&mut ParamGroup], index: usize, value: f64) {
    let (g, o) = locate(groups.iter().map(|p| p.len()), index);
    groups[g].values[o] = value;
}

/// Summed gradient of flat parameter `index`, divided by the sample count.
pub fn get_gradient(groups: &[&ParamGroup], index: usize, count: SampleCount) -> f64 {
    let (g, o) = locate(groups.iter().map(|p| p.len()), index);
    groups[g].grads[o] * count.scale()
}

/// Gradient sums plus the number of samples they cover.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleCount(usize);

impl SampleCount {
    pub fn add(&mut self, samples: usize) {
        self.0 += samples;
    }

    pub fn get(&self) -> usize {
        self.0
    }

    /// `1 / samples`, or 1 when nothing was accumulated.
    pub fn scale(&self) -> f64 {
        1.0 / self.0.max(1) as f64
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}
