//! Loss functions
//!
//! A [`Loss`] reduces a batch of network outputs and targets to the mean per-sample loss,
//! and produces for every sample the gradient of that sample's loss with respect to the
//! network output. The per-sample gradients seed the backward pass; layers divide their
//! accumulated weight gradients by the batch size, so the resulting update follows the
//! gradient of the mean.

use crate::error::{Error, Result};
use crate::tensor::Volume;
use std::fmt;

/// Lower clamp for probabilities inside logarithms.
pub const PROBABILITY_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Loss {
    /// `½ Σ (y - t)²`
    #[default]
    MeanSquaredError,
    /// `-Σ t ln y`, for softmax outputs with one-hot targets.
    CrossEntropy,
    /// `-Σ [t ln y + (1 - t) ln(1 - y)]`, for independent sigmoid outputs.
    BinaryCrossEntropy,
}

fn clamp_probability(y: f64) -> f64 {
    y.clamp(PROBABILITY_EPS, 1.0 - PROBABILITY_EPS)
}

impl Loss {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "mse" | "mean_squared_error" => Ok(Loss::MeanSquaredError),
            "cross_entropy" | "ce" => Ok(Loss::CrossEntropy),
            "binary_cross_entropy" | "bce" => Ok(Loss::BinaryCrossEntropy),
            other => Err(Error::UnknownLoss(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Loss::MeanSquaredError => "mse",
            Loss::CrossEntropy => "cross_entropy",
            Loss::BinaryCrossEntropy => "binary_cross_entropy",
        }
    }

    /// Loss of a single sample.
    pub fn sample_loss(&self, output: &Volume, target: &Volume) -> f64 {
        assert_eq!(
            output.len(),
            target.len(),
            "loss length mismatch: output {}, target {}",
            output.shape(),
            target.shape()
        );
        let pairs = output.data().iter().zip(target.data());
        match self {
            Loss::MeanSquaredError => 0.5 * pairs.map(|(&y, &t)| (y - t) * (y - t)).sum::<f64>(),
            Loss::CrossEntropy => -pairs.map(|(&y, &t)| t * clamp_probability(y).ln()).sum::<f64>(),
            Loss::BinaryCrossEntropy => -pairs
                .map(|(&y, &t)| {
                    let y = clamp_probability(y);
                    t * y.ln() + (1.0 - t) * (1.0 - y).ln()
                })
                .sum::<f64>(),
        }
    }

    /// Gradient of [`Loss::sample_loss`] with respect to `output`.
    pub fn sample_gradient(&self, output: &Volume, target: &Volume) -> Volume {
        assert_eq!(
            output.len(),
            target.len(),
            "loss length mismatch: output {}, target {}",
            output.shape(),
            target.shape()
        );
        let mut grad = Volume::zeros(output.shape());
        let pairs = output.data().iter().zip(target.data());
        for (g, (&y, &t)) in grad.data_mut().iter_mut().zip(pairs) {
            *g = match self {
                Loss::MeanSquaredError => y - t,
                Loss::CrossEntropy => -t / clamp_probability(y),
                Loss::BinaryCrossEntropy => {
                    let y = clamp_probability(y);
                    (y - t) / (y * (1.0 - y))
                }
            };
        }
        grad
    }

    /// Mean loss over the batch plus one output gradient per sample.
    pub fn evaluate(&self, outputs: &[Volume], targets: &[Volume]) -> (f64, Vec<Volume>) {
        assert_eq!(
            outputs.len(),
            targets.len(),
            "batch length mismatch: {} outputs, {} targets",
            outputs.len(),
            targets.len()
        );
        if outputs.is_empty() {
            return (0.0, Vec::new());
        }
        let total: f64 = outputs
            .iter()
            .zip(targets)
            .map(|(y, t)| self.sample_loss(y, t))
            .sum();
        let grads = outputs
            .iter()
            .zip(targets)
            .map(|(y, t)| self.sample_gradient(y, t))
            .collect();
        (total / outputs.len() as f64, grads)
    }
}

impl fmt::Display for Loss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
