//! Activation functions for neural networks
//!
//! [`Activation`] is the closed set of nonlinearities the engine knows. Element-wise
//! variants expose their value and their derivative with respect to the pre-activation
//! input; the derivative is what layers cache as their local derivative during forward.
//! `Softmax` couples every element of a volume and is evaluated with [`softmax`] and
//! [`softmax_backward`] instead.

use crate::error::{Error, Result};
use std::fmt;

/// Nonlinearity selector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Identity,
    ReLU,
    LeakyReLU { alpha: f64 },
    Sigmoid,
    Tanh,
    Elu { alpha: f64 },
    Softplus,
    Swish,
    Softmax,
}

pub const DEFAULT_LEAKY_ALPHA: f64 = 0.01;
pub const DEFAULT_ELU_ALPHA: f64 = 1.0;

impl Activation {
    /// Parses a layer-type token such as `relu` or `leaky_relu`.
    pub fn from_name(name: &str, alpha: Option<f64>) -> Result<Self> {
        let activation = match name {
            "identity" | "linear" | "none" => Activation::Identity,
            "relu" => Activation::ReLU,
            "leaky_relu" => Activation::LeakyReLU {
                alpha: alpha.unwrap_or(DEFAULT_LEAKY_ALPHA),
            },
            "sigmoid" => Activation::Sigmoid,
            "tanh" => Activation::Tanh,
            "elu" => Activation::Elu {
                alpha: alpha.unwrap_or(DEFAULT_ELU_ALPHA),
            },
            "softplus" => Activation::Softplus,
            "swish" => Activation::Swish,
            "softmax" => Activation::Softmax,
            other => return Err(Error::UnknownLayer(other.to_string())),
        };
        Ok(activation)
    }

    /// Serialization token.
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Identity => "identity",
            Activation::ReLU => "relu",
            Activation::LeakyReLU { .. } => "leaky_relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Elu { .. } => "elu",
            Activation::Softplus => "softplus",
            Activation::Swish => "swish",
            Activation::Softmax => "softmax",
        }
    }

    /// Shape parameter carried by the variant, 0 for parameterless ones.
    pub fn alpha(&self) -> f64 {
        match self {
            Activation::LeakyReLU { alpha } | Activation::Elu { alpha } => *alpha,
            _ => 0.0,
        }
    }

    pub fn is_elementwise(&self) -> bool {
        !matches!(self, Activation::Softmax)
    }

    /// Value at pre-activation `x`.
    pub fn apply(&self, x: f64) -> f64 {
        match *self {
            Activation::Identity => x,
            Activation::ReLU => relu(x),
            Activation::LeakyReLU { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::Elu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * (x.exp() - 1.0)
                }
            }
            Activation::Softplus => softplus(x),
            Activation::Swish => x * sigmoid(x),
            Activation::Softmax => panic!("softmax is not an element-wise activation"),
        }
    }

    /// Derivative with respect to the pre-activation `x`; `y` is `apply(x)`.
    pub fn derivative(&self, x: f64, y: f64) -> f64 {
        match *self {
            Activation::Identity => 1.0,
            Activation::ReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyReLU { alpha } => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Sigmoid => sigmoid_derivative(y),
            Activation::Tanh => 1.0 - y * y,
            Activation::Elu { alpha } => {
                if x > 0.0 {
                    1.0
                } else {
                    y + alpha
                }
            }
            Activation::Softplus => sigmoid(x),
            Activation::Swish => {
                let s = sigmoid(x);
                s + x * s * (1.0 - s)
            }
            Activation::Softmax => panic!("softmax is not an element-wise activation"),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sigmoid activation function.
///
/// Returns the sigmoid of the input: 1 / (1 + exp(-x))
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Sigmoid derivative assuming y = sigmoid(x).
pub fn sigmoid_derivative(y: f64) -> f64 {
    y * (1.0 - y)
}

pub fn relu(x: f64) -> f64 {
    if x > 0.0 {
        x
    } else {
        0.0
    }
}

/// Numerically stable ln(1 + e^x).
pub fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Softmax over a whole slice, using the max-subtraction trick for stability.
pub fn softmax(input: &[f64], output: &mut [f64]) {
    assert_eq!(input.len(), output.len(), "softmax length mismatch");
    if input.is_empty() {
        return;
    }
    let max_value = input.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for (o, &x) in output.iter_mut().zip(input.iter()) {
        *o = (x - max_value).exp();
        sum += *o;
    }
    let inv_sum = 1.0 / sum;
    output.iter_mut().for_each(|o| *o *= inv_sum);
}

/// Jacobian-vector product of softmax: `dx = y ⊙ (dy - Σ dy ⊙ y)`.
pub fn softmax_backward(output: &[f64], grad_output: &[f64], grad_input: &mut [f64]) {
    let dot: f64 = output
        .iter()
        .zip(grad_output.iter())
        .map(|(y, g)| y * g)
        .sum();
    for ((dx, &y), &g) in grad_input.iter_mut().zip(output).zip(grad_output) {
        *dx = y * (g - dot);
    }
}
