//! Layer trait definitions
//!
//! Every layer kind implements [`Layer`], the batched calling convention. Layers whose
//! math is per-sample also implement [`SampleLayer`], the single-sample convention in
//! which one gradient buffer is threaded backward through the whole network.

use crate::error::Result;
use crate::optimizers::Optimizer;
use crate::tensor::{Shape, Volume};
use std::io::Write;

/// Core trait for network layers (batched convention).
///
/// # Calling protocol
///
/// ```ignore
/// layer.forward(&batch);                          // training mode, caches what backward needs
/// let y = layer.output();                         // one volume per batch element
/// layer.backward(&dout, &batch, calc_dx);         // accumulates weight gradients
/// let dx = layer.input_gradient();                // only valid when calc_dx was true
/// layer.update_weights(&optimizer);               // once per batch
/// ```
///
/// `backward` must be called in strict reverse layer order, with the same `input` that was
/// passed to the preceding `forward`. Weight gradients are accumulated as sums over every
/// backpropagated sample; [`Layer::gradient`] and [`Layer::update_weights`] divide by the
/// number of samples seen since the last update.
///
/// # Panics
///
/// Hot-path methods panic when the batch volumes do not have the layer's declared shapes.
pub trait Layer: Send {
    /// Serialization token of the layer kind (e.g. `conv`, `batchnorm2d`).
    fn kind(&self) -> &'static str;

    fn input_shape(&self) -> Shape;

    fn output_shape(&self) -> Shape;

    /// Training-mode forward pass over a batch.
    fn forward(&mut self, input: &[Volume]);

    /// Outputs of the last [`Layer::forward`] call.
    fn output(&self) -> &[Volume];

    /// Inference-mode forward pass. Mutates nothing and is safe for a batch of one.
    fn forward_output(&self, input: &[Volume]) -> Vec<Volume>;

    /// Backward pass with the upstream gradient passed explicitly.
    ///
    /// When `calc_dx` is false the input gradient is not computed; the first layer of a
    /// chain never needs it.
    fn backward(&mut self, dout: &[Volume], input: &[Volume], calc_dx: bool);

    /// Input gradients produced by the last [`Layer::backward`] with `calc_dx = true`.
    fn input_gradient(&self) -> &[Volume];

    /// Apply the accumulated gradients through `optimizer`, then clear them.
    fn update_weights(&mut self, _optimizer: &Optimizer) {}

    /// Zero every per-weight optimizer accumulator.
    fn reset_optimizer_state(&mut self) {}

    /// Number of trainable scalars.
    fn trainable_params(&self) -> usize {
        0
    }

    fn param(&self, index: usize) -> f64 {
        panic!("{} has no trainable parameter {}", self.kind(), index)
    }

    fn set_param(&mut self, index: usize, _value: f64) {
        panic!("{} has no trainable parameter {}", self.kind(), index)
    }

    /// Batch-averaged gradient of trainable scalar `index`.
    fn gradient(&self, index: usize) -> f64 {
        panic!("{} has no trainable parameter {}", self.kind(), index)
    }

    fn zero_gradients(&mut self) {}

    /// Write this layer's record of the text model format.
    fn save(&self, out: &mut dyn Write) -> Result<()>;

    /// True if this layer, or any layer nested inside it, draws randomness in its
    /// training-mode forward pass.
    fn is_stochastic(&self) -> bool {
        false
    }

    /// Access to the single-sample convention, for layers that support it.
    fn as_sample_layer(&mut self) -> Option<&mut dyn SampleLayer> {
        None
    }
}

/// Single-sample calling convention.
///
/// `forward_sample` computes the output and caches the local derivative of the output with
/// respect to the layer's pre-activation values (1 where the value passed through, 0 where
/// it was clipped, the sigmoid slope, ...). `backward_sample` receives the gradient of the
/// loss with respect to this layer's output, multiplies it in place by that cached
/// derivative, keeps the result as the propagated gradient, accumulates weight gradients
/// from the stored forward input, and finally replaces the buffer with the gradient with
/// respect to the layer's input, ready for the previous layer.
pub trait SampleLayer {
    fn forward_sample(&mut self, input: &Volume);

    fn sample_output(&self) -> &Volume;

    /// d(output) / d(pre-activation), cached by the last `forward_sample`.
    fn local_derivative(&self) -> &Volume;

    /// d(loss) / d(pre-activation), kept by the last `backward_sample`.
    fn propagated_gradient(&self) -> &Volume;

    fn backward_sample(&mut self, gradient: &mut Volume);
}

/// Writes the `kind width height depth` prefix shared by every layer record.
pub(crate) fn write_header(out: &mut dyn Write, kind: &str, input: Shape) -> std::io::Result<()> {
    write!(out, "{} ", kind)?;
    input.write_to(out)
}

/// Asserts that every volume of a batch has `shape`.
pub(crate) fn check_batch(kind: &str, what: &str, batch: &[Volume], shape: Shape) {
    for (b, v) in batch.iter().enumerate() {
        assert_eq!(
            v.shape(),
            shape,
            "{} {} shape mismatch at batch element {}: expected {}, got {}",
            kind,
            what,
            b,
            shape,
            v.shape()
        );
    }
}
