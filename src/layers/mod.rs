//! Layer abstractions for neural networks
//!
//! This module provides the [`Layer`] and [`SampleLayer`] traits, every layer kind of the
//! engine, and the two factories that create layers by name: [`create_layer`] from a
//! key/value selection and [`read_layer`] from a saved model record.

mod r#trait;
pub mod activation;
pub mod batchnorm;
pub mod batchnorm2d;
pub mod chain;
pub mod composite;
pub mod conv;
pub mod conv2d;
pub mod dense;
pub mod dropout;
pub mod params;
pub mod pool;
pub mod reshape;
pub mod residual;
pub mod upsample;

// Re-export the layer traits and kinds for convenience
pub use activation::ActivationLayer;
pub use batchnorm::{BatchNormLayer, Normalizer};
pub use batchnorm2d::BatchNorm2DLayer;
pub use chain::Chain;
pub use composite::{CompositeKind, CompositeLayer, Merge};
pub use conv::ConvLayer;
pub use conv2d::{ConvBatchLayer, ConvGeometry};
pub use dense::FullyConnectedLayer;
pub use dropout::DropoutLayer;
pub use pool::{AvgPoolLayer, MaxPoolLayer};
pub use r#trait::{Layer, SampleLayer};
pub use reshape::ReshapeLayer;
pub use upsample::UpsampleLayer;

use crate::config::Params;
use crate::error::{Error, Result};
use crate::serialization::TokenReader;
use crate::tensor::Shape;
use crate::utils::{Activation, EngineRng};

/// Reads one layer record (`kind width height depth ...`) from a model file.
///
/// Composite records recurse into their branch records.
pub fn read_layer(reader: &mut TokenReader, rng: &mut EngineRng) -> Result<Box<dyn Layer>> {
    let kind = reader.next_token("layer kind")?.to_string();
    let input = reader.shape("layer input shape")?;
    let layer: Box<dyn Layer> = match kind.as_str() {
        "fc" => Box::new(FullyConnectedLayer::load(input, reader)?),
        "conv" => Box::new(ConvLayer::load(input, reader)?),
        "conv_batch" => Box::new(ConvBatchLayer::load(input, reader)?),
        "maxpool" => Box::new(MaxPoolLayer::load(input, reader)?),
        "avgpool" => Box::new(AvgPoolLayer::load(input, reader)?),
        "batchnorm" => Box::new(BatchNormLayer::load(input, reader)?),
        "batchnorm2d" => Box::new(BatchNorm2DLayer::load(input, reader)?),
        "dropout" => Box::new(DropoutLayer::load(input, reader, rng)?),
        "reshape" => Box::new(ReshapeLayer::load(input, reader)?),
        "upsample" => Box::new(UpsampleLayer::load(input, reader)?),
        "block" => Box::new(CompositeLayer::load_block(input, reader, rng)?),
        "inception" => Box::new(CompositeLayer::load_inception(input, reader, rng)?),
        "residual" => Box::new(CompositeLayer::load_residual(input, reader, rng)?),
        name => Box::new(ActivationLayer::load(name, input, reader)?),
    };
    Ok(layer)
}

/// Creates a non-composite layer of kind `kind` reading its hyperparameters from `params`.
///
/// | kind | keys (default) |
/// |---|---|
/// | `fc` | `neurons`, `activation` (`identity`), `alpha` |
/// | `conv`, `conv_batch` | `filters`, `size`, `stride` (1), `padding` (0) |
/// | `maxpool`, `avgpool`, `upsample` | `scale` (2) |
/// | `batchnorm`, `batchnorm2d` | `momentum` (0.9) |
/// | `dropout` | `rate` |
/// | `reshape` | `width`, `height`, `depth` |
/// | activation name | `alpha` |
///
/// Composite layers need branch chains and are built by
/// [`crate::architecture::build_layer`] or their own constructors.
pub fn create_layer(
    kind: &str,
    input: Shape,
    params: &Params,
    rng: &mut EngineRng,
) -> Result<Box<dyn Layer>> {
    let layer: Box<dyn Layer> = match kind {
        "fc" => {
            let name = params.get_str("activation").unwrap_or("identity");
            let alpha = if params.has("alpha") {
                Some(params.get::<f64>("alpha")?)
            } else {
                None
            };
            Box::new(FullyConnectedLayer::new(
                input,
                params.get("neurons")?,
                Activation::from_name(name, alpha)?,
                rng,
            )?)
        }
        "conv" => Box::new(ConvLayer::new(
            input,
            params.get("filters")?,
            params.get("size")?,
            params.get_or("stride", 1)?,
            params.get_or("padding", 0)?,
            rng,
        )?),
        "conv_batch" => Box::new(ConvBatchLayer::new(
            input,
            params.get("filters")?,
            params.get("size")?,
            params.get_or("stride", 1)?,
            params.get_or("padding", 0)?,
            rng,
        )?),
        "maxpool" => Box::new(MaxPoolLayer::new(input, params.get_or("scale", 2)?)?),
        "avgpool" => Box::new(AvgPoolLayer::new(input, params.get_or("scale", 2)?)?),
        "upsample" => Box::new(UpsampleLayer::new(input, params.get_or("scale", 2)?)?),
        "batchnorm" => Box::new(BatchNormLayer::new(
            input,
            params.get_or("momentum", batchnorm::DEFAULT_MOMENTUM)?,
        )?),
        "batchnorm2d" => Box::new(BatchNorm2DLayer::new(
            input,
            params.get_or("momentum", batchnorm::DEFAULT_MOMENTUM)?,
        )?),
        "dropout" => Box::new(DropoutLayer::new(input, params.get("rate")?, rng)?),
        "reshape" => Box::new(ReshapeLayer::new(
            input,
            Shape::new(
                params.get("width")?,
                params.get("height")?,
                params.get("depth")?,
            ),
        )?),
        "block" | "inception" | "residual" => {
            return Err(Error::Unsupported(format!(
                "{} layers are built from branch descriptions",
                kind
            )))
        }
        name => {
            let alpha = if params.has("alpha") {
                Some(params.get::<f64>("alpha")?)
            } else {
                None
            };
            Box::new(ActivationLayer::new(input, Activation::from_name(name, alpha)?)?)
        }
    };
    Ok(layer)
}
