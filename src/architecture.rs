//! Architecture configuration structures
//!
//! This module describes networks as JSON documents so architectures can be changed without
//! code changes. A description names the input shape and an ordered list of layers; every
//! layer names its kind with `layer_type` and carries its hyperparameters as sibling keys,
//! which reach [`create_layer`] as a [`Params`] lookup. Composite kinds (`block`,
//! `inception`, `residual`) nest their branches as lists of layer descriptions.
//!
//! Shapes are never written per layer: each layer's input shape is the previous layer's
//! output shape, starting from `input`.

use crate::config::Params;
use crate::error::{Error, Result};
use crate::layers::{create_layer, Chain, CompositeLayer, Layer, Merge};
use crate::network::Network;
use crate::tensor::Shape;
use crate::utils::EngineRng;
use log::debug;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Configuration for a single layer.
///
/// # Examples
///
/// ```json
/// { "layer_type": "conv_batch", "filters": 8, "size": 3, "padding": 1 }
/// ```
///
/// ```json
/// {
///   "layer_type": "residual",
///   "branches": [[
///     { "layer_type": "conv_batch", "filters": 8, "size": 3, "padding": 1 },
///     { "layer_type": "relu" }
///   ]]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct LayerSpec {
    /// Layer kind token, e.g. "fc", "conv", "maxpool", "tanh", "inception"
    pub layer_type: String,

    /// Branch layer lists of composite kinds; a residual layer has exactly one (its main path)
    #[serde(default)]
    pub branches: Vec<Vec<LayerSpec>>,

    /// Every other key, passed to the layer factory
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl LayerSpec {
    fn kind(&self) -> String {
        self.layer_type.to_lowercase()
    }

    fn is_composite(&self) -> bool {
        matches!(self.kind().as_str(), "block" | "inception" | "residual")
    }
}

/// Configuration for the entire network.
///
/// # Example
///
/// ```json
/// {
///   "input": { "width": 28, "height": 28, "depth": 1 },
///   "layers": [
///     { "layer_type": "conv", "filters": 8, "size": 5, "padding": 2 },
///     { "layer_type": "maxpool", "scale": 2 },
///     { "layer_type": "fc", "neurons": 10 },
///     { "layer_type": "softmax" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ArchitectureConfig {
    pub input: Shape,

    /// Layers applied in the order they appear
    pub layers: Vec<LayerSpec>,
}

/// Loads an architecture configuration from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use rust_convnet::architecture::{build_network, load_architecture};
///
/// let arch = load_architecture("config/architectures/mnist_cnn.json").unwrap();
/// let net = build_network(&arch, 42).unwrap();
/// assert_eq!(net.layers().len(), arch.layers.len());
/// ```
pub fn load_architecture<P: AsRef<Path>>(path: P) -> Result<ArchitectureConfig> {
    let contents = fs::read_to_string(path)?;
    parse_architecture(&contents)
}

/// Parses and validates an architecture configuration from JSON text.
pub fn parse_architecture(contents: &str) -> Result<ArchitectureConfig> {
    let config: ArchitectureConfig = serde_json::from_str(contents)?;
    validate_architecture(&config)?;
    Ok(config)
}

/// Validates an architecture configuration.
///
/// Checks that:
/// - the input shape has no zero dimension
/// - there is at least one layer
/// - composite layers have branches and other layers have none
/// - every layer can be built on its predecessor's output shape
pub fn validate_architecture(config: &ArchitectureConfig) -> Result<()> {
    config.input.validate()?;
    if config.layers.is_empty() {
        return Err(Error::InvalidParameter {
            key: "layers".to_string(),
            value: "[]".to_string(),
        });
    }
    validate_specs(&config.layers)?;

    // Building once resolves every hyperparameter and checks every connection
    build_network(config, 0).map(|_| ())
}

fn validate_specs(specs: &[LayerSpec]) -> Result<()> {
    for spec in specs {
        if spec.is_composite() {
            if spec.branches.is_empty() {
                return Err(Error::MissingParameter(format!(
                    "{}.branches",
                    spec.layer_type
                )));
            }
            if spec.kind() == "residual" && spec.branches.len() != 1 {
                return Err(Error::InvalidParameter {
                    key: "residual.branches".to_string(),
                    value: format!("{} branches", spec.branches.len()),
                });
            }
            for branch in &spec.branches {
                validate_specs(branch)?;
            }
        } else if !spec.branches.is_empty() {
            return Err(Error::InvalidParameter {
                key: format!("{}.branches", spec.layer_type),
                value: format!("{} branches", spec.branches.len()),
            });
        }
    }
    Ok(())
}

/// Builds one layer on `input`, recursing into composite branches.
pub fn build_layer(spec: &LayerSpec, input: Shape, rng: &mut EngineRng) -> Result<Box<dyn Layer>> {
    let kind = spec.kind();
    let params = Params::from_json(&spec.params);
    let layer: Box<dyn Layer> = match kind.as_str() {
        "block" => {
            let merge = Merge::from_name(params.get_str("merge").unwrap_or("stack"))?;
            let branches = build_branches(&spec.branches, input, rng)?;
            Box::new(CompositeLayer::block(input, branches, merge)?)
        }
        "inception" => {
            let branches = build_branches(&spec.branches, input, rng)?;
            Box::new(CompositeLayer::inception(input, branches)?)
        }
        "residual" => {
            let main = match spec.branches.as_slice() {
                [main] => build_chain(main, input, rng)?,
                _ => return Err(Error::MissingParameter("residual.branches".to_string())),
            };
            Box::new(CompositeLayer::residual(input, main, rng)?)
        }
        _ => create_layer(&kind, input, &params, rng)?,
    };
    Ok(layer)
}

/// Builds a chain of layers starting from `input`.
pub fn build_chain(specs: &[LayerSpec], input: Shape, rng: &mut EngineRng) -> Result<Chain> {
    let mut chain = Chain::new(input);
    for spec in specs {
        let layer = build_layer(spec, chain.output_shape(), rng)?;
        chain.push(layer)?;
    }
    Ok(chain)
}

fn build_branches(
    branches: &[Vec<LayerSpec>],
    input: Shape,
    rng: &mut EngineRng,
) -> Result<Vec<Chain>> {
    branches
        .iter()
        .map(|specs| build_chain(specs, input, rng))
        .collect()
}

/// Builds a network from an architecture configuration, seeding its generator with `seed`.
pub fn build_network(config: &ArchitectureConfig, seed: u64) -> Result<Network> {
    let mut network = Network::new(config.input, seed)?;
    for spec in &config.layers {
        let layer = build_layer(spec, network.output_shape(), network.rng_mut())?;
        network.add_layer(layer)?;
    }
    debug!(
        "built network: {} layers, {} parameters, {} -> {}",
        network.layers().len(),
        network.trainable_params(),
        network.input_shape(),
        network.output_shape()
    );
    Ok(network)
}
