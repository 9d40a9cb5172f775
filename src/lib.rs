//! Rust ConvNet
//!
//! A feed-forward and convolutional network training engine. Layers hand-derive their
//! backward passes; there is no automatic differentiation.
//!
//! # Modules
//!
//! - `tensor`: the `Volume` 3-D array and its `Shape`
//! - `layers`: the `Layer`/`SampleLayer` traits, every layer kind, chains and composites
//! - `optimizers`: the per-weight optimizer state machine (SGD, Adam, ...)
//! - `loss`: loss functions
//! - `network`: training loop, inference, gradient checking and model files
//! - `serialization`: the whitespace-delimited text model format
//! - `config`: key/value hyperparameter lookups and training configuration
//! - `architecture`: JSON network descriptions and the network builder
//! - `utils`: seeded generator and activation functions
//!
//! # Example
//!
//! ```
//! use rust_convnet::config::Params;
//! use rust_convnet::network::Network;
//! use rust_convnet::tensor::{Shape, Volume};
//!
//! let mut net = Network::new(Shape::new(4, 4, 1), 42).unwrap();
//! net.add_from_params("conv", &Params::from_pairs([("filters", "2"), ("size", "3"), ("padding", "1")]))
//!     .unwrap();
//! net.add_from_params("maxpool", &Params::new()).unwrap();
//! net.add_from_params("fc", &Params::from_pairs([("neurons", "3")])).unwrap();
//! net.add_from_params("softmax", &Params::new()).unwrap();
//!
//! let y = net.get_output(&Volume::new(4, 4, 1));
//! assert!((y.sum() - 1.0).abs() < 1e-12);
//! ```

pub mod architecture;
pub mod config;
pub mod error;
pub mod layers;
pub mod loss;
pub mod network;
pub mod optimizers;
pub mod serialization;
pub mod tensor;
pub mod utils;

pub use error::{Error, Result};
pub use layers::{Layer, SampleLayer};
pub use loss::Loss;
pub use network::{Network, TrainOptions};
pub use optimizers::Optimizer;
pub use tensor::{Shape, Volume};
