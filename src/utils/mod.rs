//! Shared utilities
//!
//! Random number generation and activation functions used across layers.

pub mod activations;
pub mod rng;

pub use activations::Activation;
pub use rng::EngineRng;
