//! Configuration structures
//!
//! Two kinds of configuration reach the engine:
//!
//! - [`Params`]: the key/value lookup built from a free-text `key=value` selection string
//!   by an external tokenizer. Layers, optimizers and losses read their hyperparameters
//!   from it with presence tests and typed lookups.
//! - [`TrainingConfig`]: a JSON document describing a training run (epochs, batch size,
//!   seed, optimizer and loss selection), loaded with [`load_config`].

use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Key/value lookup of hyperparameters.
///
/// # Example
///
/// ```
/// use rust_convnet::config::Params;
///
/// let params = Params::from_pairs([("optimizer", "adam"), ("lr", "0.001")]);
/// assert!(params.has("lr"));
/// assert_eq!(params.get::<f64>("lr").unwrap(), 0.001);
/// assert_eq!(params.get_or::<f64>("decay", 0.0).unwrap(), 0.0);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    values: BTreeMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Converts scalar JSON fields into string values; arrays and objects are skipped.
    pub fn from_json(map: &BTreeMap<String, Value>) -> Self {
        let values = map
            .iter()
            .filter_map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((k.clone(), text))
            })
            .collect();
        Self { values }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Typed lookup of a required key.
    pub fn get<T: FromStr>(&self, key: &str) -> Result<T> {
        let raw = self
            .values
            .get(key)
            .ok_or_else(|| Error::MissingParameter(key.to_string()))?;
        raw.parse::<T>().map_err(|_| Error::InvalidParameter {
            key: key.to_string(),
            value: raw.clone(),
        })
    }

    /// Typed lookup falling back to `default` when the key is absent.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        if self.has(key) {
            self.get(key)
        } else {
            Ok(default)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

/// Configuration for a training run.
///
/// # Example
///
/// ```json
/// {
///   "epochs": 10,
///   "batch_size": 16,
///   "seed": 7,
///   "loss": "cross_entropy",
///   "optimizer": { "optimizer": "adam", "lr": 0.001 }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,

    pub batch_size: usize,

    /// Seed for the network generator (shuffling, dropout, initialization)
    #[serde(default)]
    pub seed: u64,

    /// Loss name: "mse", "cross_entropy" or "binary_cross_entropy"
    #[serde(default = "default_loss")]
    pub loss: String,

    /// Optimizer selection, e.g. `{ "optimizer": "momentum", "lr": 0.01, "momentum": 0.9 }`
    #[serde(default)]
    pub optimizer: BTreeMap<String, Value>,

    /// Zero every optimizer accumulator at the start of each epoch
    #[serde(default)]
    pub reset_optimizer: bool,

    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

fn default_loss() -> String {
    "mse".to_string()
}

fn default_shuffle() -> bool {
    true
}

impl TrainingConfig {
    pub fn optimizer_params(&self) -> Params {
        Params::from_json(&self.optimizer)
    }
}

/// Loads a training configuration from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use rust_convnet::config::load_config;
///
/// let cfg = load_config("config/training.json").unwrap();
/// assert!(cfg.epochs > 0);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TrainingConfig> {
    let contents = fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parses and validates a training configuration from JSON text.
pub fn parse_config(contents: &str) -> Result<TrainingConfig> {
    let config: TrainingConfig = serde_json::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &TrainingConfig) -> Result<()> {
    if config.epochs == 0 {
        return Err(Error::InvalidParameter {
            key: "epochs".to_string(),
            value: "0".to_string(),
        });
    }
    if config.batch_size == 0 {
        return Err(Error::InvalidParameter {
            key: "batch_size".to_string(),
            value: "0".to_string(),
        });
    }

    // Resolve both selections now so a typo fails at load time
    crate::loss::Loss::from_name(&config.loss)?;
    crate::optimizers::Optimizer::from_params(&config.optimizer_params())?;
    Ok(())
}
