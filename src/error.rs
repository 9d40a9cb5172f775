//! Error type shared by every fallible engine operation.
//!
//! Construction, configuration, loading and training entry points return [`Result`].
//! Misuse on the per-batch hot path (wrong batch length, wrong volume shape) is a
//! programming error and panics instead.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("unknown layer type '{0}'")]
    UnknownLayer(String),

    #[error("unknown optimizer '{0}'")]
    UnknownOptimizer(String),

    #[error("unknown loss '{0}'")]
    UnknownLoss(String),

    #[error("missing parameter '{0}'")]
    MissingParameter(String),

    #[error("invalid value '{value}' for parameter '{key}'")]
    InvalidParameter { key: String, value: String },

    #[error("unexpected end of model data while reading {0}")]
    UnexpectedEof(String),

    #[error("expected token '{expected}', found '{found}'")]
    MissingSentinel { expected: String, found: String },

    #[error("malformed model data: {0}")]
    Malformed(String),

    #[error(
        "gradient check failed for layer {layer} ({kind}) parameter {index}: \
         analytic {analytic:e} vs numeric {numeric:e}"
    )]
    GradientCheck {
        layer: usize,
        kind: String,
        index: usize,
        analytic: f64,
        numeric: f64,
    },

    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub(crate) fn shape_mismatch(msg: impl Into<String>) -> Error {
    Error::ShapeMismatch(msg.into())
}

pub(crate) fn invalid_hyperparameter(msg: impl Into<String>) -> Error {
    Error::InvalidHyperparameter(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::UnknownLayer("deconv".to_string());
        assert_eq!(err.to_string(), "unknown layer type 'deconv'");

        let err = Error::MissingSentinel {
            expected: "biases".to_string(),
            found: "filter".to_string(),
        };
        assert_eq!(err.to_string(), "expected token 'biases', found 'filter'");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
