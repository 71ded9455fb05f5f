//! Error types for the decision model.

use thiserror::Error;

/// Result type for decision-model operations.
pub type Result<T> = std::result::Result<T, DecisionError>;

/// Errors that can occur while building or running the decision model.
#[derive(Debug, Error)]
pub enum DecisionError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Shape mismatch
    #[error("Shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: String,
        expected: String,
        got: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A modality tensor required by the occupancy pattern was not supplied
    #[error("Missing {modality} tensor: occupancy pattern {pattern} requires it")]
    MissingModality {
        modality: &'static str,
        pattern: &'static str,
    },

    /// A driver was invoked on a modality kind it does not support
    #[error("Unsupported {modality} kind for {operation}: {detail}")]
    UnsupportedModality {
        modality: &'static str,
        operation: &'static str,
        detail: String,
    },

    /// A rollout ran past the end of a fixed-length schedule or table
    #[error("Position overflow in {what}: positions [{start}, {end}) exceed length {len}")]
    PositionOverflow {
        what: &'static str,
        start: usize,
        end: usize,
        len: usize,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config (de)serialization error
    #[error("Config error: {0}")]
    Config(String),
}

impl DecisionError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(
        what: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a config file error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
