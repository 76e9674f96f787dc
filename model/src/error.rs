//! Error types for the capsule network.

use thiserror::Error;

/// Result type for capsule network operations.
pub type Result<T> = std::result::Result<T, CapsError>;

/// Errors raised while configuring, training or persisting a [`crate::CapsNet`].
#[derive(Debug, Error)]
pub enum CapsError {
    /// Invalid network or training configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor shapes do not line up
    #[error("Shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: String,
        expected: String,
        got: String,
    },

    /// Reshape on a non-contiguous or mis-sized array
    #[error("Reshape error: {0}")]
    Reshape(#[from] ndarray::ShapeError),

    /// A checkpoint lacks a parameter the network needs
    #[error("Missing parameter in checkpoint: {0}")]
    MissingParameter(String),

    /// Backward pass requested before a forward pass cached activations
    #[error("Backward called before forward on {0} layer")]
    MissingActivations(&'static str),

    /// Malformed dataset file
    #[error("Data error: {0}")]
    Data(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image decoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl CapsError {
    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(
        what: impl Into<String>,
        expected: impl std::fmt::Debug,
        got: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: format!("{expected:?}"),
            got: format!("{got:?}"),
        }
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}
