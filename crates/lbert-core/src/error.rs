//! Error types for L-BERT Core.

use thiserror::Error;

/// Result type alias for L-BERT operations.
pub type Result<T> = std::result::Result<T, LbertError>;

/// Errors that can occur while constructing or running the model.
///
/// Every variant is fatal: construction either succeeds completely or the
/// model does not exist, and a forward pass either completes or aborts.
#[derive(Error, Debug)]
pub enum LbertError {
    /// Invalid hyperparameter combination or feature-flag usage.
    #[error("config error: {0}")]
    Config(String),

    /// A tensor failed its expected rank or dimension contract.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Invalid forward-pass input (out-of-range ids, missing sentinel).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The cluster-embedding initializer file is missing or malformed.
    #[error("embedding file error: {0}")]
    EmbeddingFile(String),

    /// Checkpoint loading or warm-start error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
