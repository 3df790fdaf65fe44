//! # L-BERT Core
//!
//! Core model for the L-BERT encoder: a BERT-style transformer whose input
//! sums a word-piece channel with a lexical-cluster channel, and whose
//! attention scores carry a learned-free distance bias.
//!
//! This crate provides:
//! - **Embedding channels** with file-initialized cluster vectors
//! - **Distance-biased multi-head attention** with padding masks
//! - **Transformer encoder stack** with residual + layer-norm sub-blocks
//! - **Pooling heads** over the first token and the terminator token
//! - **Warm-start** from SafeTensors checkpoints via name intersection

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod activation;
pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod dense;
pub mod embedding;
pub mod encoder;
pub mod error;
pub mod init;
pub mod model;
pub mod norm;
pub mod pooler;
pub mod shape;

pub use error::{LbertError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::attention::DistanceBiasedAttention;
    pub use crate::checkpoint::Checkpoint;
    pub use crate::config::{BertConfig, EmbeddingFlags};
    pub use crate::error::{LbertError, Result};
    pub use crate::model::{ForwardInputs, LbertModel, ModelOptions, ModelOutput};
    pub use crate::pooler::DEFAULT_TERMINATOR_ID;
}
