//! # L-BERT
//!
//! Lexical BERT encoder with distance-biased attention.
//!
//! The model sums a word-piece embedding channel with a lexical-cluster
//! channel whose initial vectors come from a tab-separated file, and biases
//! every attention score by a fixed function of token distance.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lbert::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let encoder = Encoder::builder()
//!         .config_file("bert_config.json")
//!         .cluster_embeddings("clusters.tsv")
//!         .checkpoint("model.safetensors")
//!         .build()?;
//!
//!     let encoding = encoder.encode(
//!         &[vec![31, 51, 99], vec![15, 5]],
//!         &[vec![7, 45, 234], vec![7, 78]],
//!     )?;
//!     println!("{:?}", encoding.pooled[0]);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use lbert_core::*;

mod encode;

pub use encode::{Encoder, EncoderBuilder, Encoding};

/// Commonly used types.
pub mod prelude {
    pub use crate::encode::{Encoder, EncoderBuilder, Encoding};
    pub use crate::{
        checkpoint::Checkpoint,
        config::{BertConfig, EmbeddingFlags},
        error::{LbertError, Result},
        model::{ForwardInputs, LbertModel, ModelOptions, ModelOutput},
        pooler::DEFAULT_TERMINATOR_ID,
    };

    // Re-export useful external types
    pub use tracing;
}
