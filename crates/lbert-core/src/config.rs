//! Model configuration.

use crate::activation::Activation;
use crate::error::{LbertError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the L-BERT encoder.
///
/// Immutable after construction; [`BertConfig::for_inference`] is the only
/// sanctioned variant and it zeroes the dropout probabilities before the
/// model is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BertConfig {
    /// Vocabulary size of the word-piece ids.
    pub vocab_size: usize,
    /// Vocabulary size of the lexical-cluster ids.
    pub cluster_size: usize,
    /// Hidden dimension of the encoder and pooler.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Number of transformer layers.
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    /// Number of attention heads per layer.
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    /// Width of the feed-forward (intermediate) layer.
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    /// Activation of the feed-forward layer.
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    /// Dropout probability for embeddings and hidden layers.
    #[serde(default = "default_hidden_dropout")]
    pub hidden_dropout_prob: f32,
    /// Dropout probability for attention weights.
    #[serde(default = "default_attention_dropout")]
    pub attention_probs_dropout_prob: f32,
    /// Capacity of the learned position-embedding table.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Vocabulary size of the token-type ids (shared by the entity channel).
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    /// Stddev of the truncated-normal initializer.
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f32,
}

fn default_hidden_size() -> usize {
    768
}
fn default_num_hidden_layers() -> usize {
    12
}
fn default_num_attention_heads() -> usize {
    12
}
fn default_intermediate_size() -> usize {
    3072
}
fn default_hidden_act() -> String {
    "gelu".to_string()
}
fn default_hidden_dropout() -> f32 {
    0.1
}
fn default_attention_dropout() -> f32 {
    0.1
}
fn default_max_position_embeddings() -> usize {
    512
}
fn default_type_vocab_size() -> usize {
    16
}
fn default_initializer_range() -> f32 {
    0.02
}

impl BertConfig {
    /// Create a config with the given vocabulary sizes and defaults for
    /// everything else.
    pub fn new(vocab_size: usize, cluster_size: usize) -> Self {
        Self {
            vocab_size,
            cluster_size,
            hidden_size: default_hidden_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            intermediate_size: default_intermediate_size(),
            hidden_act: default_hidden_act(),
            hidden_dropout_prob: default_hidden_dropout(),
            attention_probs_dropout_prob: default_attention_dropout(),
            max_position_embeddings: default_max_position_embeddings(),
            type_vocab_size: default_type_vocab_size(),
            initializer_range: default_initializer_range(),
        }
    }

    /// Load from a JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Per-head width. Only meaningful once [`BertConfig::validate`] passed.
    pub fn head_size(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Parse the configured activation name.
    pub fn activation(&self) -> Result<Activation> {
        self.hidden_act.parse()
    }

    /// Copy of this config with both dropout probabilities zeroed.
    pub fn for_inference(&self) -> Self {
        let mut config = self.clone();
        config.hidden_dropout_prob = 0.0;
        config.attention_probs_dropout_prob = 0.0;
        config
    }

    /// Check the invariants that must hold before a model can be built.
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 {
            return Err(LbertError::Config(
                "num_attention_heads must be at least 1".to_string(),
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(LbertError::Config(format!(
                "hidden size {} is not a multiple of the number of attention heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.vocab_size == 0 || self.cluster_size == 0 {
            return Err(LbertError::Config(
                "vocab_size and cluster_size must be at least 1".to_string(),
            ));
        }
        if self.max_position_embeddings == 0 {
            return Err(LbertError::Config(
                "max_position_embeddings must be at least 1".to_string(),
            ));
        }
        if self.num_hidden_layers == 0 {
            return Err(LbertError::Config(
                "num_hidden_layers must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.hidden_dropout_prob)
            || !(0.0..1.0).contains(&self.attention_probs_dropout_prob)
        {
            return Err(LbertError::Config(
                "dropout probabilities must lie in [0, 1)".to_string(),
            ));
        }
        // Fails here rather than deep inside the feed-forward layer.
        self.activation()?;
        Ok(())
    }
}

/// Named feature flags gating the optional embedding channels.
///
/// Replaces the positional `layer_def` flag list the original model used,
/// so each channel is enabled by an explicit field instead of an index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EmbeddingFlags {
    /// Add the token-type channel (requires token_type_ids).
    pub use_token_type: bool,
    /// Add the learned position channel.
    pub use_position_embeddings: bool,
    /// Add the entity channel driven by the context mask.
    pub use_entity_embedding: bool,
}

impl Default for EmbeddingFlags {
    fn default() -> Self {
        Self {
            use_token_type: true,
            use_position_embeddings: true,
            use_entity_embedding: false,
        }
    }
}
