//! Embedding tables, lookup, and channel composition.
//!
//! Four kinds of tables feed the encoder input: word, lexical-cluster,
//! token-type, and position, plus an optional entity channel that reuses
//! the token-type vocabulary. The word and cluster lookups happen first and
//! are summed by the model; [`EmbeddingComposer`] then adds the remaining
//! channels and applies layer normalization and dropout.

use crate::config::{BertConfig, EmbeddingFlags};
use crate::error::{LbertError, Result};
use crate::init::{Init, SeedStream};
use crate::norm::{Dropout, LayerNorm};
use crate::shape;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;

/// A dense embedding table of shape `[vocab_size, width]`.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    table: Tensor,
    vocab_size: usize,
    width: usize,
}

impl EmbeddingTable {
    /// Build a table from an initializer strategy.
    pub fn new(
        vocab_size: usize,
        width: usize,
        init: &Init,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let table = init.build(vocab_size, width, seed, device)?;
        Ok(Self {
            table,
            vocab_size,
            width,
        })
    }

    /// Map ids `[B, L]` (or `[B, L, 1]`) to vectors `[B, L, width]`.
    ///
    /// `one_hot` selects the one-hot-times-matrix path instead of the
    /// indexed gather; the two are numerically identical for valid ids.
    /// Ids at or above the vocabulary size fail fast.
    pub fn lookup(&self, ids: &Tensor, one_hot: bool) -> Result<Tensor> {
        let id_dims = shape::dims_any(ids, &[2, 3], "ids")?;
        if id_dims.len() == 3 && id_dims[2] != 1 {
            return Err(LbertError::ShapeMismatch(format!(
                "rank-3 id tensor must have a trailing dim of 1, got {id_dims:?}"
            )));
        }
        let (batch, seq_len) = (id_dims[0], id_dims[1]);

        let flat = ids.flatten_all()?.to_dtype(DType::U32)?;
        self.check_range(&flat)?;

        let gathered = if one_hot {
            let one_hot_ids = candle_nn::encoding::one_hot(
                flat.to_dtype(DType::I64)?,
                self.vocab_size,
                1.0f32,
                0.0f32,
            )?;
            one_hot_ids.matmul(&self.table)?
        } else {
            self.table.index_select(&flat, 0)?
        };

        Ok(gathered.reshape((batch, seq_len, self.width))?)
    }

    fn check_range(&self, flat_ids: &Tensor) -> Result<()> {
        let max_id = flat_ids.max(0)?.to_scalar::<u32>()?;
        if max_id as usize >= self.vocab_size {
            return Err(LbertError::InvalidInput(format!(
                "id {max_id} out of range for vocabulary of size {}",
                self.vocab_size
            )));
        }
        Ok(())
    }

    /// The underlying parameter, for tied-weight downstream use.
    pub fn table(&self) -> &Tensor {
        &self.table
    }

    /// Vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Overwrite the table from a checkpoint map where present.
    pub fn restore(
        &mut self,
        map: &HashMap<String, Tensor>,
        name: &str,
        restored: &mut Vec<String>,
    ) -> Result<()> {
        if let Some(value) = map.get(name) {
            if value.dims() != self.table.dims() {
                return Err(LbertError::Checkpoint(format!(
                    "{name}: expected shape {:?}, got {:?}",
                    self.table.dims(),
                    value.dims()
                )));
            }
            self.table = value.clone();
            restored.push(name.to_string());
        }
        Ok(())
    }
}

/// Sums the optional embedding channels onto a base tensor, then applies
/// layer normalization and dropout.
#[derive(Debug, Clone)]
pub struct EmbeddingComposer {
    flags: EmbeddingFlags,
    token_type: Option<EmbeddingTable>,
    position: Option<EmbeddingTable>,
    entity: Option<EmbeddingTable>,
    layer_norm: LayerNorm,
    dropout: Dropout,
    max_position_embeddings: usize,
}

impl EmbeddingComposer {
    /// Build the composer's tables per the enabled flags.
    pub fn new(
        config: &BertConfig,
        flags: EmbeddingFlags,
        seeds: &mut SeedStream,
        device: &Device,
    ) -> Result<Self> {
        let init = Init::TruncatedNormal {
            stddev: config.initializer_range,
        };
        let width = config.hidden_size;

        let token_type = if flags.use_token_type {
            Some(EmbeddingTable::new(
                config.type_vocab_size,
                width,
                &init,
                seeds.next_seed(),
                device,
            )?)
        } else {
            None
        };
        let position = if flags.use_position_embeddings {
            Some(EmbeddingTable::new(
                config.max_position_embeddings,
                width,
                &init,
                seeds.next_seed(),
                device,
            )?)
        } else {
            None
        };
        let entity = if flags.use_entity_embedding {
            Some(EmbeddingTable::new(
                config.type_vocab_size,
                width,
                &init,
                seeds.next_seed(),
                device,
            )?)
        } else {
            None
        };

        Ok(Self {
            flags,
            token_type,
            position,
            entity,
            layer_norm: LayerNorm::new(width, device)?,
            dropout: Dropout::new(config.hidden_dropout_prob),
            max_position_embeddings: config.max_position_embeddings,
        })
    }

    /// Compose the enabled channels onto `input` `[B, L, H]`.
    ///
    /// `token_type_ids` is required when the token-type flag is set,
    /// `entity_ids` when the entity flag is set. Sequences longer than the
    /// position table's capacity are a fatal range error.
    pub fn forward(
        &self,
        input: &Tensor,
        token_type_ids: Option<&Tensor>,
        entity_ids: Option<&Tensor>,
    ) -> Result<Tensor> {
        let input_dims = shape::dims(input, 3, "embedding input")?;
        let seq_len = input_dims[1];

        let mut output = input.clone();

        if let Some(table) = &self.token_type {
            let ids = token_type_ids.ok_or_else(|| {
                LbertError::Config(
                    "token_type_ids must be given when use_token_type is set".to_string(),
                )
            })?;
            // Small vocabulary; the one-hot path is always used here.
            output = (output + table.lookup(ids, true)?)?;
        }

        if let Some(table) = &self.position {
            if seq_len > self.max_position_embeddings {
                return Err(LbertError::Config(format!(
                    "sequence length {seq_len} exceeds max_position_embeddings {}",
                    self.max_position_embeddings
                )));
            }
            // First L rows of the learned table, broadcast over the batch.
            let positions = table.table().narrow(0, 0, seq_len)?.unsqueeze(0)?;
            output = output.broadcast_add(&positions)?;
        }

        if let Some(table) = &self.entity {
            let ids = entity_ids.ok_or_else(|| {
                LbertError::Config(
                    "entity ids must be given when use_entity_embedding is set".to_string(),
                )
            })?;
            output = (output + table.lookup(ids, true)?)?;
        }

        let output = self.layer_norm.forward(&output)?;
        self.dropout.forward(&output)
    }

    /// The flags this composer was built with.
    pub fn flags(&self) -> EmbeddingFlags {
        self.flags
    }

    /// Overwrite parameters from a checkpoint map where present.
    pub fn restore(
        &mut self,
        map: &HashMap<String, Tensor>,
        restored: &mut Vec<String>,
    ) -> Result<()> {
        if let Some(table) = &mut self.token_type {
            table.restore(map, "embeddings.token_type_embeddings", restored)?;
        }
        if let Some(table) = &mut self.position {
            table.restore(map, "embeddings.position_embeddings", restored)?;
        }
        if let Some(table) = &mut self.entity {
            table.restore(map, "embeddings.entity_embeddings", restored)?;
        }
        self.layer_norm
            .restore(map, "embeddings.layer_norm", restored)
    }

    /// Parameter names contributed by this composer.
    pub fn parameter_names(&self, names: &mut Vec<String>) {
        if self.token_type.is_some() {
            names.push("embeddings.token_type_embeddings".to_string());
        }
        if self.position.is_some() {
            names.push("embeddings.position_embeddings".to_string());
        }
        if self.entity.is_some() {
            names.push("embeddings.entity_embeddings".to_string());
        }
        names.push("embeddings.layer_norm.gamma".to_string());
        names.push("embeddings.layer_norm.beta".to_string());
    }
}
