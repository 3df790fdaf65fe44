//! Sentence-level pooling head.
//!
//! The pooled output is the first-token hidden vector projected through a
//! dense + tanh layer; that path is the guaranteed contract. The hidden
//! vector at the terminator token is exposed separately through
//! [`Pooler::terminator_output`] and is never folded into the pooled
//! output.

use crate::activation::Activation;
use crate::config::BertConfig;
use crate::dense::Dense;
use crate::error::{LbertError, Result};
use crate::init::{Init, SeedStream};
use crate::shape;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;

/// Sentinel id of the terminator token in the pretrained vocabulary.
pub const DEFAULT_TERMINATOR_ID: u32 = 1475;

/// Pooling head over the final hidden state.
#[derive(Debug, Clone)]
pub struct Pooler {
    dense: Dense,
    terminator_id: u32,
}

impl Pooler {
    /// Build the dense + tanh projection.
    pub fn new(
        config: &BertConfig,
        terminator_id: u32,
        seeds: &mut SeedStream,
        device: &Device,
    ) -> Result<Self> {
        let init = Init::TruncatedNormal {
            stddev: config.initializer_range,
        };
        let dense = Dense::new(
            config.hidden_size,
            config.hidden_size,
            Some(Activation::Tanh),
            &init,
            seeds.next_seed(),
            device,
        )?;
        Ok(Self {
            dense,
            terminator_id,
        })
    }

    /// Pool the first-token vector: `[B, L, H]` -> `[B, H]`.
    pub fn forward(&self, sequence_output: &Tensor) -> Result<Tensor> {
        let dims = shape::dims(sequence_output, 3, "sequence_output")?;
        let first_token = sequence_output.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
        let pooled = self.dense.forward(&first_token)?;
        debug_assert_eq!(pooled.dims(), &[dims[0], dims[2]]);
        Ok(pooled)
    }

    /// Hidden vector at the terminator token of each sequence: `[B, H]`.
    ///
    /// Located by exact-match search over `input_ids`; the first occurrence
    /// wins. A sequence without the terminator is a fatal input error, so
    /// callers that cannot guarantee its presence must check first.
    pub fn terminator_output(&self, sequence_output: &Tensor, input_ids: &Tensor) -> Result<Tensor> {
        let seq_dims = shape::dims(sequence_output, 3, "sequence_output")?;
        let id_dims = shape::dims(input_ids, 2, "input_ids")?;
        if seq_dims[0] != id_dims[0] || seq_dims[1] != id_dims[1] {
            return Err(LbertError::ShapeMismatch(format!(
                "sequence output {:?} does not align with input ids {:?}",
                &seq_dims[..2],
                id_dims
            )));
        }

        let ids: Vec<Vec<u32>> = input_ids.to_dtype(DType::U32)?.to_vec2()?;
        let mut rows = Vec::with_capacity(ids.len());
        for (row, sequence) in ids.iter().enumerate() {
            let position = sequence
                .iter()
                .position(|&id| id == self.terminator_id)
                .ok_or_else(|| {
                    LbertError::InvalidInput(format!(
                        "terminator id {} not found in sequence {row}",
                        self.terminator_id
                    ))
                })?;
            let vector = sequence_output
                .narrow(0, row, 1)?
                .narrow(1, position, 1)?
                .reshape(seq_dims[2])?;
            rows.push(vector);
        }
        Ok(Tensor::stack(&rows, 0)?)
    }

    /// The configured terminator id.
    pub fn terminator_id(&self) -> u32 {
        self.terminator_id
    }

    /// Overwrite the projection from a checkpoint map where present.
    pub fn restore(
        &mut self,
        map: &HashMap<String, Tensor>,
        restored: &mut Vec<String>,
    ) -> Result<()> {
        self.dense.restore(map, "pooler.dense", restored)
    }

    /// Parameter names contributed by the pooler.
    pub fn parameter_names(&self, names: &mut Vec<String>) {
        names.push("pooler.dense.weight".to_string());
        names.push("pooler.dense.bias".to_string());
    }
}
