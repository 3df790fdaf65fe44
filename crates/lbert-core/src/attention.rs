//! Distance-biased multi-head attention.
//!
//! Standard scaled dot-product attention with one addition: a
//! deterministic, non-learnable bias derived from token distance is added
//! to the raw scores before scaling. The bias is recomputed from the
//! sequence length on every call and encodes a fixed positional prior that
//! decays attention toward distant tokens, identically for every head and
//! layer.

use crate::config::BertConfig;
use crate::dense::Dense;
use crate::error::{LbertError, Result};
use crate::init::{Init, SeedStream};
use crate::norm::Dropout;
use crate::shape;
use candle_core::{DType, Device, Tensor, D};
use std::collections::HashMap;

/// Additive penalty for masked positions; softmax drives them to ~0.
pub const MASK_PENALTY: f64 = -10000.0;

/// Broadcast a per-token mask `[B, T]` into the 3D attention form
/// `[B, from_len, T]`.
///
/// Rows along the `from` axis are identical copies of the base mask: a
/// position is attendable (1) or not (0) regardless of where attention
/// comes from.
pub fn attention_mask_from_input_mask(mask: &Tensor, from_len: usize) -> Result<Tensor> {
    let mask_dims = shape::dims(mask, 2, "input mask")?;
    let (batch, to_len) = (mask_dims[0], mask_dims[1]);
    let mask = mask.to_dtype(DType::F32)?.reshape((batch, 1, to_len))?;
    Ok(mask.expand((batch, from_len, to_len))?.contiguous()?)
}

/// Build the `0.5 - softmax(margin)` distance bias matrix for a sequence
/// of length `len`.
///
/// The margin matrix has entry `(i, j) = j - i` with strictly
/// below-diagonal entries negated, above-diagonal entries kept, and a zero
/// diagonal. It depends only on `len` and is never a parameter.
pub fn distance_margin(len: usize, device: &Device) -> Result<Tensor> {
    if len == 0 {
        return Err(LbertError::InvalidInput(
            "distance bias needs a sequence length of at least 1".to_string(),
        ));
    }
    let mut data = Vec::with_capacity(len * len);
    for i in 0..len {
        for j in 0..len {
            let offset = j as f32 - i as f32;
            data.push(if j < i { -offset } else { offset });
        }
    }
    let margin = Tensor::from_vec(data, (len, len), device)?;
    let softmaxed = candle_nn::ops::softmax(&margin, D::Minus1)?;
    // 0.5 - softmax(margin)
    Ok(softmaxed.affine(-1.0, 0.5)?)
}

/// Turn a 3D attention mask into the additive score penalty
/// `(1 - mask) * -10000`, shaped `[B, 1, F, T]` for broadcast over heads.
pub fn mask_penalty(mask: &Tensor) -> Result<Tensor> {
    let penalty = mask.affine(-MASK_PENALTY, MASK_PENALTY)?;
    Ok(penalty.unsqueeze(1)?)
}

/// Multi-head attention layer with the distance bias.
#[derive(Debug, Clone)]
pub struct DistanceBiasedAttention {
    query: Dense,
    key: Dense,
    value: Dense,
    num_heads: usize,
    head_size: usize,
    dropout: Dropout,
}

impl DistanceBiasedAttention {
    /// Build query/key/value projections of width
    /// `num_attention_heads * head_size`.
    pub fn new(config: &BertConfig, seeds: &mut SeedStream, device: &Device) -> Result<Self> {
        let init = Init::TruncatedNormal {
            stddev: config.initializer_range,
        };
        let all_head_size = config.num_attention_heads * config.head_size();
        let project = |seeds: &mut SeedStream| {
            Dense::new(
                config.hidden_size,
                all_head_size,
                None,
                &init,
                seeds.next_seed(),
                device,
            )
        };
        Ok(Self {
            query: project(seeds)?,
            key: project(seeds)?,
            value: project(seeds)?,
            num_heads: config.num_attention_heads,
            head_size: config.head_size(),
            dropout: Dropout::new(config.attention_probs_dropout_prob),
        })
    }

    /// Attention from `from_tensor` to `to_tensor` (the same tensor for
    /// self-attention).
    ///
    /// Inputs may be rank 3 `[B, L, H]` or pre-flattened rank 2
    /// `[B * L, H]`; `batch`, `from_len`, and `to_len` describe the batched
    /// form either way. `attention_mask` is the 3D `[B, F, T]` form from
    /// [`attention_mask_from_input_mask`]. Returns `[B * F, N * Hh]` when
    /// `return_matrix` is set, otherwise `[B, F, N * Hh]`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        from_tensor: &Tensor,
        to_tensor: &Tensor,
        attention_mask: &Tensor,
        batch: usize,
        from_len: usize,
        to_len: usize,
        return_matrix: bool,
    ) -> Result<Tensor> {
        let from_dims = shape::dims_any(from_tensor, &[2, 3], "from_tensor")?;
        let to_dims = shape::dims_any(to_tensor, &[2, 3], "to_tensor")?;
        if from_dims.len() != to_dims.len() {
            return Err(LbertError::ShapeMismatch(format!(
                "from_tensor rank {} does not match to_tensor rank {}",
                from_dims.len(),
                to_dims.len()
            )));
        }
        // The distance bias is an F x F matrix; it only composes with the
        // mask when both sides have the same length.
        if from_len != to_len {
            return Err(LbertError::ShapeMismatch(format!(
                "distance-biased attention requires from_len == to_len, got {from_len} and {to_len}"
            )));
        }
        shape::dims(attention_mask, 3, "attention_mask")?;

        let from_2d = shape::to_matrix(from_tensor)?;
        let to_2d = shape::to_matrix(to_tensor)?;
        let device = from_2d.device();

        // [B*F, N*Hh] and [B*T, N*Hh]
        let query = self.query.forward(&from_2d)?;
        let key = self.key.forward(&to_2d)?;
        let value = self.value.forward(&to_2d)?;

        // [B, N, F|T, Hh]
        let query = self.split_heads(&query, batch, from_len)?;
        let key = self.split_heads(&key, batch, to_len)?;
        let value = self.split_heads(&value, batch, to_len)?;

        // Raw scores: [B, N, F, T]
        let scores = query.matmul(&key.transpose(2, 3)?.contiguous()?)?;

        // Distance bias, masked and broadcast over heads: [B, 1, F, T]
        let margin = distance_margin(from_len, device)?;
        let mask = attention_mask.to_dtype(DType::F32)?;
        let bias = mask.broadcast_mul(&margin)?.unsqueeze(1)?;
        let scores = scores.broadcast_add(&bias)?;

        let scores = (scores * (1.0 / (self.head_size as f64).sqrt()))?;

        // Masked positions get a large negative adder, valid positions 0.
        let scores = scores.broadcast_add(&mask_penalty(&mask)?)?;

        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let probs = self.dropout.forward(&probs)?;

        // [B, N, F, Hh] -> [B, F, N, Hh]
        let context = probs.matmul(&value)?;
        let context = context.transpose(1, 2)?.contiguous()?;

        let out = if return_matrix {
            context.reshape((batch * from_len, self.num_heads * self.head_size))?
        } else {
            context.reshape((batch, from_len, self.num_heads * self.head_size))?
        };
        Ok(out)
    }

    /// Reshape `[B*L, N*Hh]` into `[B, N, L, Hh]`.
    fn split_heads(&self, x: &Tensor, batch: usize, seq_len: usize) -> Result<Tensor> {
        let x = x.reshape((batch, seq_len, self.num_heads, self.head_size))?;
        Ok(x.transpose(1, 2)?.contiguous()?)
    }

    /// Number of attention heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Per-head width.
    pub fn head_size(&self) -> usize {
        self.head_size
    }

    /// Overwrite the projections from a checkpoint map where present.
    pub fn restore(
        &mut self,
        map: &HashMap<String, Tensor>,
        prefix: &str,
        restored: &mut Vec<String>,
    ) -> Result<()> {
        self.query.restore(map, &format!("{prefix}.query"), restored)?;
        self.key.restore(map, &format!("{prefix}.key"), restored)?;
        self.value.restore(map, &format!("{prefix}.value"), restored)
    }

    /// Parameter names contributed by this layer under `prefix`.
    pub fn parameter_names(&self, prefix: &str, names: &mut Vec<String>) {
        for proj in ["query", "key", "value"] {
            names.push(format!("{prefix}.{proj}.weight"));
            names.push(format!("{prefix}.{proj}.bias"));
        }
    }
}
