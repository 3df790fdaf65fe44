//! Transformer encoder stack.
//!
//! Each layer runs self-attention followed by a position-wise feed-forward
//! transform, both wrapped in dropout, a residual connection, and layer
//! normalization. Layers form a strict linear chain; the hidden state is
//! kept flattened to `[B * L, H]` between layers and restored to
//! `[B, L, H]` only at the boundary.

use crate::attention::DistanceBiasedAttention;
use crate::config::BertConfig;
use crate::dense::Dense;
use crate::error::{LbertError, Result};
use crate::init::{Init, SeedStream};
use crate::norm::{Dropout, LayerNorm};
use crate::shape;
use candle_core::{Device, Tensor};
use std::collections::HashMap;

/// A single encoder layer.
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    attention: DistanceBiasedAttention,
    attention_output: Dense,
    attention_norm: LayerNorm,
    intermediate: Dense,
    output: Dense,
    output_norm: LayerNorm,
    dropout: Dropout,
}

impl TransformerLayer {
    /// Build one layer from the config.
    pub fn new(config: &BertConfig, seeds: &mut SeedStream, device: &Device) -> Result<Self> {
        let init = Init::TruncatedNormal {
            stddev: config.initializer_range,
        };
        let hidden = config.hidden_size;
        let all_head_size = config.num_attention_heads * config.head_size();

        Ok(Self {
            attention: DistanceBiasedAttention::new(config, seeds, device)?,
            attention_output: Dense::new(
                all_head_size,
                hidden,
                None,
                &init,
                seeds.next_seed(),
                device,
            )?,
            attention_norm: LayerNorm::new(hidden, device)?,
            intermediate: Dense::new(
                hidden,
                config.intermediate_size,
                Some(config.activation()?),
                &init,
                seeds.next_seed(),
                device,
            )?,
            output: Dense::new(
                config.intermediate_size,
                hidden,
                None,
                &init,
                seeds.next_seed(),
                device,
            )?,
            output_norm: LayerNorm::new(hidden, device)?,
            dropout: Dropout::new(config.hidden_dropout_prob),
        })
    }

    /// Forward pass over the flattened hidden state `[B * L, H]`.
    pub fn forward(
        &self,
        layer_input: &Tensor,
        attention_mask: &Tensor,
        batch: usize,
        seq_len: usize,
    ) -> Result<Tensor> {
        // Self-attention sub-block with residual + norm.
        let attn = self.attention.forward(
            layer_input,
            layer_input,
            attention_mask,
            batch,
            seq_len,
            seq_len,
            true,
        )?;
        let attn = self.attention_output.forward(&attn)?;
        let attn = self.dropout.forward(&attn)?;
        let attn = self.attention_norm.forward(&(attn + layer_input)?)?;

        // Feed-forward sub-block with residual + norm.
        let intermediate = self.intermediate.forward(&attn)?;
        let out = self.output.forward(&intermediate)?;
        let out = self.dropout.forward(&out)?;
        self.output_norm.forward(&(out + attn)?)
    }

    /// Overwrite parameters from a checkpoint map where present.
    pub fn restore(
        &mut self,
        map: &HashMap<String, Tensor>,
        prefix: &str,
        restored: &mut Vec<String>,
    ) -> Result<()> {
        self.attention
            .restore(map, &format!("{prefix}.attention.self"), restored)?;
        self.attention_output
            .restore(map, &format!("{prefix}.attention.output.dense"), restored)?;
        self.attention_norm.restore(
            map,
            &format!("{prefix}.attention.output.layer_norm"),
            restored,
        )?;
        self.intermediate
            .restore(map, &format!("{prefix}.intermediate.dense"), restored)?;
        self.output
            .restore(map, &format!("{prefix}.output.dense"), restored)?;
        self.output_norm
            .restore(map, &format!("{prefix}.output.layer_norm"), restored)
    }

    /// Parameter names contributed by this layer under `prefix`.
    pub fn parameter_names(&self, prefix: &str, names: &mut Vec<String>) {
        self.attention
            .parameter_names(&format!("{prefix}.attention.self"), names);
        for dense in ["attention.output.dense", "intermediate.dense", "output.dense"] {
            names.push(format!("{prefix}.{dense}.weight"));
            names.push(format!("{prefix}.{dense}.bias"));
        }
        for norm in ["attention.output.layer_norm", "output.layer_norm"] {
            names.push(format!("{prefix}.{norm}.gamma"));
            names.push(format!("{prefix}.{norm}.beta"));
        }
    }
}

/// The stacked transformer encoder.
#[derive(Debug, Clone)]
pub struct TransformerEncoder {
    layers: Vec<TransformerLayer>,
    hidden_size: usize,
}

impl TransformerEncoder {
    /// Build `num_hidden_layers` layers from the config.
    pub fn new(config: &BertConfig, seeds: &mut SeedStream, device: &Device) -> Result<Self> {
        if config.hidden_size % config.num_attention_heads != 0 {
            return Err(LbertError::Config(format!(
                "hidden size {} is not a multiple of the number of attention heads {}",
                config.hidden_size, config.num_attention_heads
            )));
        }
        let layers = (0..config.num_hidden_layers)
            .map(|_| TransformerLayer::new(config, seeds, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            hidden_size: config.hidden_size,
        })
    }

    /// Run the stack and return every layer's output as `[B, L, H]`.
    pub fn forward_all(&self, input: &Tensor, attention_mask: &Tensor) -> Result<Vec<Tensor>> {
        let input_dims = shape::dims(input, 3, "encoder input")?;
        let (batch, seq_len, width) = (input_dims[0], input_dims[1], input_dims[2]);
        if width != self.hidden_size {
            return Err(LbertError::ShapeMismatch(format!(
                "encoder input width {width} does not match hidden size {}",
                self.hidden_size
            )));
        }

        let mut prev = shape::to_matrix(input)?;
        let mut all_outputs = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            prev = layer.forward(&prev, attention_mask, batch, seq_len)?;
            all_outputs.push(prev.clone());
        }

        all_outputs
            .iter()
            .map(|out| shape::from_matrix(out, &input_dims))
            .collect()
    }

    /// Run the stack and return only the final hidden state `[B, L, H]`.
    pub fn forward(&self, input: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let mut all = self.forward_all(input, attention_mask)?;
        all.pop().ok_or_else(|| {
            LbertError::Config("encoder has no layers".to_string())
        })
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Overwrite parameters from a checkpoint map where present.
    pub fn restore(
        &mut self,
        map: &HashMap<String, Tensor>,
        restored: &mut Vec<String>,
    ) -> Result<()> {
        for (idx, layer) in self.layers.iter_mut().enumerate() {
            layer.restore(map, &format!("encoder.layer_{idx}"), restored)?;
        }
        Ok(())
    }

    /// Parameter names contributed by the stack.
    pub fn parameter_names(&self, names: &mut Vec<String>) {
        for (idx, layer) in self.layers.iter().enumerate() {
            layer.parameter_names(&format!("encoder.layer_{idx}"), names);
        }
    }
}
