//! Layer normalization and dropout.

use crate::error::{LbertError, Result};
use candle_core::{DType, Device, Tensor, D};
use std::collections::HashMap;

/// Epsilon used by every layer norm in the model.
pub const LAYER_NORM_EPS: f64 = 1e-12;

/// Layer normalization over the last (feature) axis.
///
/// `LayerNorm(x) = (x - mean) / sqrt(var + eps) * gamma + beta`
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// Learnable scale, shape `[hidden_size]`.
    gamma: Tensor,
    /// Learnable shift, shape `[hidden_size]`.
    beta: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Create with gamma = 1 and beta = 0.
    pub fn new(hidden_size: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            gamma: Tensor::ones(hidden_size, DType::F32, device)?,
            beta: Tensor::zeros(hidden_size, DType::F32, device)?,
            eps: LAYER_NORM_EPS,
        })
    }

    /// Forward pass over `[..., hidden_size]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normalized = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        let out = normalized
            .broadcast_mul(&self.gamma)?
            .broadcast_add(&self.beta)?;
        Ok(out)
    }

    /// Overwrite gamma/beta from a checkpoint map where present.
    pub fn restore(
        &mut self,
        map: &HashMap<String, Tensor>,
        prefix: &str,
        restored: &mut Vec<String>,
    ) -> Result<()> {
        for (suffix, param) in [("gamma", &mut self.gamma), ("beta", &mut self.beta)] {
            let name = format!("{prefix}.{suffix}");
            if let Some(value) = map.get(&name) {
                if value.dims() != param.dims() {
                    return Err(LbertError::Checkpoint(format!(
                        "{name}: expected shape {:?}, got {:?}",
                        param.dims(),
                        value.dims()
                    )));
                }
                *param = value.clone();
                restored.push(name);
            }
        }
        Ok(())
    }
}

/// Dropout with a fixed probability.
///
/// A probability of exactly zero is a strict identity transform; the input
/// tensor is returned unchanged.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    prob: f32,
}

impl Dropout {
    /// Create a dropout op with the given drop probability.
    pub fn new(prob: f32) -> Self {
        Self { prob }
    }

    /// Apply dropout.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if self.prob == 0.0 {
            return Ok(x.clone());
        }
        Ok(candle_nn::ops::dropout(x, self.prob)?)
    }

    /// The configured drop probability.
    pub fn prob(&self) -> f32 {
        self.prob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_norm_preserves_shape() {
        let norm = LayerNorm::new(16, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 3.0, &[2, 5, 16], &Device::Cpu).unwrap();
        let out = norm.forward(&x).unwrap();
        assert_eq!(out.dims(), x.dims());
    }

    #[test]
    fn layer_norm_zero_mean_unit_variance() {
        // With gamma = 1 and beta = 0 each feature slice must come out
        // with mean ~0 and variance ~1.
        let norm = LayerNorm::new(64, &Device::Cpu).unwrap();
        let x = Tensor::randn(5.0f32, 4.0, &[3, 64], &Device::Cpu).unwrap();
        let out = norm.forward(&x).unwrap();

        let rows: Vec<Vec<f32>> = out.to_vec2().unwrap();
        for row in rows {
            let n = row.len() as f32;
            let mean: f32 = row.iter().sum::<f32>() / n;
            let var: f32 = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            assert!(mean.abs() < 1e-4, "mean {mean}");
            assert!((var - 1.0).abs() < 1e-3, "var {var}");
        }
    }

    #[test]
    fn layer_norm_constant_input() {
        let norm = LayerNorm::new(8, &Device::Cpu).unwrap();
        let x = (Tensor::ones(&[1, 8], DType::F32, &Device::Cpu).unwrap() * 3.0).unwrap();
        let out: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        // Zero variance collapses to ~0 everywhere.
        for v in out {
            assert!(v.abs() < 1e-3);
        }
    }

    #[test]
    fn dropout_zero_is_identity() {
        let dropout = Dropout::new(0.0);
        let x = Tensor::randn(0.0f32, 1.0, &[4, 7], &Device::Cpu).unwrap();
        let out = dropout.forward(&x).unwrap();
        let a: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn layer_norm_restore_checks_shape() {
        let mut norm = LayerNorm::new(8, &Device::Cpu).unwrap();
        let mut map = HashMap::new();
        map.insert(
            "embeddings.layer_norm.gamma".to_string(),
            Tensor::ones(4, DType::F32, &Device::Cpu).unwrap(),
        );
        let mut restored = Vec::new();
        assert!(norm
            .restore(&map, "embeddings.layer_norm", &mut restored)
            .is_err());
    }
}
