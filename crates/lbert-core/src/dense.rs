//! Dense (fully connected) layer on raw tensors.

use crate::activation::Activation;
use crate::error::{LbertError, Result};
use crate::init::Init;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;

/// A dense layer `y = act(x @ weight^T + bias)`.
#[derive(Debug, Clone)]
pub struct Dense {
    /// Weight matrix, shape `[out_features, in_features]`.
    weight: Tensor,
    /// Bias vector, shape `[out_features]`.
    bias: Tensor,
    /// Optional activation applied to the output.
    activation: Option<Activation>,
}

impl Dense {
    /// Create a dense layer, weight from `init`, bias zeroed.
    pub fn new(
        in_features: usize,
        out_features: usize,
        activation: Option<Activation>,
        init: &Init,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let weight = init.build(out_features, in_features, seed, device)?;
        let bias = Tensor::zeros(out_features, DType::F32, device)?;
        Ok(Self {
            weight,
            bias,
            activation,
        })
    }

    /// Forward pass over a matrix `[rows, in_features]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = x.matmul(&self.weight.t()?.contiguous()?)?;
        let out = out.broadcast_add(&self.bias)?;
        match self.activation {
            Some(act) => act.apply(&out),
            None => Ok(out),
        }
    }

    /// Output width.
    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Overwrite weight/bias from a checkpoint map where present.
    pub fn restore(
        &mut self,
        map: &HashMap<String, Tensor>,
        prefix: &str,
        restored: &mut Vec<String>,
    ) -> Result<()> {
        for (suffix, param) in [("weight", &mut self.weight), ("bias", &mut self.bias)] {
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
