//! Activation functions for the feed-forward and pooling layers.

use crate::error::{LbertError, Result};
use candle_core::Tensor;
use std::str::FromStr;

/// Supported activation kinds.
///
/// `Gelu` is the erf-based variant `x * 0.5 * (1 + erf(x / sqrt(2)))`,
/// not the tanh approximation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Identity.
    Linear,
    /// Rectified linear unit.
    Relu,
    /// Gaussian error linear unit (erf form).
    Gelu,
    /// Hyperbolic tangent.
    Tanh,
}

impl Activation {
    /// Apply the activation to a tensor.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let out = match self {
            Activation::Linear => x.clone(),
            Activation::Relu => x.relu()?,
            Activation::Gelu => x.gelu_erf()?,
            Activation::Tanh => x.tanh()?,
        };
        Ok(out)
    }
}

impl FromStr for Activation {
    type Err = LbertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "gelu" => Ok(Activation::Gelu),
            "tanh" => Ok(Activation::Tanh),
            other => Err(LbertError::Config(format!(
                "unsupported activation: {other}"
            ))),
        }
    }
}
