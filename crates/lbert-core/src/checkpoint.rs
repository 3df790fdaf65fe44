//! Checkpoint loading and warm-start variable mapping.
//!
//! Stored variables come from SafeTensors files. Warm-starting intersects
//! the live parameter names with the stored names; the downstream
//! classification-head variables are excluded from the mapping so a task
//! head is always freshly initialized.

use crate::error::{LbertError, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Variable names never restored from a checkpoint.
pub const EXCLUDED_VARIABLES: [&str; 2] = ["output_weights", "output_bias"];

/// A set of stored variables loaded from disk.
pub struct Checkpoint {
    tensors: HashMap<String, Tensor>,
    device: Device,
}

impl Checkpoint {
    /// Load a single SafeTensors file.
    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        let tensors = Self::load_safetensors_file(path, device)?;
        Ok(Self {
            tensors,
            device: device.clone(),
        })
    }

    /// Load every `.safetensors` file in a directory.
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self> {
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "safetensors") {
                files.push(path);
            }
        }
        // Deterministic loading order.
        files.sort();

        if files.is_empty() {
            return Err(LbertError::Checkpoint(format!(
                "no .safetensors files found in {}",
                dir.display()
            )));
        }

        let mut tensors = HashMap::new();
        for path in &files {
            tensors.extend(Self::load_safetensors_file(path, device)?);
        }
        Ok(Self {
            tensors,
            device: device.clone(),
        })
    }

    fn load_safetensors_file(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
        let data = fs::read(path).map_err(|e| {
            LbertError::Checkpoint(format!("cannot read {}: {e}", path.display()))
        })?;
        let safetensors = SafeTensors::deserialize(&data).map_err(|e| {
            LbertError::Checkpoint(format!("cannot deserialize {}: {e}", path.display()))
        })?;

        let mut tensors = HashMap::new();
        for (name, view) in safetensors.tensors() {
            let tensor = Self::view_to_tensor(&view, device)?;
            tensors.insert(name.to_string(), tensor);
        }
        Ok(tensors)
    }

    /// Convert a SafeTensors view to an f32 Candle tensor. Half-precision
    /// checkpoints are upcast; the model itself runs in f32.
    fn view_to_tensor(view: &safetensors::tensor::TensorView, device: &Device) -> Result<Tensor> {
        let shape: Vec<usize> = view.shape().to_vec();
        let data = view.data();

        let tensor = match view.dtype() {
            safetensors::Dtype::F32 => {
                let values: &[f32] = bytemuck::cast_slice(data);
                Tensor::from_slice(values, shape.as_slice(), device)?
            }
            safetensors::Dtype::F16 => {
                let values: &[half::f16] = bytemuck::cast_slice(data);
                Tensor::from_slice(values, shape.as_slice(), device)?.to_dtype(DType::F32)?
            }
            safetensors::Dtype::BF16 => {
                let values: &[half::bf16] = bytemuck::cast_slice(data);
                Tensor::from_slice(values, shape.as_slice(), device)?.to_dtype(DType::F32)?
            }
            other => {
                return Err(LbertError::Checkpoint(format!(
                    "unsupported dtype {other:?} for variable"
                )));
            }
        };
        Ok(tensor)
    }

    /// Intersection of `live_names` and stored names, minus the excluded
    /// classification-head variables.
    pub fn assignment_map(&self, live_names: &[String]) -> HashMap<String, Tensor> {
        live_names
            .iter()
            .filter(|name| !EXCLUDED_VARIABLES.contains(&name.as_str()))
            .filter_map(|name| {
                self.tensors
                    .get(name)
                    .map(|tensor| (name.clone(), tensor.clone()))
            })
            .collect()
    }

    /// Get a stored variable by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Names of every stored variable.
    pub fn variable_names(&self) -> Vec<&str> {
        self.tensors.keys().map(|s| s.as_str()).collect()
    }

    /// Number of stored variables.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the checkpoint holds no variables.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Device the variables were loaded to.
    pub fn device(&self) -> &Device {
        &self.device
    }
}
