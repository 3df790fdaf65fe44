//! Rank assertion and matrix/batch reshaping helpers.
//!
//! Every layer in the crate validates tensor ranks through these helpers so
//! that a bad input fails immediately with the tensor's name, instead of
//! surfacing later as an opaque kernel error. The matrix helpers flatten a
//! `[batch, seq, width]` tensor to `[batch * seq, width]` and back; the
//! round trip preserves values exactly.

use crate::error::{LbertError, Result};
use candle_core::Tensor;

/// Return the dims of `tensor`, failing if its rank is not `expected_rank`.
pub fn dims(tensor: &Tensor, expected_rank: usize, name: &str) -> Result<Vec<usize>> {
    dims_any(tensor, &[expected_rank], name)
}

/// Return the dims of `tensor`, failing if its rank is not in `allowed`.
pub fn dims_any(tensor: &Tensor, allowed: &[usize], name: &str) -> Result<Vec<usize>> {
    let actual = tensor.rank();
    if !allowed.contains(&actual) {
        return Err(LbertError::ShapeMismatch(format!(
            "tensor `{}` has rank {} (shape {:?}), expected rank {:?}",
            name,
            actual,
            tensor.dims(),
            allowed
        )));
    }
    Ok(tensor.dims().to_vec())
}

/// Flatten a rank >= 2 tensor to a matrix `[prod(leading dims), width]`.
///
/// Rank-2 tensors pass through unchanged.
pub fn to_matrix(tensor: &Tensor) -> Result<Tensor> {
    let rank = tensor.rank();
    if rank < 2 {
        return Err(LbertError::ShapeMismatch(format!(
            "cannot flatten rank-{} tensor (shape {:?}) to a matrix",
            rank,
            tensor.dims()
        )));
    }
    if rank == 2 {
        return Ok(tensor.clone());
    }
    let width = tensor.dims()[rank - 1];
    let rows = tensor.elem_count() / width;
    Ok(tensor.reshape((rows, width))?)
}

/// Restore a matrix to the leading dims of `orig_dims`, keeping the matrix
/// width as the last axis.
pub fn from_matrix(tensor: &Tensor, orig_dims: &[usize]) -> Result<Tensor> {
    if orig_dims.len() == 2 {
        return Ok(tensor.clone());
    }
    let matrix_dims = dims(tensor, 2, "matrix")?;
    let mut shape = orig_dims[..orig_dims.len() - 1].to_vec();
    shape.push(matrix_dims[1]);
    Ok(tensor.reshape(shape)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn dims_accepts_expected_rank() {
        let t = Tensor::zeros(&[2, 3, 4], candle_core::DType::F32, &Device::Cpu).unwrap();
        let d = dims(&t, 3, "hidden").unwrap();
        assert_eq!(d, vec![2, 3, 4]);
    }

    #[test]
    fn dims_rejects_wrong_rank() {
        let t = Tensor::zeros(&[2, 3], candle_core::DType::F32, &Device::Cpu).unwrap();
        let err = dims(&t, 3, "hidden").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("hidden"), "error should name the tensor: {msg}");
    }

    #[test]
    fn dims_any_accepts_listed_ranks() {
        let t = Tensor::zeros(&[4, 8], candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(dims_any(&t, &[2, 3], "x").is_ok());
        assert!(dims_any(&t, &[3], "x").is_err());
    }

    #[test]
    fn matrix_round_trip_preserves_values() {
        let t = Tensor::randn(0.0f32, 1.0, &[2, 5, 7], &Device::Cpu).unwrap();
        let m = to_matrix(&t).unwrap();
        assert_eq!(m.dims(), &[10, 7]);

        let back = from_matrix(&m, t.dims()).unwrap();
        assert_eq!(back.dims(), t.dims());

        let a: Vec<f32> = t.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = back.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn to_matrix_rejects_rank_1() {
        let t = Tensor::zeros(6, candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(to_matrix(&t).is_err());
    }
}
