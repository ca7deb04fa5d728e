//! Reordering a padded batch by descending sequence length, and back.

use candle_core::Tensor;

use crate::{Error, Result};

/// A batch permuted into descending length order.
#[derive(Debug, Clone)]
pub struct SortedBatch {
    /// Input rows in descending length order.
    pub batch: Tensor,
    /// Lengths matching `batch`, non-increasing.
    pub lengths: Vec<usize>,
    /// `sorted[i] = original[permutation[i]]`.
    pub permutation: Tensor,
    /// `original[j] = sorted[restoration_indices[j]]`. Apply with
    /// [`restore_batch_order`] to every batch-indexed output.
    pub restoration_indices: Tensor,
}

/// Sort `batch` (batch axis 0) by `lengths`, longest first.
///
/// The sort is stable, so equal-length rows keep their relative order.
pub fn sort_batch_by_length(batch: &Tensor, lengths: &[usize]) -> Result<SortedBatch> {
    let batch_size = batch.dim(0)?;
    if lengths.len() != batch_size {
        return Err(Error::shape(format!(
            "{} lengths for a batch of {batch_size}",
            lengths.len()
        )));
    }

    let mut order: Vec<usize> = (0..batch_size).collect();
    order.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));

    let mut restoration = vec![0u32; batch_size];
    for (sorted_pos, &original) in order.iter().enumerate() {
        restoration[original] = sorted_pos as u32;
    }

    let device = batch.device();
    let permutation: Vec<u32> = order.iter().map(|&i| i as u32).collect();
    let permutation = Tensor::from_vec(permutation, batch_size, device)?;
    let restoration_indices = Tensor::from_vec(restoration, batch_size, device)?;

    Ok(SortedBatch {
        batch: batch.index_select(&permutation, 0)?,
        lengths: order.iter().map(|&i| lengths[i]).collect(),
        permutation,
        restoration_indices,
    })
}

/// Put the rows of `tensor` along `dim` back into original batch order.
pub fn restore_batch_order(tensor: &Tensor, restoration_indices: &Tensor, dim: usize) -> Result<Tensor> {
    Ok(tensor.index_select(restoration_indices, dim)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn sorts_longest_first() {
        let dev = Device::Cpu;
        let batch = Tensor::arange(0f32, 4.0, &dev).unwrap().reshape((4, 1)).unwrap();
        let sorted = sort_batch_by_length(&batch, &[2, 5, 1, 5]).unwrap();

        assert_eq!(sorted.lengths, vec![5, 5, 2, 1]);
        let rows: Vec<f32> = sorted.batch.flatten_all().unwrap().to_vec1().unwrap();
        // Stable: row 1 before row 3.
        assert_eq!(rows, vec![1.0, 3.0, 0.0, 2.0]);
        let perm: Vec<u32> = sorted.permutation.to_vec1().unwrap();
        assert_eq!(perm, vec![1, 3, 0, 2]);
    }

    #[test]
    fn restore_round_trip_is_identity() {
        let dev = Device::Cpu;
        let batch = Tensor::randn(0f32, 1.0, (5, 3, 2), &dev).unwrap();
        let lengths = [1, 3, 2, 3, 1];
        let sorted = sort_batch_by_length(&batch, &lengths).unwrap();
        let restored = restore_batch_order(&sorted.batch, &sorted.restoration_indices, 0).unwrap();

        let diff: f32 = (restored - &batch)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn restores_along_inner_axis() {
        // Final states keep the batch on axis 1: [layers, batch, hidden].
        let dev = Device::Cpu;
        let batch = Tensor::arange(0u32, 3, &dev).unwrap();
        let sorted = sort_batch_by_length(&batch, &[1, 3, 2]).unwrap();
        let state = sorted
            .batch
            .to_dtype(DType::F32)
            .unwrap()
            .reshape((1, 3, 1))
            .unwrap()
            .repeat((2, 1, 4))
            .unwrap();
        let restored = restore_batch_order(&state, &sorted.restoration_indices, 1).unwrap();
        let firsts: Vec<f32> = restored.get(1).unwrap().narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(firsts, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn rejects_length_count_mismatch() {
        let batch = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            sort_batch_by_length(&batch, &[1, 2]),
            Err(Error::Shape(_))
        ));
    }
}
