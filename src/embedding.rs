//! Frozen word-embedding table
//!
//! Shared read-only by rounding guidance and the token decoder. Distances
//! to every row are computed in one batched pass as
//! `|x|^2 + |e|^2 - 2 x.e^T` instead of per-pair loops.

use candle_core::{DType, Device, Tensor, D};

use crate::error::{Result, SampleError};

/// Embedding table of shape (vocab, dim)
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    weight: Tensor,
    /// Squared row norms as a (1, vocab) row, precomputed once
    sq_norms: Tensor,
}

impl EmbeddingTable {
    pub fn new(weight: Tensor) -> Result<Self> {
        if weight.rank() != 2 {
            return Err(SampleError::config(format!(
                "embedding table must be (vocab, dim), got {:?}",
                weight.dims()
            )));
        }
        let weight = weight.to_dtype(DType::F32)?.contiguous()?;
        let sq_norms = weight.sqr()?.sum_keepdim(1)?.t()?.contiguous()?;
        Ok(Self { weight, sq_norms })
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn device(&self) -> &Device {
        self.weight.device()
    }

    /// Look up embeddings for equal-length token sequences -> (batch, len, dim)
    pub fn encode(&self, sequences: &[Vec<u32>]) -> Result<Tensor> {
        let seq_len = sequences.first().map(Vec::len).unwrap_or(0);
        let mut flat = Vec::with_capacity(sequences.len() * seq_len);
        for (i, seq) in sequences.iter().enumerate() {
            if seq.len() != seq_len {
                return Err(SampleError::config(format!(
                    "sequence {} has length {}, expected {}",
                    i,
                    seq.len(),
                    seq_len
                )));
            }
            if let Some(&bad) = seq.iter().find(|&&id| id as usize >= self.vocab_size()) {
                return Err(SampleError::config(format!(
                    "token id {} outside embedding table of {} rows",
                    bad,
                    self.vocab_size()
                )));
            }
            flat.extend_from_slice(seq);
        }
        let ids = Tensor::from_vec(flat, sequences.len() * seq_len, self.device())?;
        let rows = self.weight.index_select(&ids, 0)?;
        Ok(rows.reshape((sequences.len(), seq_len, self.dim()))?)
    }

    /// Squared Euclidean distance from every position to every row.
    ///
    /// `x` is (..., dim); the result is (positions, vocab), clamped at zero.
    pub fn squared_distances(&self, x: &Tensor) -> Result<Tensor> {
        let dim = self.check_dim(x)?;
        let x = x.to_dtype(DType::F32)?.reshape(((), dim))?;

        let x_sq = x.sqr()?.sum_keepdim(1)?; // (N, 1)
        let cross = x.matmul(&self.weight.t()?)?; // (N, V)
        let dist = x_sq
            .broadcast_add(&self.sq_norms)?
            .sub(&cross.affine(2.0, 0.0)?)?;
        // Cancellation can leave tiny negatives for exact matches
        Ok(dist.relu()?)
    }

    /// Nearest row per position as a (positions,) u32 tensor on the table's
    /// device. Ties go to the lower index.
    pub fn nearest_ids(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.squared_distances(x)?.argmin(D::Minus1)?)
    }

    /// Host copy of [`EmbeddingTable::nearest_ids`]
    pub fn nearest_indices(&self, x: &Tensor) -> Result<Vec<u32>> {
        Ok(self.nearest_ids(x)?.to_vec1()?)
    }

    /// Replace every position of `x` with its nearest table row
    pub fn round(&self, x: &Tensor) -> Result<Tensor> {
        let ids = self.nearest_ids(x)?;
        let rows = self.weight.index_select(&ids, 0)?;
        Ok(rows.reshape(x.shape())?.to_device(x.device())?)
    }

    fn check_dim(&self, x: &Tensor) -> Result<usize> {
        let dim = x.dims().last().copied().unwrap_or(0);
        if dim != self.dim() {
            return Err(SampleError::config(format!(
                "embedding dim mismatch: sample has {}, table has {}",
                dim,
                self.dim()
            )));
        }
        Ok(dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Result<EmbeddingTable> {
        let weight = Tensor::new(
            &[[1f32, 0.], [0., 1.], [-1., 0.], [0., -1.]],
            &Device::Cpu,
        )?;
        EmbeddingTable::new(weight)
    }

    #[test]
    fn test_nearest_ids_stay_on_device() -> Result<()> {
        let table = table()?;
        // Second position is equidistant from rows 0 and 1
        let x = Tensor::new(&[[[-0.8f32, 0.1], [0.5, 0.5]]], &Device::Cpu)?;
        let ids = table.nearest_ids(&x)?;
        assert_eq!(ids.dtype(), DType::U32);
        assert_eq!(ids.dims(), &[2]);
        assert_eq!(ids.to_vec1::<u32>()?, vec![2, 0]);
        Ok(())
    }

    #[test]
    fn test_nearest_and_round() -> Result<()> {
        let table = table()?;
        let x = Tensor::new(&[[[0.9f32, 0.2], [0.1, -2.0]]], &Device::Cpu)?;
        assert_eq!(table.nearest_indices(&x)?, vec![0, 3]);

        let rounded = table.round(&x)?;
        assert_eq!(rounded.dims(), &[1, 2, 2]);
        assert_eq!(rounded.to_vec3::<f32>()?, vec![vec![vec![1., 0.], vec![0., -1.]]]);
        Ok(())
    }

    #[test]
    fn test_equidistant_picks_lower_index() -> Result<()> {
        let table = table()?;
        // The origin is at distance 1 from every row
        let x = Tensor::zeros((1, 1, 2), DType::F32, &Device::Cpu)?;
        assert_eq!(table.nearest_indices(&x)?, vec![0]);
        Ok(())
    }

    #[test]
    fn test_encode_checks_ids() -> Result<()> {
        let table = table()?;
        let encoded = table.encode(&[vec![2, 1], vec![0, 3]])?;
        assert_eq!(encoded.dims(), &[2, 2, 2]);
        assert!(matches!(
            table.encode(&[vec![4]]),
            Err(SampleError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn test_dim_mismatch() -> Result<()> {
        let table = table()?;
        let x = Tensor::zeros((1, 1, 3), DType::F32, &Device::Cpu)?;
        assert!(table.squared_distances(&x).is_err());
        Ok(())
    }
}
