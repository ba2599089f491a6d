//! Per-layer KV cache for autoregressive decoding.
//!
//! Keys and values are cached in pre-head layout `[batch, seq, hidden]`
//! and reshaped per attention call; padded prompt positions enter the
//! cache as zero rows, so decode steps need no attention mask. The cache
//! also supports dropping finished batch rows mid-generation.

use anyhow::Result;
use candle_core::{Device, Tensor};

/// One transformer block's accumulated key/value projections.
pub struct LayerKvCache {
    k: Tensor,
    v: Tensor,
}

impl LayerKvCache {
    /// Seed the cache from the prompt pass projections, `[batch, src, hidden]`.
    pub fn new(k: Tensor, v: Tensor) -> Result<Self> {
        anyhow::ensure!(
            k.dims() == v.dims(),
            "k {:?} and v {:?} shapes differ",
            k.dims(),
            v.dims()
        );
        Ok(Self { k, v })
    }

    /// Cached sequence length.
    pub fn len(&self) -> usize {
        self.k.dims()[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one decode step's `[batch, 1, hidden]` projections and return
    /// the full extended key/value tensors.
    pub fn append(&mut self, k_new: &Tensor, v_new: &Tensor) -> Result<(Tensor, Tensor)> {
        self.k = Tensor::cat(&[&self.k, k_new], 1)?;
        self.v = Tensor::cat(&[&self.v, v_new], 1)?;
        Ok((self.k.clone(), self.v.clone()))
    }

    /// Keep only the given batch rows, in order.
    pub fn compact(&mut self, keep_rows: &[usize], device: &Device) -> Result<()> {
        let idx: Vec<u32> = keep_rows.iter().map(|&r| r as u32).collect();
        let idx = Tensor::new(idx.as_slice(), device)?;
        self.k = self.k.contiguous()?.index_select(&idx, 0)?;
        self.v = self.v.contiguous()?.index_select(&idx, 0)?;
        Ok(())
    }

    /// Full cached keys, `[batch, seq, hidden]`.
    pub fn keys(&self) -> &Tensor {
        &self.k
    }

    /// Full cached values, `[batch, seq, hidden]`.
    pub fn values(&self) -> &Tensor {
        &self.v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn cache_2x3(device: &Device) -> LayerKvCache {
        let k = Tensor::randn(0.0f32, 1.0, (2, 3, 8), device).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, (2, 3, 8), device).unwrap();
        LayerKvCache::new(k, v).unwrap()
    }

    #[test]
    fn test_len_after_seed() {
        let device = Device::Cpu;
        let cache = cache_2x3(&device);
        assert_eq!(cache.len(), 3);
        assert!(!cache.is_empty());
    }

    #[test]
    fn test_append_grows_by_one() {
        let device = Device::Cpu;
        let mut cache = cache_2x3(&device);
        let k_new = Tensor::randn(0.0f32, 1.0, (2, 1, 8), &device).unwrap();
        let v_new = Tensor::randn(0.0f32, 1.0, (2, 1, 8), &device).unwrap();

        let (k, v) = cache.append(&k_new, &v_new).unwrap();
        assert_eq!(k.dims(), &[2, 4, 8]);
        assert_eq!(v.dims(), &[2, 4, 8]);
        assert_eq!(cache.len(), 4);

        // The appended step occupies the last cache position.
        let tail: Vec<f32> = k.narrow(1, 3, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let expected: Vec<f32> = k_new.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(tail, expected);
    }

    #[test]
    fn test_compact_selects_rows() {
        let device = Device::Cpu;
        let k = Tensor::new(
            &[[[1f32, 1.0]], [[2.0, 2.0]], [[3.0, 3.0]]],
            &device,
        )
        .unwrap();
        let mut cache = LayerKvCache::new(k.clone(), k).unwrap();

        cache.compact(&[0, 2], &device).unwrap();
        assert_eq!(cache.keys().dims(), &[2, 1, 2]);
        let flat: Vec<f32> = cache.keys().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(flat, vec![1.0, 1.0, 3.0, 3.0]);
    }

    #[test]
    fn test_new_rejects_shape_mismatch() {
        let device = Device::Cpu;
        let k = Tensor::zeros((2, 3, 8), candle_core::DType::F32, &device).unwrap();
        let v = Tensor::zeros((2, 4, 8), candle_core::DType::F32, &device).unwrap();
        assert!(LayerKvCache::new(k, v).is_err());
    }
}
