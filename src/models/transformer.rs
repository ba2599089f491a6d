//! Transformer stack for the T2S decoder
//!
//! Blocks are post-norm: `x = ln1(x + attn(x)); x = ln2(x + ffn(x))`.
//! Attention uses a fused QKV projection (`self_attn.in_proj_*` in the
//! checkpoint) and caches key/value in pre-head layout. The prompt pass
//! takes an additive mask plus a multiplicative padding scale; decode
//! steps attend the full cache unmasked, relying on padded cache rows
//! being zero.

use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{LayerNorm, Linear, Module, VarBuilder};

use super::config::T2sModelConfig;
use super::kv_cache::LayerKvCache;

/// Two-layer position-wise feed-forward with ReLU.
pub struct FeedForward {
    linear1: Linear,
    linear2: Linear,
}

impl FeedForward {
    pub fn new(hidden_dim: usize, ffn_dim: usize, vb: VarBuilder) -> Result<Self> {
        let linear1 = candle_nn::linear(hidden_dim, ffn_dim, vb.pp("linear1"))?;
        let linear2 = candle_nn::linear(ffn_dim, hidden_dim, vb.pp("linear2"))?;
        Ok(Self { linear1, linear2 })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.linear1.forward(x)?.relu()?;
        Ok(self.linear2.forward(&x)?)
    }
}

/// One decoder block: fused-QKV self-attention plus feed-forward, each
/// followed by residual-add and layer-norm.
pub struct T2sBlock {
    in_proj: Linear,
    out_proj: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    ffn: FeedForward,
    num_heads: usize,
    head_dim: usize,
}

impl T2sBlock {
    pub fn new(config: &T2sModelConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_dim;
        let attn_vb = vb.pp("self_attn");
        let in_proj_weight = attn_vb.get((3 * h, h), "in_proj_weight")?;
        let in_proj_bias = attn_vb.get(3 * h, "in_proj_bias")?;
        let in_proj = Linear::new(in_proj_weight, Some(in_proj_bias));
        let out_proj = candle_nn::linear(h, h, attn_vb.pp("out_proj"))?;
        let norm1 = candle_nn::layer_norm(h, config.layer_norm_eps, vb.pp("norm1"))?;
        let norm2 = candle_nn::layer_norm(h, config.layer_norm_eps, vb.pp("norm2"))?;
        let ffn = FeedForward::new(h, config.ffn_dim, vb.clone())?;
        Ok(Self {
            in_proj,
            out_proj,
            norm1,
            norm2,
            ffn,
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
        })
    }

    /// Split the fused projection into q, k, v of shape `[batch, seq, hidden]`.
    fn qkv(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let h = self.num_heads * self.head_dim;
        let qkv = self.in_proj.forward(x)?;
        let q = qkv.narrow(D::Minus1, 0, h)?;
        let k = qkv.narrow(D::Minus1, h, h)?;
        let v = qkv.narrow(D::Minus1, 2 * h, h)?;
        Ok((q, k, v))
    }

    /// `[batch, seq, hidden]` to `[batch, heads, seq, head_dim]`.
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        Ok(x.reshape((batch, seq, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Scaled dot-product attention; `mask` is additive `[batch, 1, q, k]`.
    fn attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let q = self.split_heads(q)?;
        let k = self.split_heads(k)?;
        let v = self.split_heads(v)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut scores = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = weights.matmul(&v)?;

        let (batch, _, q_len, _) = out.dims4()?;
        let out = out
            .transpose(1, 2)?
            .reshape((batch, q_len, self.num_heads * self.head_dim))?;
        Ok(self.out_proj.forward(&out)?)
    }

    /// Run the full prompt through this block and seed its KV cache.
    ///
    /// `padding_scale` is `[batch, src, 1]` with zeros at padded positions;
    /// it is applied to the cached k/v and to the block output so padding
    /// never accumulates through layer norms or into the cache.
    pub fn process_prompt(
        &self,
        x: &Tensor,
        attn_mask: &Tensor,
        padding_scale: &Tensor,
    ) -> Result<(Tensor, LayerKvCache)> {
        let (q, k, v) = self.qkv(x)?;
        let k = k.broadcast_mul(padding_scale)?;
        let v = v.broadcast_mul(padding_scale)?;
        let cache = LayerKvCache::new(k.clone(), v.clone())?;

        let attn = self.attention(&q, &k, &v, Some(attn_mask))?;
        let x = self.norm1.forward(&(x + attn)?)?;
        let x = self.norm2.forward(&(&x + self.ffn.forward(&x)?)?)?;
        let x = x.broadcast_mul(padding_scale)?;
        Ok((x, cache))
    }

    /// Advance one decode step. `x` is `[batch, 1, hidden]`; the cache
    /// grows by one position.
    pub fn decode_next_token(&self, x: &Tensor, cache: &mut LayerKvCache) -> Result<Tensor> {
        let (q, k_new, v_new) = self.qkv(x)?;
        let (k, v) = cache.append(&k_new, &v_new)?;

        let attn = self.attention(&q, &k, &v, None)?;
        let x = self.norm1.forward(&(x + attn)?)?;
        let x = self.norm2.forward(&(&x + self.ffn.forward(&x)?)?)?;
        Ok(x)
    }
}

/// The full stack of decoder blocks (`h.layers.{i}` in the checkpoint).
pub struct T2sTransformer {
    blocks: Vec<T2sBlock>,
}

impl T2sTransformer {
    pub fn new(config: &T2sModelConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("h").pp("layers");
        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(T2sBlock::new(config, vb.pp(i))?);
        }
        Ok(Self { blocks })
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Prompt pass: returns the final hidden state and one seeded cache
    /// per block.
    pub fn process_prompt(
        &self,
        x: &Tensor,
        attn_mask: &Tensor,
        padding_scale: &Tensor,
    ) -> Result<(Tensor, Vec<LayerKvCache>)> {
        let mut x = x.clone();
        let mut caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (next, cache) = block.process_prompt(&x, attn_mask, padding_scale)?;
            x = next;
            caches.push(cache);
        }
        Ok((x, caches))
    }

    /// Decode pass for one new token; every block's cache grows by one.
    pub fn decode_next_token(
        &self,
        x: &Tensor,
        caches: &mut [LayerKvCache],
    ) -> Result<Tensor> {
        anyhow::ensure!(
            caches.len() == self.blocks.len(),
            "cache count {} does not match layer count {}",
            caches.len(),
            self.blocks.len()
        );
        let mut x = x.clone();
        for (block, cache) in self.blocks.iter().zip(caches.iter_mut()) {
            x = block.decode_next_token(&x, cache)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::mask::{padding_scale, prompt_attn_mask};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> T2sModelConfig {
        T2sModelConfig {
            embedding_dim: 16,
            hidden_dim: 16,
            num_heads: 2,
            num_layers: 2,
            ffn_dim: 32,
            vocab_size: 9,
            phoneme_vocab_size: 12,
            bert_dim: 8,
            ..Default::default()
        }
    }

    /// Replace the VarMap's zero-initialized weights with random values.
    fn randomize(varmap: &VarMap, device: &Device) {
        let data = varmap.data().lock().unwrap();
        for (_, var) in data.iter() {
            let rand = Tensor::randn(0.0f32, 0.1, var.dims(), device).unwrap();
            var.set(&rand).unwrap();
        }
    }

    fn build(device: &Device) -> (T2sModelConfig, T2sTransformer) {
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = T2sTransformer::new(&config, vb).unwrap();
        randomize(&varmap, device);
        (config, model)
    }

    #[test]
    fn test_process_prompt_shapes_and_cache_len() {
        let device = Device::Cpu;
        let (config, model) = build(&device);

        let x = Tensor::randn(0.0f32, 1.0, (2, 5, config.hidden_dim), &device).unwrap();
        let mask = prompt_attn_mask(&[2, 2], &[3, 3], 2, 3, &device).unwrap();
        let scale = padding_scale(&[2, 2], &[3, 3], 2, 3, &device).unwrap();

        let (out, caches) = model.process_prompt(&x, &mask, &scale).unwrap();
        assert_eq!(out.dims(), &[2, 5, config.hidden_dim]);
        assert_eq!(caches.len(), config.num_layers);
        for cache in &caches {
            assert_eq!(cache.len(), 5);
        }
    }

    #[test]
    fn test_decode_grows_every_cache_by_one() {
        let device = Device::Cpu;
        let (config, model) = build(&device);

        let x = Tensor::randn(0.0f32, 1.0, (1, 4, config.hidden_dim), &device).unwrap();
        let mask = prompt_attn_mask(&[2], &[2], 2, 2, &device).unwrap();
        let scale = padding_scale(&[2], &[2], 2, 2, &device).unwrap();
        let (_, mut caches) = model.process_prompt(&x, &mask, &scale).unwrap();

        let step = Tensor::randn(0.0f32, 1.0, (1, 1, config.hidden_dim), &device).unwrap();
        for k in 1..=3 {
            let out = model.decode_next_token(&step, &mut caches).unwrap();
            assert_eq!(out.dims(), &[1, 1, config.hidden_dim]);
            for cache in &caches {
                assert_eq!(cache.len(), 4 + k);
            }
        }
    }

    #[test]
    fn test_padded_positions_stay_zero() {
        let device = Device::Cpu;
        let (config, model) = build(&device);

        // Row layout: text 2 of 3, audio 1 of 2, so positions 2 and 4 are
        // padding.
        let x = Tensor::randn(0.0f32, 1.0, (1, 5, config.hidden_dim), &device).unwrap();
        let mask = prompt_attn_mask(&[2], &[1], 3, 2, &device).unwrap();
        let scale = padding_scale(&[2], &[1], 3, 2, &device).unwrap();

        let (out, caches) = model.process_prompt(&x, &mask, &scale).unwrap();
        for pos in [2usize, 4] {
            let row: Vec<f32> = out
                .narrow(1, pos, 1)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            assert!(row.iter().all(|v| v.abs() < 1e-7), "output pos {} not zero", pos);
            let k_row: Vec<f32> = caches[0]
                .keys()
                .narrow(1, pos, 1)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            assert!(k_row.iter().all(|v| v.abs() < 1e-7), "cached k pos {} not zero", pos);
        }
    }

    #[test]
    fn test_masked_key_does_not_influence_query() {
        let device = Device::Cpu;
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = T2sBlock::new(&config, vb).unwrap();
        randomize(&varmap, &device);

        // Two prompts identical except at audio position 4, which the first
        // audio query (position 2) is masked from.
        let x1 = Tensor::randn(0.0f32, 1.0, (1, 5, config.hidden_dim), &device).unwrap();
        let bump = Tensor::zeros((1, 5, config.hidden_dim), DType::F32, &device)
            .unwrap()
            .slice_assign(
                &[0..1, 4..5, 0..config.hidden_dim],
                &Tensor::ones((1, 1, config.hidden_dim), DType::F32, &device).unwrap(),
            )
            .unwrap();
        let x2 = (&x1 + &bump).unwrap();

        let mask = prompt_attn_mask(&[2], &[3], 2, 3, &device).unwrap();
        let scale = padding_scale(&[2], &[3], 2, 3, &device).unwrap();
        let (out1, _) = block.process_prompt(&x1, &mask, &scale).unwrap();
        let (out2, _) = block.process_prompt(&x2, &mask, &scale).unwrap();

        let a: Vec<f32> = out1.narrow(1, 2, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = out2.narrow(1, 2, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }
}
