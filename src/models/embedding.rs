//! Token and positional embeddings for the T2S decoder
//!
//! Phoneme and semantic ids share the same embedding shape
//! ([`TokenEmbedding`]); positions use a fixed sinusoidal table gated by a
//! learned scalar `alpha` ([`SinePositionalEmbedding`]), matching the
//! `ar_text_position` / `ar_audio_position` modules of the checkpoint.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

/// Embedding table for phoneme or semantic-token ids.
pub struct TokenEmbedding {
    embeddings: Embedding,
}

impl TokenEmbedding {
    /// Load from `<prefix>.word_embeddings.weight`.
    pub fn new(vocab_size: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let embeddings = candle_nn::embedding(vocab_size, dim, vb.pp("word_embeddings"))?;
        Ok(Self { embeddings })
    }

    /// Look up ids of shape `[batch, seq]` into `[batch, seq, dim]`.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        Ok(self.embeddings.forward(ids)?)
    }
}

/// Sinusoidal positional embedding with a learned scalar gate.
///
/// Output is `x * x_scale + alpha * pe[positions]`. The table is
/// precomputed once at construction; `x_scale` is fixed at 1.0 for this
/// model family (the checkpoint was trained without input scaling).
pub struct SinePositionalEmbedding {
    pe: Tensor,
    alpha: Tensor,
    x_scale: f64,
}

impl SinePositionalEmbedding {
    /// Load the `alpha` gate from `<prefix>.alpha` and build the table.
    pub fn new(dim: usize, max_position: usize, vb: VarBuilder) -> Result<Self> {
        let alpha = vb.get(1, "alpha")?;
        let pe = build_pe_table(dim, max_position, vb.device())?;
        Ok(Self {
            pe,
            alpha,
            x_scale: 1.0,
        })
    }

    /// Add positions `0..seq_len` to a `[batch, seq_len, dim]` tensor.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len, _dim) = x.dims3()?;
        let pe = self.pe.narrow(1, 0, seq_len)?;
        self.apply(x, &pe)
    }

    /// Add a single position `pos` to a `[batch, 1, dim]` tensor.
    ///
    /// Used during decoding, where the new token's position continues the
    /// prompt rather than restarting at zero.
    pub fn forward_at(&self, x: &Tensor, pos: usize) -> Result<Tensor> {
        let pe = self.pe.narrow(1, pos, 1)?;
        self.apply(x, &pe)
    }

    fn apply(&self, x: &Tensor, pe: &Tensor) -> Result<Tensor> {
        let gated = pe.broadcast_mul(&self.alpha.reshape((1, 1, 1))?)?;
        Ok(((x * self.x_scale)?.broadcast_add(&gated))?)
    }
}

/// Build the `[1, max_position, dim]` sin/cos table.
///
/// Even channels carry `sin(pos / 10000^(2i/dim))`, odd channels the
/// matching cosine.
fn build_pe_table(dim: usize, max_position: usize, device: &Device) -> Result<Tensor> {
    let half = dim / 2;
    let mut data = vec![0f32; max_position * dim];
    for pos in 0..max_position {
        for i in 0..half {
            let div = (-(2.0 * i as f64) * (10000f64).ln() / dim as f64).exp();
            let angle = pos as f64 * div;
            data[pos * dim + 2 * i] = angle.sin() as f32;
            data[pos * dim + 2 * i + 1] = angle.cos() as f32;
        }
    }
    let pe = Tensor::from_vec(data, (1, max_position, dim), &Device::Cpu)?
        .to_dtype(DType::F32)?
        .to_device(device)?;
    Ok(pe)
}
