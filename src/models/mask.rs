//! Attention masking for the combined text+audio prompt
//!
//! The prompt row layout is `[text padded to max_text, audio padded to
//! max_audio]`. Text queries see every non-padding key; audio queries see
//! all non-padding text plus audio keys up to and including their own
//! position. Padding keys are masked everywhere, and padded positions are
//! additionally zeroed multiplicatively so they never leak into the KV
//! cache or layer-norm statistics.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Additive attention mask for the prompt pass.
///
/// Returns `[batch, 1, src, src]` with 0 for visible pairs and -inf for
/// masked ones, where `src = max_text + max_audio`. `text_lens[b]` and
/// `audio_lens[b]` are row b's true (unpadded) lengths; `audio_lens[b]`
/// may be 0 for reference-free rows.
pub fn prompt_attn_mask(
    text_lens: &[usize],
    audio_lens: &[usize],
    max_text: usize,
    max_audio: usize,
    device: &Device,
) -> Result<Tensor> {
    anyhow::ensure!(
        text_lens.len() == audio_lens.len(),
        "text_lens ({}) and audio_lens ({}) disagree on batch size",
        text_lens.len(),
        audio_lens.len()
    );
    let batch = text_lens.len();
    let src = max_text + max_audio;
    let neg_inf = f32::NEG_INFINITY;

    let mut data = vec![0f32; batch * src * src];
    for b in 0..batch {
        let is_pad = |j: usize| {
            if j < max_text {
                j >= text_lens[b]
            } else {
                j - max_text >= audio_lens[b]
            }
        };
        for i in 0..src {
            for j in 0..src {
                let masked = is_pad(j)
                    || (i >= max_text && j >= max_text && j > i);
                if masked {
                    data[b * src * src + i * src + j] = neg_inf;
                }
            }
        }
    }
    Ok(Tensor::from_vec(data, (batch, 1, src, src), &Device::Cpu)?.to_device(device)?)
}

/// Multiplicative padding scale of shape `[batch, src, 1]`.
///
/// Non-padding positions get 1.0, padding positions 0.0. Multiplying the
/// prompt hidden states by this tensor keeps padded rows at exactly zero
/// through the transformer stack.
pub fn padding_scale(
    text_lens: &[usize],
    audio_lens: &[usize],
    max_text: usize,
    max_audio: usize,
    device: &Device,
) -> Result<Tensor> {
    let batch = text_lens.len();
    let src = max_text + max_audio;
    let mut data = vec![0f32; batch * src];
    for b in 0..batch {
        for j in 0..text_lens[b].min(max_text) {
            data[b * src + j] = 1.0;
        }
        for j in 0..audio_lens[b].min(max_audio) {
            data[b * src + max_text + j] = 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (batch, src, 1), &Device::Cpu)?
        .to_dtype(DType::F32)?
        .to_device(device)?)
}
