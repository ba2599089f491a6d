//! Text-to-semantic decoder
//!
//! Turns phoneme ids plus BERT features (and optionally a reference
//! audio-token prompt) into semantic token sequences via autoregressive
//! decoding with KV caching. Weight names mirror the original checkpoint
//! (`bert_proj`, `ar_text_embedding`, `ar_audio_embedding`,
//! `ar_text_position`, `ar_audio_position`, `h.layers.*`,
//! `ar_predict_layer`).

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use tracing::{debug, info, warn};

use super::config::T2sModelConfig;
use super::embedding::{SinePositionalEmbedding, TokenEmbedding};
use super::mask::{padding_scale, prompt_attn_mask};
use super::transformer::T2sTransformer;
use crate::generation::{greedy_rows, sample_next, BatchTracker, SamplingContext, SamplingParams};

/// Hard cap on decode steps per generation call.
pub const MAX_DECODE_STEPS: usize = 1500;

/// Result of one generation call.
#[derive(Debug, Clone)]
pub struct T2sGeneration {
    /// Semantic token ids per batch row (prompt prefix included when a
    /// prompt was given). Never contains the EOS id.
    pub semantic_tokens: Vec<Vec<u32>>,
    /// Decode step at which each row terminated (all zeros in
    /// reference-free mode).
    pub terminal_steps: Vec<usize>,
}

/// The autoregressive T2S decoder.
pub struct Text2SemanticDecoder {
    bert_proj: Linear,
    ar_text_embedding: TokenEmbedding,
    ar_text_position: SinePositionalEmbedding,
    ar_audio_embedding: TokenEmbedding,
    ar_audio_position: SinePositionalEmbedding,
    transformer: T2sTransformer,
    ar_predict_layer: Linear,
    config: T2sModelConfig,
    device: Device,
}

impl Text2SemanticDecoder {
    pub fn new(config: &T2sModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let bert_proj = candle_nn::linear(
            config.bert_dim,
            config.embedding_dim,
            vb.pp("bert_proj"),
        )?;
        let ar_text_embedding = TokenEmbedding::new(
            config.phoneme_vocab_size,
            config.embedding_dim,
            vb.pp("ar_text_embedding"),
        )?;
        let ar_text_position = SinePositionalEmbedding::new(
            config.embedding_dim,
            config.max_position,
            vb.pp("ar_text_position"),
        )?;
        let ar_audio_embedding = TokenEmbedding::new(
            config.vocab_size,
            config.embedding_dim,
            vb.pp("ar_audio_embedding"),
        )?;
        let ar_audio_position = SinePositionalEmbedding::new(
            config.embedding_dim,
            config.max_position,
            vb.pp("ar_audio_position"),
        )?;
        let transformer = T2sTransformer::new(config, vb.clone())?;
        let ar_predict_layer = candle_nn::linear_no_bias(
            config.hidden_dim,
            config.vocab_size,
            vb.pp("ar_predict_layer"),
        )?;
        Ok(Self {
            bert_proj,
            ar_text_embedding,
            ar_text_position,
            ar_audio_embedding,
            ar_audio_position,
            transformer,
            ar_predict_layer,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    pub fn config(&self) -> &T2sModelConfig {
        &self.config
    }

    /// Embed one row's phoneme ids plus its `[bert_dim, len]` feature
    /// matrix into `[1, len, embedding_dim]` with positions applied.
    fn embed_text(&self, phones: &[u32], bert: &Tensor) -> Result<Tensor> {
        let (bert_dim, bert_len) = bert.dims2()?;
        anyhow::ensure!(
            bert_dim == self.config.bert_dim && bert_len == phones.len(),
            "bert features {:?} do not match {} phonemes",
            bert.dims(),
            phones.len()
        );
        let ids = Tensor::new(phones, &self.device)?.unsqueeze(0)?;
        let text_emb = self.ar_text_embedding.forward(&ids)?;
        let bert_emb = self.bert_proj.forward(&bert.t()?.unsqueeze(0)?)?;
        self.ar_text_position.forward(&(text_emb + bert_emb)?)
    }

    /// Embed one row's audio prompt into `[1, len, embedding_dim]`.
    fn embed_audio_prompt(&self, prompt: &[u32]) -> Result<Tensor> {
        let ids = Tensor::new(prompt, &self.device)?.unsqueeze(0)?;
        let emb = self.ar_audio_embedding.forward(&ids)?;
        self.ar_audio_position.forward(&emb)
    }

    /// Right-pad a `[1, len, dim]` row to `[1, target, dim]` with zeros.
    fn pad_row(&self, row: &Tensor, target: usize) -> Result<Tensor> {
        let (_, len, dim) = row.dims3()?;
        if len == target {
            return Ok(row.clone());
        }
        let pad = Tensor::zeros((1, target - len, dim), row.dtype(), &self.device)?;
        Ok(Tensor::cat(&[row, &pad], 1)?)
    }

    /// Run one batched generation call.
    ///
    /// `phoneme_ids[b]` and `bert_features[b]` describe row b's text;
    /// `prompts`, when given, holds one reference semantic-token sequence
    /// per row (reference-free mode otherwise). Rows may have ragged
    /// lengths; shorter rows are padded internally and retire from the
    /// batch independently.
    pub fn infer(
        &self,
        phoneme_ids: &[Vec<u32>],
        bert_features: &[Tensor],
        prompts: Option<&[Vec<u32>]>,
        params: &SamplingParams,
        ctx: &mut SamplingContext,
    ) -> Result<T2sGeneration> {
        let batch = phoneme_ids.len();
        anyhow::ensure!(batch > 0, "empty batch");
        anyhow::ensure!(
            bert_features.len() == batch,
            "bert_features rows ({}) do not match batch ({})",
            bert_features.len(),
            batch
        );
        if let Some(prompts) = prompts {
            anyhow::ensure!(
                prompts.len() == batch,
                "prompt rows ({}) do not match batch ({})",
                prompts.len(),
                batch
            );
        }

        let text_lens: Vec<usize> = phoneme_ids.iter().map(Vec::len).collect();
        for (b, &len) in text_lens.iter().enumerate() {
            anyhow::ensure!(len > 0, "row {} has no phonemes", b);
        }
        let audio_lens: Vec<usize> = match prompts {
            Some(prompts) => prompts.iter().map(Vec::len).collect(),
            None => vec![0; batch],
        };
        let ref_free = prompts.is_none();
        // max_text_len can widen the padded text span beyond the batch
        // maximum; the extra columns are masked like any other padding.
        let mut max_text = *text_lens.iter().max().unwrap_or(&0);
        if let Some(width) = params.max_text_len {
            max_text = max_text.max(width);
        }
        let max_audio = *audio_lens.iter().max().unwrap_or(&0);
        debug!(
            batch,
            max_text, max_audio, ref_free, "starting semantic token generation"
        );

        // Build the padded prompt: per-row text (+audio) embeddings with
        // positions applied before padding.
        let mut rows = Vec::with_capacity(batch);
        for b in 0..batch {
            let text = self.embed_text(&phoneme_ids[b], &bert_features[b])?;
            rows.push(self.pad_row(&text, max_text)?);
        }
        if let Some(prompts) = prompts {
            if max_audio > 0 {
                for (row, prompt) in rows.iter_mut().zip(prompts.iter()) {
                    let audio = if prompt.is_empty() {
                        Tensor::zeros(
                            (1, max_audio, self.config.embedding_dim),
                            DType::F32,
                            &self.device,
                        )?
                    } else {
                        self.pad_row(&self.embed_audio_prompt(prompt)?, max_audio)?
                    };
                    *row = Tensor::cat(&[&*row, &audio], 1)?;
                }
            }
        }
        let x = Tensor::cat(&rows, 0)?;

        let mask = prompt_attn_mask(&text_lens, &audio_lens, max_text, max_audio, &self.device)?;
        let scale = padding_scale(&text_lens, &audio_lens, max_text, max_audio, &self.device)?;
        let (hidden, mut caches) = self.transformer.process_prompt(&x, &mask, &scale)?;

        // First logits come from each row's last real prompt position.
        let mut picks = Vec::with_capacity(batch);
        for b in 0..batch {
            let pos = if audio_lens[b] > 0 {
                max_text + audio_lens[b] - 1
            } else {
                text_lens[b] - 1
            };
            picks.push(hidden.i((b, pos))?);
        }
        let prompt_logits = self.ar_predict_layer.forward(&Tensor::stack(&picks, 0)?)?;

        // Running ids per original row; the padded prompt feeds the
        // repetition penalty, generated ids feed both penalty and output.
        let eos = self.config.eos_id();
        let mut penalty_rows: Vec<Vec<u32>> = (0..batch)
            .map(|b| match prompts {
                Some(prompts) => {
                    let mut row = prompts[b].clone();
                    row.resize(max_audio, 0);
                    row
                }
                None => Vec::new(),
            })
            .collect();
        let mut generated: Vec<Vec<u32>> = vec![Vec::new(); batch];
        let mut tracker = BatchTracker::new(batch);
        let mut last_ids: Vec<u32> = Vec::new();

        for step in 0..MAX_DECODE_STEPS {
            let live = tracker.live_count();
            let logits = if step == 0 {
                // The EOS column is dropped at step 0 so the first sampled
                // token is always a real semantic id.
                prompt_logits.narrow(1, 0, self.config.vocab_size - 1)?
            } else {
                let ids = Tensor::new(last_ids.as_slice(), &self.device)?.unsqueeze(1)?;
                let emb = self.ar_audio_embedding.forward(&ids)?;
                let x_step = self
                    .ar_audio_position
                    .forward_at(&emb, max_audio + step - 1)?;
                let h = self.transformer.decode_next_token(&x_step, &mut caches)?;
                self.ar_predict_layer.forward(&h.squeeze(1)?)?
            };

            let prev: Vec<Vec<u32>> = (0..live)
                .map(|pos| penalty_rows[tracker.original_row(pos)].clone())
                .collect();
            let samples = sample_next(&logits, &prev, params, ctx)?;
            let argmax = greedy_rows(&logits)?;

            let mut finished = Vec::new();
            for pos in 0..live {
                let row = tracker.original_row(pos);
                penalty_rows[row].push(samples[pos]);
                generated[row].push(samples[pos]);

                if samples[pos] == eos || argmax[pos] == eos {
                    finished.push((pos, step.saturating_sub(1)));
                } else if params.early_stop_num >= 0
                    && generated[row].len() as i64 > params.early_stop_num
                {
                    finished.push((pos, step));
                } else if step + 1 == MAX_DECODE_STEPS {
                    warn!(row, step, "hit decode step cap without EOS");
                    finished.push((pos, step));
                }
            }

            let keep = tracker.retire(&finished)?;
            if tracker.is_done() {
                break;
            }
            if keep.len() < live {
                for cache in caches.iter_mut() {
                    cache.compact(&keep, &self.device)?;
                }
            }
            last_ids = keep.iter().map(|&pos| samples[pos]).collect();
        }

        // Trim each row's terminal sample; a row left empty gets the zero
        // token so downstream stages always see at least one id.
        let mut semantic_tokens = Vec::with_capacity(batch);
        for b in 0..batch {
            let mut toks: Vec<u32> = match prompts {
                Some(prompts) => prompts[b].clone(),
                None => Vec::new(),
            };
            toks.extend_from_slice(&generated[b]);
            toks.pop();
            if toks.is_empty() {
                warn!(row = b, "bad zero prediction");
                toks.push(0);
            }
            semantic_tokens.push(toks);
        }
        let terminal_steps = if ref_free {
            vec![0; batch]
        } else {
            tracker.into_terminal_steps()
        };
        info!(
            batch,
            steps = ?terminal_steps,
            "semantic token generation finished"
        );
        Ok(T2sGeneration {
            semantic_tokens,
            terminal_steps,
        })
    }
}
