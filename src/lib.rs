//! # GPT-SoVITS T2S
//!
//! Pure Rust inference for the GPT-SoVITS text-to-semantic stage: the
//! autoregressive transformer that turns phoneme sequences (plus phone-level
//! BERT features) into semantic codec tokens.
//!
//! ## Features
//!
//! - **CPU inference** with optional MKL/Accelerate for faster BLAS operations
//! - **CUDA** support for NVIDIA GPU acceleration
//! - **Metal** support for Apple Silicon
//! - **Batched decoding** with per-layer KV caches and per-row early stopping
//! - **Text front-end** with punctuation-aware chunking and per-character
//!   language run detection for zh/en/ja/ko input
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gpt_sovits_t2s::{
//!     SamplingContext, SamplingParams, T2sModelConfig, Text2SemanticDecoder,
//! };
//!
//! let config = T2sModelConfig::from_file("config.json")?;
//! let decoder = Text2SemanticDecoder::new(&config, vb, device)?;
//!
//! let mut ctx = SamplingContext::new(Some(42));
//! let generation = decoder.infer(
//!     &phoneme_ids,
//!     &bert_features,
//!     Some(&prompt_codes),
//!     &SamplingParams::default(),
//!     &mut ctx,
//! )?;
//! ```
//!
//! ## Architecture
//!
//! The pipeline has two halves:
//!
//! 1. **Text front-end** ([`TextPreprocessor`]): normalizes punctuation,
//!    splits the input into speakable chunks, detects language runs per
//!    chunk, and produces phoneme ids plus phone-level BERT features via
//!    the [`TextCleaner`] and [`BertFeatureProvider`] collaborators.
//!
//! 2. **T2S decoder** ([`Text2SemanticDecoder`]): embeds phonemes and audio
//!    prompts, runs a post-norm transformer over the concatenated prompt
//!    once, then decodes semantic tokens one step at a time against per-layer
//!    KV caches, sampling with repetition penalty, top-k, and top-p.
//!    Finished rows retire from the batch as they hit EOS.

pub mod generation;
pub mod models;
pub mod text;

use anyhow::{bail, ensure, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

pub use generation::{greedy_rows, sample_next, BatchTracker, SamplingContext, SamplingParams};
pub use models::{
    padding_scale, prompt_attn_mask, LayerKvCache, T2sGeneration, T2sModelConfig,
    Text2SemanticDecoder, MAX_DECODE_STEPS,
};
pub use text::{
    collapse_punctuation, expand_word_features, segment, split_language_runs,
    BertFeatureProvider, ChunkStrategy, CleanedText, Lang, LangRun, PhonemeVocab, TextCleaner,
};

/// One speakable chunk of input text, ready for the decoder.
///
/// Produced by [`TextPreprocessor::preprocess`]. `bert` has shape
/// `[bert_dim, phones.len()]`, F32.
#[derive(Debug)]
pub struct TextFragment {
    /// Phoneme ids for this chunk.
    pub phones: Vec<u32>,
    /// Phone-level linguistic features, one column per phoneme.
    pub bert: Tensor,
    /// Normalized text, kept for logging.
    pub norm_text: String,
}

/// Text front-end pipeline: raw text in, [`TextFragment`]s out.
///
/// Generic over the grapheme-to-phoneme cleaner and the BERT feature
/// provider so the heavy collaborators (G2P tables, BERT model) stay
/// outside this crate.
pub struct TextPreprocessor<C, B> {
    cleaner: C,
    bert: B,
    vocab: PhonemeVocab,
    bert_dim: usize,
    device: Device,
}

impl<C: TextCleaner, B: BertFeatureProvider> TextPreprocessor<C, B> {
    pub fn new(cleaner: C, bert: B, vocab: PhonemeVocab, bert_dim: usize, device: Device) -> Self {
        Self {
            cleaner,
            bert,
            vocab,
            bert_dim,
            device,
        }
    }

    /// Split `text` into chunks and produce phoneme ids + features per chunk.
    ///
    /// `lang_tag` is one of `auto`, `zh`, `en`, `ja`, `all_zh`, `all_ja`.
    /// `split_method` selects the chunking strategy by name (see
    /// [`ChunkStrategy::from_name`]).
    ///
    /// Chunks whose language runs produce no phonemes are skipped. Fails if
    /// nothing speakable remains.
    pub fn preprocess(
        &self,
        text: &str,
        lang_tag: &str,
        split_method: &str,
    ) -> Result<Vec<TextFragment>> {
        let strategy = ChunkStrategy::from_name(split_method);
        let chunks = segment(text, lang_tag, strategy)?;
        info!(
            chunks = chunks.len(),
            lang = lang_tag,
            "segmented input text"
        );

        let mut fragments = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let runs = split_language_runs(chunk, lang_tag)?;

            let mut phones: Vec<u32> = Vec::new();
            let mut features: Vec<Tensor> = Vec::new();
            let mut norm_text = String::new();

            for run in &runs {
                let cleaned = self.cleaner.clean(&run.text, run.lang)?;
                if cleaned.phonemes.is_empty() {
                    continue;
                }
                let ids = self.vocab.encode(&cleaned.phonemes)?;
                let n_ph = ids.len();

                // BERT features exist only for Chinese; other languages get
                // zero columns of the same width.
                let feat = match run.lang {
                    Lang::Chinese => self
                        .bert
                        .phone_level_features(&cleaned.norm_text, &cleaned.word2ph)?,
                    _ => Tensor::zeros((self.bert_dim, n_ph), DType::F32, &self.device)?,
                };
                let (rows, cols) = feat.dims2()?;
                ensure!(
                    rows == self.bert_dim && cols == n_ph,
                    "feature shape [{}, {}] does not match {} phonemes (dim {})",
                    rows,
                    cols,
                    n_ph,
                    self.bert_dim
                );

                phones.extend(ids);
                features.push(feat);
                norm_text.push_str(&cleaned.norm_text);
            }

            if phones.is_empty() {
                debug!(
                    chunk = chunk.as_str(),
                    "chunk produced no phonemes, skipping"
                );
                continue;
            }

            let refs: Vec<&Tensor> = features.iter().collect();
            let bert = Tensor::cat(&refs, 1)?;

            debug!(
                phonemes = phones.len(),
                norm_text = norm_text.as_str(),
                "prepared fragment"
            );
            fragments.push(TextFragment {
                phones,
                bert,
                norm_text,
            });
        }

        if fragments.is_empty() {
            bail!("invalid input: no phonemes produced from {:?}", text);
        }
        Ok(fragments)
    }
}

/// Select the best available compute device for inference.
///
/// Checks for available hardware in order: CUDA → Metal → CPU.
/// Falls back to CPU if no GPU acceleration is available.
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                tracing::info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device");
            return Ok(device);
        }
    }

    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse a device string into a [`Device`].
///
/// Supported formats:
/// - `"auto"` — select best available via [`auto_device`]
/// - `"cpu"` — force CPU
/// - `"cuda"` or `"cuda:N"` — CUDA device N
/// - `"metal"` — Apple Silicon GPU
pub fn parse_device(device_str: &str) -> Result<Device> {
    match device_str.to_lowercase().as_str() {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        s if s.starts_with("cuda") => {
            #[cfg(feature = "cuda")]
            {
                let ordinal: usize = if s == "cuda" {
                    0
                } else if let Some(idx) = s.strip_prefix("cuda:") {
                    idx.parse()
                        .map_err(|e| anyhow::anyhow!("invalid CUDA device index: {e}"))?
                } else {
                    0
                };
                Device::cuda_if_available(ordinal)
                    .map_err(|e| anyhow::anyhow!("failed to init CUDA device {ordinal}: {e}"))
            }
            #[cfg(not(feature = "cuda"))]
            anyhow::bail!("CUDA support not compiled in. Rebuild with: cargo build --features cuda")
        }
        "metal" => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)
                    .map_err(|e| anyhow::anyhow!("failed to init Metal device: {e}"))
            }
            #[cfg(not(feature = "metal"))]
            anyhow::bail!(
                "Metal support not compiled in. Rebuild with: cargo build --features metal"
            )
        }
        other => {
            anyhow::bail!("unknown device '{other}'. Supported: auto, cpu, cuda, cuda:N, metal")
        }
    }
}
