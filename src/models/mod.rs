//! Neural network components of the T2S decoder
//!
//! This module contains:
//! - `config`: decoder hyperparameters
//! - `embedding`: token and sinusoidal positional embeddings
//! - `mask`: prompt attention mask and padding scale
//! - `kv_cache`: per-layer key/value cache with batch-row compaction
//! - `transformer`: post-norm decoder blocks and the block stack
//! - `t2s`: the full decoder and its sampling loop

pub mod config;
pub mod embedding;
pub mod kv_cache;
pub mod mask;
pub mod t2s;
pub mod transformer;

pub use config::T2sModelConfig;
pub use kv_cache::LayerKvCache;
pub use mask::{padding_scale, prompt_attn_mask};
pub use t2s::{T2sGeneration, Text2SemanticDecoder, MAX_DECODE_STEPS};
pub use transformer::{T2sBlock, T2sTransformer};
