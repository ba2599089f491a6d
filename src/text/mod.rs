//! Text front-end: segmentation, language runs, phoneme features
//!
//! This module contains:
//! - `segmenter`: punctuation normalization and sentence chunking
//! - `lang_segment`: per-character language run detection
//! - `features`: phoneme vocabulary and BERT feature alignment

pub mod features;
pub mod lang_segment;
pub mod segmenter;

pub use features::{
    expand_word_features, BertFeatureProvider, CleanedText, PhonemeVocab, TextCleaner,
};
pub use lang_segment::{split_language_runs, Lang, LangRun};
pub use segmenter::{collapse_punctuation, merge_short_chunks, segment, ChunkStrategy};
