//! Phoneme vocabulary and linguistic feature extraction
//!
//! The text cleaner and the BERT model are external collaborators behind
//! the [`TextCleaner`] and [`BertFeatureProvider`] traits; this module
//! owns the phoneme-string to id mapping and the word-to-phoneme feature
//! expansion that aligns BERT's per-word embeddings with the decoder's
//! per-phoneme inputs.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::Tensor;

use super::lang_segment::Lang;

/// Output of the external text cleaner for one language run.
#[derive(Debug, Clone)]
pub struct CleanedText {
    /// Phoneme symbols, one per phoneme
    pub phonemes: Vec<String>,
    /// Phoneme count per word of the normalized text
    pub word2ph: Vec<usize>,
    /// The text as actually spoken
    pub norm_text: String,
}

/// External grapheme-to-phoneme collaborator.
pub trait TextCleaner {
    fn clean(&self, text: &str, lang: Lang) -> Result<CleanedText>;
}

/// External masked-language-model collaborator.
///
/// Returns one feature column per phoneme, shape `[feature_dim, n_phonemes]`
/// where `n_phonemes == word2ph.iter().sum()`.
pub trait BertFeatureProvider {
    fn phone_level_features(&self, norm_text: &str, word2ph: &[usize]) -> Result<Tensor>;
}

/// Fixed phoneme-symbol to id table.
pub struct PhonemeVocab {
    map: HashMap<String, u32>,
}

impl PhonemeVocab {
    /// Build from an ordered symbol list; ids follow list order.
    pub fn from_symbols<S: AsRef<str>>(symbols: &[S]) -> Self {
        let map = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_ref().to_string(), i as u32))
            .collect();
        Self { map }
    }

    /// Load from a JSON array of symbol strings.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phoneme table from {}", path.display()))?;
        let symbols: Vec<String> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse phoneme table from {}", path.display()))?;
        Ok(Self::from_symbols(&symbols))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn id(&self, symbol: &str) -> Option<u32> {
        self.map.get(symbol).copied()
    }

    /// Map phoneme symbols to ids, failing on any symbol outside the table.
    pub fn encode<S: AsRef<str>>(&self, phonemes: &[S]) -> Result<Vec<u32>> {
        phonemes
            .iter()
            .map(|p| {
                self.id(p.as_ref())
                    .with_context(|| format!("unknown phoneme symbol {:?}", p.as_ref()))
            })
            .collect()
    }
}

/// Expand per-word features `[n_words, dim]` into per-phoneme features
/// `[dim, n_phonemes]` by repeating word i's row `word2ph[i]` times.
pub fn expand_word_features(word_feats: &Tensor, word2ph: &[usize]) -> Result<Tensor> {
    let (n_words, _dim) = word_feats.dims2()?;
    anyhow::ensure!(
        n_words == word2ph.len(),
        "feature rows ({}) do not match word2ph entries ({})",
        n_words,
        word2ph.len()
    );
    let mut rows = Vec::new();
    for (i, &count) in word2ph.iter().enumerate() {
        let row = word_feats.narrow(0, i, 1)?;
        for _ in 0..count {
            rows.push(row.clone());
        }
    }
    if rows.is_empty() {
        bail!("word2ph expands to zero phonemes");
    }
    let refs: Vec<&Tensor> = rows.iter().collect();
    Ok(Tensor::cat(&refs, 0)?.t()?.contiguous()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_vocab_encode() {
        let vocab = PhonemeVocab::from_symbols(&["_", "a", "b", "ni3", "hao3"]);
        assert_eq!(vocab.len(), 5);
        assert_eq!(vocab.id("ni3"), Some(3));
        assert_eq!(vocab.id("zz"), None);
        assert_eq!(
            vocab.encode(&["a", "hao3", "_"]).unwrap(),
            vec![1, 4, 0]
        );
        assert!(vocab.encode(&["a", "zz"]).is_err());
    }

    #[test]
    fn test_expand_word_features() {
        let device = Device::Cpu;
        // 3 words, dim 2; word2ph = [2, 1, 3] → 6 phonemes.
        let feats = Tensor::new(&[[1f32, 10.0], [2.0, 20.0], [3.0, 30.0]], &device).unwrap();
        let out = expand_word_features(&feats, &[2, 1, 3]).unwrap();
        assert_eq!(out.dims(), &[2, 6]);
        let row0: Vec<f32> = out.narrow(0, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(row0, vec![1.0, 1.0, 2.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_expand_column_count_matches_phonemes() {
        let device = Device::Cpu;
        let feats = Tensor::randn(0.0f32, 1.0, (4, 8), &device).unwrap();
        let word2ph = [1usize, 4, 2, 3];
        let out = expand_word_features(&feats, &word2ph).unwrap();
        assert_eq!(out.dims()[1], word2ph.iter().sum::<usize>());
    }

    #[test]
    fn test_expand_rejects_mismatched_word2ph() {
        let device = Device::Cpu;
        let feats = Tensor::randn(0.0f32, 1.0, (3, 8), &device).unwrap();
        assert!(expand_word_features(&feats, &[1, 2]).is_err());
    }
}
