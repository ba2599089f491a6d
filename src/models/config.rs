//! Model configuration for the T2S decoder

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Text-to-semantic decoder configuration
///
/// Field defaults match the GPT-SoVITS s1 checkpoint family. A partial
/// JSON config fills in the rest from these defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct T2sModelConfig {
    /// Token embedding dimension
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Transformer hidden dimension
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,

    /// Number of attention heads
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// Number of transformer blocks
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Feed-forward inner dimension
    #[serde(default = "default_ffn_dim")]
    pub ffn_dim: usize,

    /// Semantic-token vocabulary size (last id is EOS)
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Phoneme vocabulary size
    #[serde(default = "default_phoneme_vocab_size")]
    pub phoneme_vocab_size: usize,

    /// BERT feature dimension projected into the text embedding
    #[serde(default = "default_bert_dim")]
    pub bert_dim: usize,

    /// Layer-norm epsilon
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    /// Precomputed positional-embedding table length
    #[serde(default = "default_max_position")]
    pub max_position: usize,
}

fn default_embedding_dim() -> usize {
    512
}
fn default_hidden_dim() -> usize {
    512
}
fn default_num_heads() -> usize {
    8
}
fn default_num_layers() -> usize {
    12
}
fn default_ffn_dim() -> usize {
    2048
}
fn default_vocab_size() -> usize {
    1025
}
fn default_phoneme_vocab_size() -> usize {
    512
}
fn default_bert_dim() -> usize {
    1024
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}
fn default_max_position() -> usize {
    4000
}

impl Default for T2sModelConfig {
    fn default() -> Self {
        Self {
            embedding_dim: default_embedding_dim(),
            hidden_dim: default_hidden_dim(),
            num_heads: default_num_heads(),
            num_layers: default_num_layers(),
            ffn_dim: default_ffn_dim(),
            vocab_size: default_vocab_size(),
            phoneme_vocab_size: default_phoneme_vocab_size(),
            bert_dim: default_bert_dim(),
            layer_norm_eps: default_layer_norm_eps(),
            max_position: default_max_position(),
        }
    }
}

impl T2sModelConfig {
    /// Load configuration from a local JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency of the dimensions.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.hidden_dim % self.num_heads == 0,
            "hidden_dim {} not divisible by num_heads {}",
            self.hidden_dim,
            self.num_heads
        );
        anyhow::ensure!(self.vocab_size >= 2, "vocab_size {} too small", self.vocab_size);
        anyhow::ensure!(self.num_layers > 0, "num_layers must be positive");
        Ok(())
    }

    /// EOS id, always the last entry of the semantic vocabulary.
    pub fn eos_id(&self) -> u32 {
        (self.vocab_size - 1) as u32
    }

    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.num_heads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = T2sModelConfig::default();
        assert_eq!(config.embedding_dim, 512);
        assert_eq!(config.hidden_dim, 512);
        assert_eq!(config.num_heads, 8);
        assert_eq!(config.num_layers, 12);
        assert_eq!(config.ffn_dim, 2048);
        assert_eq!(config.vocab_size, 1025);
        assert_eq!(config.phoneme_vocab_size, 512);
        assert_eq!(config.bert_dim, 1024);
        assert!((config.layer_norm_eps - 1e-5).abs() < 1e-12);
        assert_eq!(config.max_position, 4000);
    }

    #[test]
    fn test_eos_id_is_last_vocab_entry() {
        let config = T2sModelConfig::default();
        assert_eq!(config.eos_id(), 1024);

        let small = T2sModelConfig {
            vocab_size: 9,
            ..Default::default()
        };
        assert_eq!(small.eos_id(), 8);
    }

    #[test]
    fn test_head_dim() {
        let config = T2sModelConfig::default();
        assert_eq!(config.head_dim(), 64);
    }

    #[test]
    fn test_validate_rejects_bad_heads() {
        let config = T2sModelConfig {
            hidden_dim: 500,
            num_heads: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialization_with_defaults() {
        let json = r#"{"num_layers": 24, "num_heads": 16}"#;
        let config: T2sModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_layers, 24);
        assert_eq!(config.num_heads, 16);
        // Remaining fields come from defaults
        assert_eq!(config.hidden_dim, 512);
        assert_eq!(config.vocab_size, 1025);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = T2sModelConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: T2sModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.hidden_dim, config.hidden_dim);
        assert_eq!(parsed.vocab_size, config.vocab_size);
    }

    #[test]
    fn test_from_file_nonexistent() {
        assert!(T2sModelConfig::from_file("/nonexistent/config.json").is_err());
    }
}
