//! Model configuration for the packed-lm transformer.
//!
//! Serialised as JSON next to checkpoints for reproducible reload. Every
//! optional field has a `#[serde(default)]` so configs written by older
//! versions keep loading.

use serde::{Deserialize, Serialize};

/// Configuration for the decoder-only causal transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size (must match the tokeniser).
    pub vocab_size: usize,
    /// Model dimension d_model.
    pub model_dim: usize,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Number of decoder layers.
    pub num_layers: usize,
    /// FFN intermediate dimension.
    pub ffn_dim: usize,
    /// Maximum context length; also the row length of packed training data.
    pub max_context_len: usize,
    /// Add fixed sinusoidal positional encodings to the token embeddings.
    #[serde(default = "default_true")]
    pub use_pos_encoding: bool,
    /// Layer norm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_true() -> bool {
    true
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 16_000,
            model_dim: 512,
            num_heads: 8,
            num_layers: 12,
            ffn_dim: 2048,
            max_context_len: 512,
            use_pos_encoding: true,
            layer_norm_eps: 1e-5,
        }
    }
}

impl ModelConfig {
    /// Head dimension (`model_dim / num_heads`). Panics if not divisible.
    pub fn head_dim(&self) -> usize {
        assert!(
            self.model_dim % self.num_heads == 0,
            "model_dim ({}) must be divisible by num_heads ({})",
            self.model_dim,
            self.num_heads,
        );
        self.model_dim / self.num_heads
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
