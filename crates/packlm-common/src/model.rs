//! The model seam.
//!
//! Training only needs a callable from token ids to per-position logits; the
//! transformer internals stay behind this trait so the step driver never
//! depends on a concrete architecture.

use candle_core::{Result, Tensor};

/// A causal language model: `(tokens, pad_mask) → logits`.
///
/// * `tokens` — `[batch, seq_len]` u32 token ids.
/// * `pad_mask` — optional `[batch, seq_len]` f32, 1.0 for real tokens and
///   0.0 for padding; `None` means every position is real.
///
/// Returns logits of shape `[batch, seq_len, vocab_size]`.
pub trait CausalLm {
    fn forward(&self, tokens: &Tensor, pad_mask: Option<&Tensor>) -> Result<Tensor>;
}
