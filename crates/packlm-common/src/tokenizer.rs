//! Thin wrapper around a `tokenizers` tokenizer.
//!
//! The training core consumes exactly two values from the tokeniser: the pad
//! id and the vocabulary size. The `pack` binary additionally encodes text.

use std::path::Path;

use anyhow::{anyhow, bail, Result};
use tokenizers::Tokenizer;

/// Candidate pad token spellings, tried in order when the tokeniser file does
/// not declare padding parameters.
const PAD_TOKENS: &[&str] = &["<pad>", "[PAD]", "<|pad|>"];

/// A loaded tokeniser plus its resolved pad id.
pub struct TextTokenizer {
    inner: Tokenizer,
    pad_id: u32,
}

impl TextTokenizer {
    /// Load from a `tokenizer.json` file and resolve the pad id.
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path.as_os_str().to_string_lossy().to_string())
            .map_err(|e| anyhow!("load tokenizer: {e}"))?;
        let pad_id = match inner.get_padding() {
            Some(params) => params.pad_id,
            None => PAD_TOKENS
                .iter()
                .find_map(|t| inner.token_to_id(t))
                .ok_or_else(|| {
                    anyhow!("tokenizer declares no padding and no known pad token")
                })?,
        };
        Ok(Self { inner, pad_id })
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Encode text to token ids, including special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow!("tokenize: {e}"))?;
        if enc.get_ids().is_empty() && !text.is_empty() {
            bail!("tokenizer produced no ids for non-empty text");
        }
        Ok(enc.get_ids().to_vec())
    }
}
