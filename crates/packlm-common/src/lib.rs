//! # packlm-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ModelConfig`]** — model hyper-parameters (serialised as JSON).
//! * **[`PackedTokens`]** — pre-tokenised `[rows, row_len]` token file, loaded
//!   once and immutable thereafter.
//! * **[`PackedCorpus`]** / **[`FlattenedCorpus`]** — the two windowing
//!   policies over a packed buffer, behind the [`TokenCorpus`] trait.
//! * **[`Batcher`]** / **[`batch_to_tensors`]** — index-shuffled batching and
//!   raw batch → Candle tensor conversion.
//! * **[`CausalLm`]** — the model seam: `(tokens, pad_mask) → logits`.

pub mod config;
pub mod corpus;
pub mod model;
pub mod pack_file;
pub mod tokenizer;

pub use config::ModelConfig;
pub use corpus::{
    batch_to_tensors, Batcher, FlattenedCorpus, Label, LabelMode, PackedCorpus, RawBatch, Sample,
    TokenCorpus,
};
pub use model::CausalLm;
pub use pack_file::{write_packed_file, PackedTokens};
pub use tokenizer::TextTokenizer;
