//! Token-windowing corpora over a packed buffer.
//!
//! Two windowing policies, both producing `(input, label)` samples by index:
//!
//! * **[`PackedCorpus`]** — one sample per packed row. Row `i`'s label is the
//!   row shifted left by one, stitched with the first token of row `i + 1`, so
//!   the final row is never an input and `len() == num_rows - 1`.
//! * **[`FlattenedCorpus`]** — sliding windows with a stride over the
//!   flattened stream. Valid data ends at the first pad token; no label ever
//!   reads at or past that boundary.
//!
//! Both are immutable after construction and safe to read from any number of
//! loader threads concurrently (`get` takes `&self` and performs no mutation).

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::pack_file::PackedTokens;

// ── Samples ─────────────────────────────────────────────────────────────────

/// Label convention for a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    /// The single token immediately following the input window.
    Last(u32),
    /// The input window shifted left by one, with the token following the
    /// window appended at the end. Same length as the input.
    Shifted(Vec<u32>),
}

/// Which label convention a corpus produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMode {
    /// Next-token-only: loss on the final position (sliding validation).
    LastToken,
    /// Full-sequence: loss on every position (training).
    Shifted,
}

/// One training sample, produced on demand and never stored.
#[derive(Debug, Clone)]
pub struct Sample {
    pub input: Vec<u32>,
    pub label: Label,
    /// 1.0 for real tokens, 0.0 for padding. `None` when the window is
    /// guaranteed token-dense, which both corpus variants are.
    pub pad_mask: Option<Vec<f32>>,
}

// ── TokenCorpus trait ───────────────────────────────────────────────────────

/// Common interface for index-addressable sample sources.
pub trait TokenCorpus {
    /// Number of valid samples.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at `idx`. Out-of-range indices are an error, never clamped:
    /// clamping would silently corrupt label alignment.
    fn get(&self, idx: usize) -> Result<Sample>;

    /// Input window length of every sample.
    fn window_len(&self) -> usize;

    fn label_mode(&self) -> LabelMode;
}

// ── PackedCorpus ────────────────────────────────────────────────────────────

/// Whole-row corpus over a packed `[num_rows, row_len]` buffer.
///
/// Packed pretraining rows are token-dense except possibly the very last row,
/// which is never selected as an input, so no pad mask is produced.
pub struct PackedCorpus {
    data: PackedTokens,
    pad_id: u32,
    vocab_size: usize,
}

impl PackedCorpus {
    pub fn new(data: PackedTokens, pad_id: u32, vocab_size: usize) -> Self {
        Self {
            data,
            pad_id,
            vocab_size,
        }
    }

    /// Row length of the packed buffer.
    pub fn context_length(&self) -> usize {
        self.data.row_len()
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

impl TokenCorpus for PackedCorpus {
    /// `num_rows - 1`: row `i`'s label needs the first token of row `i + 1`,
    /// so the final row only ever serves as a label source.
    fn len(&self) -> usize {
        self.data.num_rows().saturating_sub(1)
    }

    fn get(&self, idx: usize) -> Result<Sample> {
        if idx >= self.len() {
            bail!("packed corpus index {idx} out of range (len {})", self.len());
        }
        let row = self.data.row(idx);
        let mut label = row[1..].to_vec();
        label.push(self.data.row(idx + 1)[0]);
        Ok(Sample {
            input: row.to_vec(),
            label: Label::Shifted(label),
            pad_mask: None,
        })
    }

    fn window_len(&self) -> usize {
        self.data.row_len()
    }

    fn label_mode(&self) -> LabelMode {
        LabelMode::Shifted
    }
}

// ── FlattenedCorpus ─────────────────────────────────────────────────────────

/// Sliding-window corpus over the flattened token stream.
///
/// At construction the stream is scanned for the first pad token; everything
/// at or after that position is out of bounds for both inputs and labels.
pub struct FlattenedCorpus {
    tokens: Vec<u32>,
    num_tokens: usize,
    window_length: usize,
    stride: usize,
    label_mode: LabelMode,
}

impl FlattenedCorpus {
    /// `window_length` defaults to the packed buffer's row length when `None`.
    pub fn new(
        data: PackedTokens,
        pad_id: u32,
        stride: usize,
        window_length: Option<usize>,
        label_mode: LabelMode,
    ) -> Result<Self> {
        if stride == 0 {
            bail!("stride must be at least 1");
        }
        let window_length = window_length.unwrap_or_else(|| data.row_len());
        if window_length == 0 {
            bail!("window_length must be at least 1");
        }
        let tokens = data.into_flat();
        let num_tokens = tokens
            .iter()
            .position(|&t| t == pad_id)
            .unwrap_or(tokens.len());
        Ok(Self {
            tokens,
            num_tokens,
            window_length,
            stride,
            label_mode,
        })
    }

    /// Index of the first pad token (stream length if none).
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn stride(&self) -> usize {
        self.stride
    }
}

impl TokenCorpus for FlattenedCorpus {
    /// `ceil((num_tokens - window_length) / stride)`. A window whose start is
    /// not a multiple of the stride still counts when its span, label
    /// included, fits before the pad boundary.
    fn len(&self) -> usize {
        if self.num_tokens <= self.window_length {
            return 0;
        }
        let num_windows = self.num_tokens - self.window_length;
        let divisor = num_windows / self.stride;
        let remainder = num_windows % self.stride;
        if remainder == 0 {
            divisor
        } else {
            divisor + 1
        }
    }

    fn get(&self, idx: usize) -> Result<Sample> {
        if idx >= self.len() {
            bail!(
                "flattened corpus index {idx} out of range (len {})",
                self.len()
            );
        }
        let start = idx * self.stride;
        let end = start + self.window_length;
        debug_assert!(end < self.num_tokens, "label would cross the pad boundary");
        let input = self.tokens[start..end].to_vec();
        let label = match self.label_mode {
            LabelMode::LastToken => Label::Last(self.tokens[end]),
            LabelMode::Shifted => Label::Shifted(self.tokens[start + 1..end + 1].to_vec()),
        };
        Ok(Sample {
            input,
            label,
            pad_mask: None,
        })
    }

    fn window_len(&self) -> usize {
        self.window_length
    }

    fn label_mode(&self) -> LabelMode {
        self.label_mode
    }
}

// ── Batching ────────────────────────────────────────────────────────────────

/// A raw batch of flattened sample data, ready for tensor conversion.
#[derive(Debug, Clone)]
pub struct RawBatch {
    /// `rows * seq_len` input ids, row-major.
    pub inputs: Vec<u32>,
    /// `rows * label_len` label ids, row-major.
    pub labels: Vec<u32>,
    /// `rows * seq_len` mask values, present only if any sample carried one.
    pub pad_mask: Option<Vec<f32>>,
    pub rows: usize,
    pub seq_len: usize,
    /// 1 for last-token labels, `seq_len` for shifted labels.
    pub label_len: usize,
}

/// Batches samples from a corpus in index order, optionally shuffled.
pub struct Batcher<'a, C: TokenCorpus + ?Sized> {
    corpus: &'a C,
    order: Vec<usize>,
    batch_size: usize,
    drop_last: bool,
    pos: usize,
}

impl<'a, C: TokenCorpus + ?Sized> Batcher<'a, C> {
    pub fn new(corpus: &'a C, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        Ok(Self {
            corpus,
            order: (0..corpus.len()).collect(),
            batch_size,
            drop_last: false,
            pos: 0,
        })
    }

    /// Shuffle the sample order with a seeded RNG (deterministic per seed).
    pub fn shuffled(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        self
    }

    /// Discard a trailing batch smaller than `batch_size`.
    pub fn drop_last(mut self, drop: bool) -> Self {
        self.drop_last = drop;
        self
    }

    /// Next batch, or `None` when the corpus is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<RawBatch>> {
        if self.pos >= self.order.len() {
            return Ok(None);
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let indices = &self.order[self.pos..end];
        if self.drop_last && indices.len() < self.batch_size {
            self.pos = self.order.len();
            return Ok(None);
        }
        self.pos = end;

        let seq_len = self.corpus.window_len();
        let label_len = match self.corpus.label_mode() {
            LabelMode::LastToken => 1,
            LabelMode::Shifted => seq_len,
        };
        let rows = indices.len();
        let mut inputs = Vec::with_capacity(rows * seq_len);
        let mut labels = Vec::with_capacity(rows * label_len);
        let mut pad_mask: Option<Vec<f32>> = None;
        for (n, &i) in indices.iter().enumerate() {
            let sample = self.corpus.get(i)?;
            inputs.extend_from_slice(&sample.input);
            match sample.label {
                Label::Last(t) => labels.push(t),
                Label::Shifted(ts) => labels.extend_from_slice(&ts),
            }
            match (sample.pad_mask, pad_mask.as_mut()) {
                (Some(mask), Some(m)) => m.extend_from_slice(&mask),
                (Some(mask), None) => {
                    // Earlier maskless samples were fully dense.
                    let mut m = vec![1.0; n * seq_len];
                    m.extend_from_slice(&mask);
                    pad_mask = Some(m);
                }
                (None, Some(m)) => m.extend(std::iter::repeat(1.0).take(seq_len)),
                (None, None) => {}
            }
        }
        Ok(Some(RawBatch {
            inputs,
            labels,
            pad_mask,
            rows,
            seq_len,
            label_len,
        }))
    }
}

/// Convert a raw batch to Candle tensors on `device`.
///
/// Inputs are `[rows, seq_len]` u32; labels are `[rows]` for last-token
/// batches and `[rows, seq_len]` for shifted batches; the mask, when present,
/// is `[rows, seq_len]` f32.
pub fn batch_to_tensors(
    batch: &RawBatch,
    device: &Device,
) -> candle_core::Result<(Tensor, Tensor, Option<Tensor>)> {
    let inputs = Tensor::from_vec(
        batch.inputs.clone(),
        (batch.rows, batch.seq_len),
        device,
    )?;
    let labels = if batch.label_len == 1 {
        Tensor::from_vec(batch.labels.clone(), (batch.rows,), device)?
    } else {
        Tensor::from_vec(batch.labels.clone(), (batch.rows, batch.seq_len), device)?
    };
    let pad_mask = match &batch.pad_mask {
        Some(m) => Some(Tensor::from_vec(
            m.clone(),
            (batch.rows, batch.seq_len),
            device,
        )?),
        None => None,
    };
    Ok((inputs, labels, pad_mask))
}

// ── Tests ───────────────────────────────────────────────────────────────────
