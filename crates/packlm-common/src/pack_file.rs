//! Packed-token binary format.
//!
//! A packed file holds a 2D integer array `[num_rows, row_len]` of token ids,
//! produced by the `pack` binary (or any external preprocessing step).
//! Format: magic `PKT1` (4 bytes), `num_rows` as u64 LE (8 bytes), `row_len`
//! as u64 LE (8 bytes), then `num_rows * row_len` × u32 LE. No other metadata.
//!
//! The file is memory-mapped for the read, then decoded into a single `Vec`
//! blob; the buffer is never mutated after [`PackedTokens::load`] returns.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use memmap2::Mmap;

/// Magic bytes for the packed token format (version 1).
const PACKED_MAGIC: &[u8; 4] = b"PKT1";
/// Header size: magic (4) + num_rows (8) + row_len (8).
const PACKED_HEADER_LEN: usize = 4 + 8 + 8;

/// An immutable, loaded-once packed token buffer of shape `[num_rows, row_len]`.
#[derive(Debug, Clone)]
pub struct PackedTokens {
    tokens: Vec<u32>,
    num_rows: usize,
    row_len: usize,
}

impl PackedTokens {
    /// Wrap an in-memory token vector. `tokens.len()` must be a multiple of
    /// `row_len`.
    pub fn new(tokens: Vec<u32>, row_len: usize) -> Result<Self> {
        if row_len == 0 {
            bail!("row_len must be at least 1");
        }
        if tokens.len() % row_len != 0 {
            bail!(
                "token count {} is not a multiple of row_len {}",
                tokens.len(),
                row_len
            );
        }
        let num_rows = tokens.len() / row_len;
        Ok(Self {
            tokens,
            num_rows,
            row_len,
        })
    }

    /// Load a packed token file. Validates magic and length.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("open packed token file {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file).context("mmap packed token file")? };
        if mmap.len() < PACKED_HEADER_LEN {
            bail!("packed token file too short: {}", path.display());
        }
        if &mmap[0..4] != PACKED_MAGIC {
            bail!("invalid packed token file: bad magic");
        }
        let num_rows = u64::from_le_bytes(mmap[4..12].try_into().expect("8-byte slice")) as usize;
        let row_len = u64::from_le_bytes(mmap[12..20].try_into().expect("8-byte slice")) as usize;
        if row_len == 0 {
            bail!("invalid packed token file: row_len 0");
        }
        // Header fields are untrusted. The sizes must stay within usize and
        // within the file before anything is allocated.
        let count = num_rows.checked_mul(row_len);
        let expected_len = count
            .and_then(|c| c.checked_mul(4))
            .and_then(|b| b.checked_add(PACKED_HEADER_LEN));
        let (count, expected_len) = match (count, expected_len) {
            (Some(c), Some(e)) => (c, e),
            _ => bail!(
                "invalid packed token file: header claims {} rows of {} tokens",
                num_rows,
                row_len
            ),
        };
        if mmap.len() < expected_len {
            bail!(
                "packed token file truncated: expected {} bytes, got {}",
                expected_len,
                mmap.len()
            );
        }
        let mut tokens = Vec::with_capacity(count);
        for chunk in mmap[PACKED_HEADER_LEN..expected_len].chunks_exact(4) {
            tokens.push(u32::from_le_bytes(chunk.try_into().expect("4-byte chunk")));
        }
        Ok(Self {
            tokens,
            num_rows,
            row_len,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// One packed row. Panics if `i >= num_rows`.
    pub fn row(&self, i: usize) -> &[u32] {
        &self.tokens[i * self.row_len..(i + 1) * self.row_len]
    }

    /// The whole buffer in row-major order.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Consume the buffer, flattening `[num_rows, row_len]` to `[total]`.
    pub fn into_flat(self) -> Vec<u32> {
        self.tokens
    }
}

/// Write a packed token file. `tokens.len()` must be a multiple of `row_len`.
pub fn write_packed_file(path: &Path, tokens: &[u32], row_len: usize) -> Result<()> {
    if row_len == 0 || tokens.len() % row_len != 0 {
        bail!(
            "token count {} is not a multiple of row_len {}",
            tokens.len(),
            row_len
        );
    }
    let num_rows = tokens.len() / row_len;
    let mut f = File::create(path).context("create packed token file")?;
    f.write_all(PACKED_MAGIC)?;
    f.write_all(&(num_rows as u64).to_le_bytes())?;
    f.write_all(&(row_len as u64).to_le_bytes())?;
    for &id in tokens {
        f.write_all(&id.to_le_bytes())?;
    }
    f.sync_all().context("sync packed token file")?;
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
