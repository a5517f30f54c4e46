//! Tokenise raw text into a packed PKT1 file.
//!
//! Reads text or JSONL (one `text` field per line) from a file or directory,
//! concatenates the token streams, and packs them into `[rows, row_len]`,
//! padding the final row with the tokenizer's pad id.
//!
//! Usage: packlm-pack --data data/wiki.train --tokenizer tokenizer.json \
//!        --row-len 512 --output data/wiki.train.tokens

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;

use packlm_common::{write_packed_file, TextTokenizer};

#[derive(Parser, Debug)]
#[command(name = "packlm-pack", about = "Create a packed PKT1 token file")]
struct Args {
    /// Text or JSONL input: a file, or a directory of .txt/.raw/.jsonl/.json.
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    tokenizer: PathBuf,
    /// Row length of the packed output (the training context length).
    #[arg(long, default_value = "512")]
    row_len: usize,
    #[arg(long)]
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    if args.row_len == 0 {
        bail!("--row-len must be at least 1");
    }

    let tokenizer = TextTokenizer::from_file(&args.tokenizer)?;
    let mut tokens = Vec::new();
    for path in collect_files(&args.data)? {
        read_file(&path, &tokenizer, &mut tokens)?;
    }
    if tokens.is_empty() {
        bail!("no tokens produced from {}", args.data.display());
    }

    // Pad the tail so the buffer packs into whole rows.
    let remainder = tokens.len() % args.row_len;
    if remainder != 0 {
        tokens.resize(tokens.len() + args.row_len - remainder, tokenizer.pad_id());
    }
    let num_rows = tokens.len() / args.row_len;
    write_packed_file(&args.output, &tokens, args.row_len)?;

    tracing::info!(
        tokens = tokens.len(),
        rows = num_rows,
        row_len = args.row_len,
        "wrote {}",
        args.output.display()
    );
    Ok(())
}

fn read_file(path: &Path, tokenizer: &TextTokenizer, out: &mut Vec<u32>) -> Result<()> {
    let reader = BufReader::new(File::open(path).context("open input file")?);
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        out.extend(tokenizer.encode(&extract_text(line))?);
    }
    Ok(())
}

/// Collect text/JSONL files from a path (file or directory), sorted.
fn collect_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        bail!("path is neither file nor directory: {}", path.display());
    }
    let mut entries: Vec<_> = std::fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|e| e == "jsonl" || e == "json" || e == "txt" || e == "raw")
                    .unwrap_or(false)
        })
        .collect();
    entries.sort();
    Ok(entries)
}

/// Extract text from a line: plain text, or JSONL with a `"text"` field.
fn extract_text(line: &str) -> String {
    if line.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(t) = v.get("text").and_then(|t| t.as_str()) {
                return t.to_string();
            }
        }
    }
    line.to_string()
}
