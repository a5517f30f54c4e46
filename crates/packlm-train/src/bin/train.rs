//! CLI for training the causal transformer on packed token files.
//!
//! Training reads whole packed rows (full-sequence loss); validation slides
//! a strided window over the flattened stream and scores only the next token.

use std::path::PathBuf;

use candle_core::{DType, Device};
use clap::Parser;

use packlm_common::{
    Batcher, FlattenedCorpus, LabelMode, ModelConfig, PackedCorpus, PackedTokens, TextTokenizer,
    TokenCorpus,
};
use packlm_model::CausalTransformer;
use packlm_train::{DecayCurve, Trainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "packlm-train", about = "Train a causal LM on packed token streams")]
struct Args {
    /// Packed training tokens (PKT1 file).
    #[arg(long)]
    train_data: PathBuf,
    /// Packed validation tokens (PKT1 file).
    #[arg(long)]
    val_data: Option<PathBuf>,
    /// tokenizer.json; supplies pad id and vocab size.
    #[arg(long)]
    tokenizer: PathBuf,
    /// Model config JSON; created with defaults if missing.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[arg(long, default_value = "checkpoints")]
    output_dir: PathBuf,
    #[arg(long, default_value = "13")]
    batch_size: usize,
    #[arg(long, default_value = "1")]
    accumulation_steps: usize,
    #[arg(long, default_value = "100000")]
    max_steps: usize,
    /// 0 = no epoch limit.
    #[arg(long, default_value = "0")]
    max_epochs: usize,
    #[arg(long, default_value = "1e-4")]
    lr: f64,
    /// 0 disables warmup.
    #[arg(long, default_value = "0")]
    warmup_steps: usize,
    #[arg(long, default_value = "rex", value_parser = ["cosine", "rex"])]
    decay: String,
    #[arg(long, default_value = "1e-4")]
    weight_decay: f64,
    #[arg(long, default_value = "1.0")]
    grad_clip_max_norm: f64,
    /// Stride of the sliding validation window.
    #[arg(long, default_value = "256")]
    val_stride: usize,
    /// Validation window length; 0 = packed row length.
    #[arg(long, default_value = "512")]
    val_window: usize,
    #[arg(long, default_value = "7")]
    seed: u64,
    #[arg(long, default_value = "100")]
    log_every: usize,
    #[arg(long, default_value = "100")]
    diagnostics_every: usize,
    #[arg(long, default_value = "500")]
    eval_every: usize,
    #[arg(long, default_value = "50")]
    eval_batches: usize,
    #[arg(long, default_value = "1000")]
    save_every: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    // Refuse to touch a directory that already holds trained weights; a
    // resumed or replacement experiment must clear it deliberately.
    if args.output_dir.exists() {
        let has_checkpoints = std::fs::read_dir(&args.output_dir)?
            .filter_map(|e| e.ok())
            .any(|e| e.path().extension().map(|x| x == "safetensors").unwrap_or(false));
        if has_checkpoints {
            anyhow::bail!(
                "output dir {} already contains model checkpoints",
                args.output_dir.display()
            );
        }
    }
    std::fs::create_dir_all(&args.output_dir)?;

    let tokenizer = TextTokenizer::from_file(&args.tokenizer)?;
    tracing::info!(
        pad_id = tokenizer.pad_id(),
        vocab_size = tokenizer.vocab_size(),
        "tokenizer loaded"
    );

    let model_config = if args.config.exists() {
        ModelConfig::load(&args.config)?
    } else {
        let config = ModelConfig {
            vocab_size: tokenizer.vocab_size(),
            ..Default::default()
        };
        config.save(&args.config)?;
        tracing::info!("created default config at {}", args.config.display());
        config
    };

    let train_tokens = PackedTokens::load(&args.train_data)?;
    let train_corpus = PackedCorpus::new(train_tokens, tokenizer.pad_id(), tokenizer.vocab_size());
    tracing::info!(
        samples = train_corpus.len(),
        context = train_corpus.context_length(),
        "training corpus"
    );
    if train_corpus.is_empty() {
        anyhow::bail!("training corpus is empty; need at least two packed rows");
    }

    let val_corpus = match args.val_data {
        Some(ref path) => {
            let tokens = PackedTokens::load(path)?;
            let window = if args.val_window == 0 {
                None
            } else {
                Some(args.val_window)
            };
            let corpus = FlattenedCorpus::new(
                tokens,
                tokenizer.pad_id(),
                args.val_stride,
                window,
                LabelMode::LastToken,
            )?;
            tracing::info!(
                samples = corpus.len(),
                tokens = corpus.num_tokens(),
                "validation corpus"
            );
            Some(corpus)
        }
        None => None,
    };

    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        accumulation_steps: args.accumulation_steps,
        max_steps: args.max_steps,
        max_epochs: args.max_epochs,
        lr: args.lr,
        warmup_steps: (args.warmup_steps > 0).then_some(args.warmup_steps),
        decay: DecayCurve::from_str(&args.decay),
        weight_decay: args.weight_decay,
        grad_clip_max_norm: args.grad_clip_max_norm,
        diagnostics_every: args.diagnostics_every,
        log_every: args.log_every,
        eval_every: args.eval_every,
        eval_batches: args.eval_batches,
        save_every: args.save_every,
        seed: args.seed,
        output_dir: args.output_dir.clone(),
    };

    let device = Device::cuda_if_available(0)?;
    let varmap = candle_nn::VarMap::new();
    let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = CausalTransformer::new(&model_config, vb)?;
    let mut trainer = Trainer::new(model, varmap, model_config, trainer_config, device)?;

    let mut epoch = 0usize;
    'training: loop {
        if trainer.global_step >= args.max_steps {
            break;
        }
        if args.max_epochs > 0 && epoch >= args.max_epochs {
            tracing::info!(epochs = args.max_epochs, "epoch limit reached");
            break;
        }
        tracing::info!(epoch, step = trainer.global_step, "epoch start");

        // Fresh shuffle per epoch, deterministic per (seed, epoch).
        let mut batcher = Batcher::new(&train_corpus, args.batch_size)?
            .shuffled(args.seed.wrapping_add(epoch as u64))
            .drop_last(true);

        loop {
            if trainer.global_step >= args.max_steps {
                break 'training;
            }
            let mut micro_batches = Vec::with_capacity(args.accumulation_steps);
            for _ in 0..args.accumulation_steps.max(1) {
                match batcher.next_batch()? {
                    Some(b) => micro_batches.push(b),
                    None => break,
                }
            }
            if micro_batches.is_empty() {
                break;
            }

            let m = trainer.step(&micro_batches)?;
            if args.log_every > 0 && m.step % args.log_every == 0 {
                tracing::info!(step = m.step, epoch, loss = m.loss, lr = m.lr, "progress");
            }

            run_eval_and_checkpoint(&mut trainer, &val_corpus, &args)?;
        }
        epoch += 1;
    }

    let path = trainer.save_final()?;
    tracing::info!("training done; saved to {}", path.display());
    Ok(())
}

fn run_eval_and_checkpoint(
    trainer: &mut Trainer<CausalTransformer>,
    val_corpus: &Option<FlattenedCorpus>,
    args: &Args,
) -> anyhow::Result<()> {
    let step = trainer.global_step;

    if let Some(ref corpus) = val_corpus {
        if args.eval_every > 0 && step > 0 && step % args.eval_every == 0 {
            let (val_loss, ppl) = trainer.evaluate(corpus)?;
            tracing::info!(step, val_loss, perplexity = ppl, "eval");
        }
    }

    if args.save_every > 0 && step > 0 && step % args.save_every == 0 {
        let path = trainer.save_checkpoint()?;
        tracing::info!(step, "saved checkpoint to {}", path.display());
    }
    Ok(())
}
