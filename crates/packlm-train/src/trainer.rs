//! Trainer: the per-step driver.
//!
//! One call to [`Trainer::step`] runs forward, cross-entropy loss, backward,
//! gradient diagnostics, optional clipping, the AdamW update at the scheduled
//! learning rate, and exactly one schedule advance — also when the step
//! covers several accumulated micro-batches.

use std::path::PathBuf;

use anyhow::{bail, Result};
use candle_core::{Device, Tensor, Var};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarMap};

use packlm_common::{batch_to_tensors, Batcher, CausalLm, ModelConfig, RawBatch, TokenCorpus};

use crate::grad;
use crate::scheduler::{DecayCurve, LrSchedule};

// ── Config ──────────────────────────────────────────────────────────────────

/// All training hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub accumulation_steps: usize,
    pub max_steps: usize,
    pub max_epochs: usize,
    pub lr: f64,
    /// `None` disables warmup; `Some(0)` is rejected by the schedule.
    pub warmup_steps: Option<usize>,
    pub decay: DecayCurve,
    pub weight_decay: f64,
    /// 0 disables clipping.
    pub grad_clip_max_norm: f64,
    /// Compute gradient diagnostics every N steps; 0 disables them.
    pub diagnostics_every: usize,
    pub log_every: usize,
    pub eval_every: usize,
    pub eval_batches: usize,
    pub save_every: usize,
    pub seed: u64,
    pub output_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            accumulation_steps: 1,
            max_steps: 100_000,
            max_epochs: 0,
            lr: 1e-4,
            warmup_steps: None,
            decay: DecayCurve::Cosine,
            weight_decay: 1e-4,
            grad_clip_max_norm: 1.0,
            diagnostics_every: 100,
            log_every: 100,
            eval_every: 500,
            eval_batches: 50,
            save_every: 1000,
            seed: 7,
            output_dir: PathBuf::from("checkpoints"),
        }
    }
}

/// Metrics returned after each optimizer step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub lr: f64,
    pub grad_norm: Option<f64>,
    pub layer_grad_norms: Option<Vec<f64>>,
}

// ── Metric observer ─────────────────────────────────────────────────────────

/// Injected metric sink. The trainer itself performs no logging, so corpus,
/// schedule, and driver stay independently testable.
pub trait MetricObserver {
    fn on_step(&mut self, metrics: &StepMetrics);

    fn on_eval(&mut self, step: usize, val_loss: f64, perplexity: f64) {
        let _ = (step, val_loss, perplexity);
    }
}

/// Default observer: structured `tracing` events.
pub struct TracingObserver;

impl MetricObserver for TracingObserver {
    fn on_step(&mut self, m: &StepMetrics) {
        tracing::debug!(step = m.step, loss = m.loss, lr = m.lr, "train step");
        if let Some(gn) = m.grad_norm {
            tracing::info!(step = m.step, grad_norm = gn, "gradient norm");
        }
        if let Some(ref layers) = m.layer_grad_norms {
            for (i, n) in layers.iter().enumerate() {
                tracing::debug!(step = m.step, layer = i, norm = n, "layer gradient norm");
            }
        }
    }

    fn on_eval(&mut self, step: usize, val_loss: f64, perplexity: f64) {
        tracing::info!(step, val_loss, perplexity, "validation");
    }
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimizer, and the lr schedule.
pub struct Trainer<M: CausalLm> {
    pub model: M,
    pub varmap: VarMap,
    vars: Vec<Var>,
    named_vars: Vec<(String, Var)>,
    optimizer: AdamW,
    schedule: LrSchedule,
    pub config: TrainerConfig,
    model_config: ModelConfig,
    pub global_step: usize,
    device: Device,
    observer: Box<dyn MetricObserver>,
}

impl<M: CausalLm> Trainer<M> {
    /// The `varmap` must be the one the model's parameters were built from.
    pub fn new(
        model: M,
        varmap: VarMap,
        model_config: ModelConfig,
        config: TrainerConfig,
        device: Device,
    ) -> Result<Self> {
        let named_vars: Vec<(String, Var)> = {
            let data = varmap.data().lock().unwrap();
            let mut v: Vec<_> = data.iter().map(|(k, var)| (k.clone(), var.clone())).collect();
            v.sort_by(|a, b| a.0.cmp(&b.0));
            v
        };
        let vars = varmap.all_vars();
        if vars.is_empty() {
            bail!("model has no trainable parameters");
        }

        let schedule = LrSchedule::new(
            config.decay,
            vec![config.lr],
            config.warmup_steps,
            config.max_steps,
        )?;

        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: config.lr,
                beta1: 0.9,
                beta2: 0.99,
                eps: 1e-6,
                weight_decay: config.weight_decay,
            },
        )?;

        Ok(Self {
            model,
            varmap,
            vars,
            named_vars,
            optimizer,
            schedule,
            config,
            model_config,
            global_step: 0,
            device,
            observer: Box::new(TracingObserver),
        })
    }

    /// Replace the default `tracing` observer.
    pub fn with_observer(mut self, observer: Box<dyn MetricObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Execute one optimizer step over N accumulated micro-batches.
    ///
    /// The schedule advances once here regardless of N.
    pub fn step(&mut self, batches: &[RawBatch]) -> Result<StepMetrics> {
        let n = batches.len();
        if n == 0 {
            bail!("step called with no batches");
        }

        let mut total_loss: Option<Tensor> = None;
        let mut loss_sum = 0.0f32;
        for batch in batches {
            let step_loss = self.batch_loss(batch)?;
            loss_sum += step_loss.to_scalar::<f32>()?;
            let scaled = step_loss.affine(1.0 / n as f64, 0.0)?;
            total_loss = Some(match total_loss {
                None => scaled,
                Some(prev) => (prev + scaled)?,
            });
        }
        let total_loss = total_loss.expect("n > 0");
        let loss_val = loss_sum / n as f32;

        let mut grads = total_loss.backward()?;

        // Diagnostics read the gradients before clipping can rescale them.
        let diag = if self.config.diagnostics_every > 0
            && self.global_step % self.config.diagnostics_every == 0
        {
            Some(grad::diagnostics(
                &grads,
                &self.named_vars,
                self.model_config.num_layers,
            )?)
        } else {
            None
        };

        if self.config.grad_clip_max_norm > 0.0 {
            grad::clip_grad_norm(&mut grads, &self.vars, self.config.grad_clip_max_norm)?;
        }

        let lr = self.schedule.lr();
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&grads)?;

        self.schedule.advance();
        self.global_step += 1;

        let (grad_norm, layer_grad_norms) = match diag {
            Some(d) => (Some(d.total_norm), Some(d.layer_norms)),
            None => (None, None),
        };
        let metrics = StepMetrics {
            step: self.global_step - 1,
            loss: loss_val,
            lr,
            grad_norm,
            layer_grad_norms,
        };
        self.observer.on_step(&metrics);
        Ok(metrics)
    }

    fn batch_loss(&self, batch: &RawBatch) -> Result<Tensor> {
        let (inputs, labels, pad_mask) = batch_to_tensors(batch, &self.device)?;
        let logits = self.model.forward(&inputs, pad_mask.as_ref())?;
        Ok(causal_lm_loss(&logits, &labels)?)
    }

    /// Mean loss and perplexity over up to `eval_batches` validation batches.
    pub fn evaluate(&mut self, corpus: &dyn TokenCorpus) -> Result<(f64, f64)> {
        let mut batcher = Batcher::new(corpus, self.config.batch_size)?;
        let mut loss_sum = 0.0f64;
        let mut count = 0usize;
        while count < self.config.eval_batches {
            let Some(batch) = batcher.next_batch()? else {
                break;
            };
            loss_sum += self.batch_loss(&batch)?.to_scalar::<f32>()? as f64;
            count += 1;
        }
        if count == 0 {
            return Ok((f64::MAX, f64::MAX));
        }
        let avg_loss = loss_sum / count as f64;
        let ppl = avg_loss.exp();
        self.observer.on_eval(self.global_step, avg_loss, ppl);
        Ok((avg_loss, ppl))
    }

    /// Save a step-stamped checkpoint plus the model config sidecar.
    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self
            .config
            .output_dir
            .join(format!("checkpoint-{}.safetensors", self.global_step));
        self.varmap.save(&path)?;
        self.model_config
            .save(&self.config.output_dir.join("config.json"))?;
        Ok(path)
    }

    /// Save the final model.
    pub fn save_final(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self.config.output_dir.join("model.safetensors");
        self.varmap.save(&path)?;
        self.model_config
            .save(&self.config.output_dir.join("config.json"))?;
        Ok(path)
    }

    pub fn schedule(&self) -> &LrSchedule {
        &self.schedule
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

// ── Loss ────────────────────────────────────────────────────────────────────

/// Cross-entropy for either label convention.
///
/// Rank-2 labels (`[batch, seq_len]`) score every position against the
/// shifted sequence; rank-1 labels (`[batch]`) score only the final position
/// against the single next token (sliding validation).
fn causal_lm_loss(logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    match labels.rank() {
        2 => {
            let logits = logits.reshape((b * t, v))?;
            let labels = labels.reshape((b * t,))?;
            loss::cross_entropy(&logits, &labels)
        }
        1 => {
            let last = logits.narrow(1, t - 1, 1)?.squeeze(1)?;
            loss::cross_entropy(&last, labels)
        }
        r => candle_core::bail!("labels must be rank 1 or 2, got rank {r}"),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarBuilder;
    use packlm_common::{FlattenedCorpus, LabelMode, PackedCorpus, PackedTokens};
    use packlm_model::CausalTransformer;

    fn tiny_model_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 32,
            model_dim: 8,
            num_heads: 2,
            num_layers: 2,
            ffn_dim: 16,
            max_context_len: 8,
            use_pos_encoding: true,
            layer_norm_eps: 1e-5,
        }
    }

    fn tiny_trainer(config: TrainerConfig) -> Trainer<CausalTransformer> {
        let device = Device::Cpu;
        let model_config = tiny_model_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = CausalTransformer::new(&model_config, vb).unwrap();
        Trainer::new(model, varmap, model_config, config, device).unwrap()
    }

    fn dense_corpus(rows: usize, cols: usize) -> PackedCorpus {
        let tokens: Vec<u32> = (0..(rows * cols) as u32).map(|t| 1 + t % 30).collect();
        PackedCorpus::new(PackedTokens::new(tokens, cols).unwrap(), 0, 32)
    }

    #[test]
    fn one_step_produces_finite_loss_and_diagnostics() {
        let mut trainer = tiny_trainer(TrainerConfig {
            diagnostics_every: 1,
            warmup_steps: None,
            max_steps: 10,
            ..Default::default()
        });
        let corpus = dense_corpus(5, 8);
        let mut batcher = Batcher::new(&corpus, 2).unwrap();
        let batch = batcher.next_batch().unwrap().unwrap();

        let m = trainer.step(&[batch]).unwrap();
        assert_eq!(m.step, 0);
        assert!(m.loss.is_finite());
        assert!(m.lr > 0.0);
        let gn = m.grad_norm.unwrap();
        assert!(gn.is_finite() && gn > 0.0);
        let layers = m.layer_grad_norms.unwrap();
        assert_eq!(layers.len(), 2);
        assert!(layers.iter().all(|n| *n > 0.0));
        assert_eq!(trainer.global_step, 1);
    }

    #[test]
    fn accumulated_batches_advance_schedule_once() {
        let mut trainer = tiny_trainer(TrainerConfig {
            diagnostics_every: 0,
            max_steps: 10,
            ..Default::default()
        });
        let corpus = dense_corpus(7, 8);
        let mut batcher = Batcher::new(&corpus, 2).unwrap().drop_last(true);
        let a = batcher.next_batch().unwrap().unwrap();
        let b = batcher.next_batch().unwrap().unwrap();

        trainer.step(&[a, b]).unwrap();
        assert_eq!(trainer.schedule().step(), 1);
        assert_eq!(trainer.global_step, 1);
    }

    #[test]
    fn warmup_makes_first_step_lr_zero() {
        let mut trainer = tiny_trainer(TrainerConfig {
            warmup_steps: Some(4),
            max_steps: 10,
            ..Default::default()
        });
        let corpus = dense_corpus(3, 8);
        let mut batcher = Batcher::new(&corpus, 2).unwrap();
        let batch = batcher.next_batch().unwrap().unwrap();
        let m = trainer.step(&[batch.clone()]).unwrap();
        assert_eq!(m.lr, 0.0);
        let m = trainer.step(&[batch]).unwrap();
        assert!(m.lr > 0.0);
    }

    #[test]
    fn evaluate_sliding_window_returns_finite_perplexity() {
        let mut trainer = tiny_trainer(TrainerConfig {
            eval_batches: 4,
            max_steps: 10,
            ..Default::default()
        });
        let tokens: Vec<u32> = (0..64).map(|t| 1 + t % 30).collect();
        let corpus = FlattenedCorpus::new(
            PackedTokens::new(tokens, 8).unwrap(),
            0,
            2,
            Some(6),
            LabelMode::LastToken,
        )
        .unwrap();
        let (loss, ppl) = trainer.evaluate(&corpus).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
        assert!((ppl - loss.exp()).abs() < 1e-9);
    }

    #[test]
    fn empty_validation_is_reported_not_a_crash() {
        let mut trainer = tiny_trainer(TrainerConfig {
            max_steps: 10,
            ..Default::default()
        });
        let corpus = FlattenedCorpus::new(
            PackedTokens::new(vec![1, 2, 0, 0, 0, 0, 0, 0], 8).unwrap(),
            0,
            1,
            Some(6),
            LabelMode::LastToken,
        )
        .unwrap();
        let (loss, _) = trainer.evaluate(&corpus).unwrap();
        assert_eq!(loss, f64::MAX);
    }

    #[test]
    fn checkpoint_writes_weights_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = tiny_trainer(TrainerConfig {
            max_steps: 10,
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let corpus = dense_corpus(3, 8);
        let mut batcher = Batcher::new(&corpus, 2).unwrap();
        let batch = batcher.next_batch().unwrap().unwrap();
        trainer.step(&[batch]).unwrap();

        let path = trainer.save_checkpoint().unwrap();
        assert!(path.exists());
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn shifted_and_last_token_losses_agree_on_shape() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 4, 8), candle_core::DType::F32, &device).unwrap();
        let shifted = Tensor::from_vec(vec![1u32; 8], (2, 4), &device).unwrap();
        let last = Tensor::from_vec(vec![1u32, 2], (2,), &device).unwrap();
        // Uniform logits: both conventions give exactly ln(vocab).
        let expected = (8f64).ln() as f32;
        let a = causal_lm_loss(&logits, &shifted).unwrap().to_scalar::<f32>().unwrap();
        let b = causal_lm_loss(&logits, &last).unwrap().to_scalar::<f32>().unwrap();
        assert!((a - expected).abs() < 1e-5);
        assert!((b - expected).abs() < 1e-5);
    }
}
