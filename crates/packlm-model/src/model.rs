//! Decoder-only transformer (GPT-style) with pre-norm blocks.
//!
//! Token embedding + fixed sinusoidal positional encoding, N blocks of
//! multi-head causal self-attention and a GELU FFN, then a final norm and a
//! vocabulary head. Parameters live under `transformer.layers.{i}.*` so the
//! per-layer gradient attribution in the trainer sees real layer prefixes.

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{
    embedding, layer_norm_no_bias, linear, Embedding, LayerNorm, Linear, Module, VarBuilder,
};

use packlm_common::{CausalLm, ModelConfig};

// ── Positional encoding ─────────────────────────────────────────────────────

/// Fixed sinusoidal positional encodings: shape `(max_len, dim)`.
///
/// `pe[pos, 2i] = sin(pos / 10000^{2i/d})`, `pe[pos, 2i+1] = cos(...)`.
fn sinusoidal_encoding(device: &Device, max_len: usize, dim: usize) -> Result<Tensor> {
    let mut pe = vec![0f32; max_len * dim];
    for pos in 0..max_len {
        for i in 0..dim / 2 {
            let angle = pos as f32 / 10000f32.powf(2.0 * i as f32 / dim as f32);
            pe[pos * dim + 2 * i] = angle.sin();
            pe[pos * dim + 2 * i + 1] = angle.cos();
        }
    }
    Tensor::from_vec(pe, (max_len, dim), device)
}

// ── Self-attention ──────────────────────────────────────────────────────────

/// Multi-head causal self-attention with optional key padding mask.
struct SelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SelfAttention {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.model_dim;
        let c_attn = linear(dim, 3 * dim, vb.pp("c_attn"))?;
        let c_proj = linear(dim, dim, vb.pp("c_proj"))?;
        let head_dim = config.head_dim();
        Ok(Self {
            c_attn,
            c_proj,
            num_heads: config.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn forward(&self, x: &Tensor, pad_mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;

        // Fused QKV projection
        let qkv = self.c_attn.forward(x)?;
        let qkv = qkv.reshape((b, t, 3, self.num_heads, self.head_dim))?;
        let qkv = qkv.permute((0, 3, 1, 4, 2))?; // (b, heads, t, head_dim, 3)

        let q = qkv.i((.., .., .., .., 0))?.contiguous()?;
        let k = qkv.i((.., .., .., .., 1))?.contiguous()?;
        let v = qkv.i((.., .., .., .., 2))?.contiguous()?;

        // Scaled dot-product attention with causal mask
        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let device = x.device();
        let mask = Tensor::tril2(t, DType::F32, device)?;
        let mask = mask.reshape((1, 1, t, t))?;
        let ones = Tensor::ones((1, 1, t, t), DType::F32, device)?;
        let neg_inf = (-1e9f64 * (&ones - &mask)?)?;
        let mut scores = scores.broadcast_add(&neg_inf)?;

        // Key padding mask: 1.0 = real token, 0.0 = padding.
        if let Some(pad) = pad_mask {
            let pad = pad.reshape((b, 1, 1, t))?;
            let pad_ones = Tensor::ones((b, 1, 1, t), DType::F32, device)?;
            let pad_neg = (-1e9f64 * (&pad_ones - &pad)?)?;
            scores = scores.broadcast_add(&pad_neg)?;
        }

        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let y = att.contiguous()?.matmul(&v)?;
        let y = y.transpose(1, 2)?;
        let y = y.reshape((b, t, c))?;

        self.c_proj.forward(&y)
    }
}

// ── Feed-forward ────────────────────────────────────────────────────────────

struct FeedForward {
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(config.model_dim, config.ffn_dim, vb.pp("fc1"))?;
        let fc2 = linear(config.ffn_dim, config.model_dim, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(x)?.gelu()?)
    }
}

// ── Decoder block ───────────────────────────────────────────────────────────

/// Pre-norm block: norm → attention → residual, norm → FFN → residual.
struct DecoderBlock {
    ln1: LayerNorm,
    attn: SelfAttention,
    ln2: LayerNorm,
    ffn: FeedForward,
}

impl DecoderBlock {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        // Bias-free norms: the biased LayerNorm path hits candle's fused
        // kernel, which has no backward op and silently detaches the graph.
        let ln1 = layer_norm_no_bias(config.model_dim, config.layer_norm_eps, vb.pp("ln1"))?;
        let attn = SelfAttention::new(config, vb.pp("self_attn"))?;
        let ln2 = layer_norm_no_bias(config.model_dim, config.layer_norm_eps, vb.pp("ln2"))?;
        let ffn = FeedForward::new(config, vb.pp("mlp"))?;
        Ok(Self {
            ln1,
            attn,
            ln2,
            ffn,
        })
    }

    fn forward(&self, x: &Tensor, pad_mask: Option<&Tensor>) -> Result<Tensor> {
        let normed = self.ln1.forward(x)?;
        let x = (x + self.attn.forward(&normed, pad_mask)?)?;
        let normed = self.ln2.forward(&x)?;
        &x + self.ffn.forward(&normed)?
    }
}

// ── Full model ──────────────────────────────────────────────────────────────

/// The reference causal transformer.
pub struct CausalTransformer {
    wte: Embedding,
    pos_encoding: Option<Tensor>,
    blocks: Vec<DecoderBlock>,
    ln_f: LayerNorm,
    lm_head: Linear,
}

impl CausalTransformer {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let vb_t = vb.pp("transformer");
        let wte = embedding(config.vocab_size, config.model_dim, vb_t.pp("wte"))?;
        let pos_encoding = if config.use_pos_encoding {
            Some(sinusoidal_encoding(
                vb.device(),
                config.max_context_len,
                config.model_dim,
            )?)
        } else {
            None
        };
        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(DecoderBlock::new(config, vb_t.pp(format!("layers.{i}")))?);
        }
        let ln_f = layer_norm_no_bias(config.model_dim, config.layer_norm_eps, vb_t.pp("ln_f"))?;
        let lm_head = linear(config.model_dim, config.vocab_size, vb.pp("lm_head"))?;
        Ok(Self {
            wte,
            pos_encoding,
            blocks,
            ln_f,
            lm_head,
        })
    }
}

impl CausalLm for CausalTransformer {
    fn forward(&self, tokens: &Tensor, pad_mask: Option<&Tensor>) -> Result<Tensor> {
        let (_b, t) = tokens.dims2()?;
        let mut x = self.wte.forward(tokens)?;
        if let Some(ref pe) = self.pos_encoding {
            x = x.broadcast_add(&pe.narrow(0, 0, t)?)?;
        }
        for block in &self.blocks {
            x = block.forward(&x, pad_mask)?;
        }
        let x = self.ln_f.forward(&x)?;
        self.lm_head.forward(&x)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 19,
            model_dim: 8,
            num_heads: 2,
            num_layers: 2,
            ffn_dim: 16,
            max_context_len: 16,
            use_pos_encoding: true,
            layer_norm_eps: 1e-5,
        }
    }

    #[test]
    fn forward_shapes_and_finiteness() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = CausalTransformer::new(&tiny_config(), vb).unwrap();

        let tokens = Tensor::from_vec(vec![1u32, 2, 3, 4, 5, 6, 7, 8], (2, 4), &device).unwrap();
        let logits = model.forward(&tokens, None).unwrap();
        assert_eq!(logits.dims(), &[2, 4, 19]);
        let flat = logits.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(flat.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn layer_parameter_names_carry_layer_prefix() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _model = CausalTransformer::new(&tiny_config(), vb).unwrap();

        let data = varmap.data().lock().unwrap();
        assert!(data
            .keys()
            .any(|k| k.starts_with("transformer.layers.0.self_attn.")));
        assert!(data
            .keys()
            .any(|k| k.starts_with("transformer.layers.1.mlp.")));
        assert!(data.keys().any(|k| k.starts_with("transformer.wte.")));
    }

    #[test]
    fn backward_reaches_every_parameter() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = CausalTransformer::new(&tiny_config(), vb).unwrap();

        let tokens = Tensor::from_vec(vec![1u32, 2, 3, 4], (1, 4), &device).unwrap();
        let loss = model.forward(&tokens, None).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();

        // A detached op anywhere in the stack (norms included) would leave
        // upstream parameters without gradients.
        let data = varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            let grad = grads
                .get(var)
                .unwrap_or_else(|| panic!("no gradient for {name}"));
            let norm = grad
                .sqr()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap()
                .sqrt();
            assert!(norm.is_finite() && norm > 0.0, "zero gradient for {name}");
        }
    }

    #[test]
    fn pad_mask_changes_attended_output() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = CausalTransformer::new(&tiny_config(), vb).unwrap();

        let tokens = Tensor::from_vec(vec![1u32, 2, 3, 4], (1, 4), &device).unwrap();
        let mask = Tensor::from_vec(vec![1f32, 1.0, 0.0, 0.0], (1, 4), &device).unwrap();
        let full = model.forward(&tokens, None).unwrap();
        let masked = model.forward(&tokens, Some(&mask)).unwrap();
        // Position 1 attends to position 0 either way; position 3 loses two
        // of its keys under the mask, so its logits must move.
        let diff = (full.i((0, 3)).unwrap() - masked.i((0, 3)).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff > 1e-6);
    }
}
