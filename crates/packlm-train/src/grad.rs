//! Post-backward gradient diagnostics and clipping.
//!
//! Diagnostics attribute every parameter with a present gradient to at most
//! one transformer layer via its name prefix (`transformer.layers.{i}.`,
//! first match wins, ascending layer order). Parameters outside any layer
//! (embeddings, the lm head) still count toward the global norm. The
//! traversal is read-only; clipping is a separate, explicit call.

use candle_core::backprop::GradStore;
use candle_core::{Result, Var};

/// Global and per-layer gradient L2 norms for one optimizer step.
#[derive(Debug, Clone)]
pub struct GradDiagnostics {
    /// L2 norm across every parameter with a gradient.
    pub total_norm: f64,
    /// One L2 norm per transformer layer, zero where no gradients landed.
    pub layer_norms: Vec<f64>,
}

/// Compute gradient norms over named parameters.
///
/// Parameters whose gradient is absent are skipped silently: a sub-module
/// that contributed nothing to a batch (masking, truncation) is normal, not
/// an error.
pub fn diagnostics(
    grads: &GradStore,
    named_vars: &[(String, Var)],
    num_layers: usize,
) -> Result<GradDiagnostics> {
    let prefixes: Vec<String> = (0..num_layers)
        .map(|i| format!("transformer.layers.{i}."))
        .collect();

    let mut total_sq = 0.0f64;
    let mut layer_sq = vec![0.0f64; num_layers];
    for (name, var) in named_vars {
        let Some(g) = grads.get(var.as_tensor()) else {
            continue;
        };
        let sq = g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        total_sq += sq;
        for (i, prefix) in prefixes.iter().enumerate() {
            if name.starts_with(prefix) {
                layer_sq[i] += sq;
                break;
            }
        }
    }
    Ok(GradDiagnostics {
        total_norm: total_sq.sqrt(),
        layer_norms: layer_sq.into_iter().map(f64::sqrt).collect(),
    })
}

/// Scale all gradients so their global L2 norm is at most `max_norm`.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<()> {
    let mut total_sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total_sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total_sq.sqrt().max(1e-12);
    if norm <= max_norm {
        return Ok(());
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            let clipped = g.affine(scale, 0.0)?;
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn var(device: &Device, shape: (usize, usize)) -> Var {
        Var::ones(shape, DType::F32, device).unwrap()
    }

    /// Backward through `sum(coef * v)` over the given vars: each touched
    /// var's gradient is `coef` everywhere; every other var has none.
    fn grads_for(vars: &[&Var], coef: f64) -> GradStore {
        let mut loss: Option<Tensor> = None;
        for v in vars {
            let term = v.as_tensor().affine(coef, 0.0).unwrap().sum_all().unwrap();
            loss = Some(match loss {
                None => term,
                Some(prev) => (prev + term).unwrap(),
            });
        }
        loss.unwrap().backward().unwrap()
    }

    #[test]
    fn only_layer_three_has_gradients() {
        let device = Device::Cpu;
        let l3_attn = var(&device, (2, 2));
        let l3_mlp = var(&device, (2, 2));
        let l1 = var(&device, (2, 2));
        let wte = var(&device, (2, 2));

        let named = vec![
            ("transformer.layers.1.mlp.fc1.weight".to_string(), l1),
            ("transformer.layers.3.self_attn.c_attn.weight".to_string(), l3_attn.clone()),
            ("transformer.layers.3.mlp.fc1.weight".to_string(), l3_mlp.clone()),
            ("transformer.wte.weight".to_string(), wte),
        ];

        // Loss touches only the two layer-3 parameters.
        let grads = grads_for(&[&l3_attn, &l3_mlp], 3.0);
        let diag = diagnostics(&grads, &named, 6).unwrap();

        // d(sum(3a))/da = 3 everywhere: 8 elements of 3² across both params.
        let expected = (8.0f64 * 9.0).sqrt();
        assert!((diag.total_norm - expected).abs() < 1e-6);
        assert_eq!(diag.layer_norms.len(), 6);
        for (i, n) in diag.layer_norms.iter().enumerate() {
            if i == 3 {
                assert!((n - expected).abs() < 1e-6);
            } else {
                assert_eq!(*n, 0.0);
            }
        }
    }

    #[test]
    fn unattributed_params_count_toward_global_only() {
        let device = Device::Cpu;
        let wte = var(&device, (2, 2));
        let l0 = var(&device, (2, 2));
        let named = vec![
            ("transformer.wte.weight".to_string(), wte.clone()),
            ("transformer.layers.0.mlp.fc1.weight".to_string(), l0.clone()),
        ];
        let grads = grads_for(&[&wte, &l0], 1.0);
        let diag = diagnostics(&grads, &named, 2).unwrap();

        let per_param = (4.0f64).sqrt(); // 4 unit gradients
        assert!((diag.layer_norms[0] - per_param).abs() < 1e-6);
        assert_eq!(diag.layer_norms[1], 0.0);
        assert!((diag.total_norm - (8.0f64).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn prefix_match_is_exact_not_lexical() {
        // "layers.1" must not swallow "layers.10".
        let device = Device::Cpu;
        let l10 = var(&device, (2, 2));
        let named = vec![(
            "transformer.layers.10.mlp.fc1.weight".to_string(),
            l10.clone(),
        )];
        let grads = grads_for(&[&l10], 1.0);
        let diag = diagnostics(&grads, &named, 12).unwrap();
        assert_eq!(diag.layer_norms[1], 0.0);
        assert!(diag.layer_norms[10] > 0.0);
    }

    #[test]
    fn missing_gradients_are_skipped() {
        let device = Device::Cpu;
        let touched = var(&device, (2, 2));
        let untouched = var(&device, (2, 2));
        let named = vec![
            ("transformer.layers.0.mlp.fc1.weight".to_string(), touched.clone()),
            ("transformer.layers.0.mlp.fc2.weight".to_string(), untouched),
        ];
        let grads = grads_for(&[&touched], 1.0);
        let diag = diagnostics(&grads, &named, 1).unwrap();
        assert!((diag.total_norm - 2.0).abs() < 1e-6);
    }

    #[test]
    fn clip_rescales_to_max_norm() {
        let device = Device::Cpu;
        let v = var(&device, (3, 3));
        let vars = vec![v.clone()];
        let mut grads = grads_for(&[&v], 10.0);
        // Norm before: sqrt(9 * 100) = 30.
        clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        let g = grads.get(v.as_tensor()).unwrap();
        let norm = (g.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap() as f64).sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn clip_is_a_no_op_under_the_limit() {
        let device = Device::Cpu;
        let v = var(&device, (2, 2));
        let vars = vec![v.clone()];
        let mut grads = grads_for(&[&v], 0.1);
        clip_grad_norm(&mut grads, &vars, 10.0).unwrap();
        let g = grads.get(v.as_tensor()).unwrap();
        let first = g.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((first - 0.1).abs() < 1e-6);
    }
}
