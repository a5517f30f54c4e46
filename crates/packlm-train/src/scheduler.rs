//! Learning-rate schedules: linear warmup into cosine or REX decay.
//!
//! The schedule owns a step counter that is advanced exactly once per
//! optimizer update. `factor_at` is a pure function of the step, so curves
//! can be inspected without mutating anything.

use std::f64::consts::PI;

use anyhow::{bail, Result};

// ── Decay curves ────────────────────────────────────────────────────────────

/// Decay curve applied after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecayCurve {
    /// `0.5 * (1 + cos(pi * step / total_steps))`: 1 at step 0, 0 at the end.
    Cosine,
    /// Reflected-exponential ("REX") budgeted decay:
    /// `(1 - z) / (1 - z / 2)` with `z = step / total_steps`. Starts at 1,
    /// decreases smoothly, reaches 0 at the budget.
    Rex,
}

impl DecayCurve {
    pub fn from_str(s: &str) -> Self {
        match s {
            "rex" => Self::Rex,
            _ => Self::Cosine,
        }
    }

    fn raw_factor(&self, step: usize, total_steps: usize) -> f64 {
        // Saturate rather than extrapolate past the budget.
        let step = step.min(total_steps) as f64;
        let total = total_steps as f64;
        match self {
            DecayCurve::Cosine => 0.5 * (1.0 + (PI * step / total).cos()),
            DecayCurve::Rex => {
                let z = step / total;
                (1.0 - z) / (1.0 - z / 2.0)
            }
        }
    }
}

// ── Schedule ────────────────────────────────────────────────────────────────

/// Warmup-then-decay schedule over one or more optimizer parameter groups.
///
/// Emits one multiplier per group per step: each group's effective rate is
/// its base rate × the current factor.
#[derive(Clone, Debug)]
pub struct LrSchedule {
    step: usize,
    warmup_steps: Option<usize>,
    total_steps: usize,
    curve: DecayCurve,
    base_lrs: Vec<f64>,
}

impl LrSchedule {
    /// Configuration faults are reported here, not at first use:
    /// `total_steps` must be positive, and a configured warmup must be at
    /// least one step (`warmup_steps: None` disables warmup entirely —
    /// `Some(0)` would divide by zero inside the ramp).
    pub fn new(
        curve: DecayCurve,
        base_lrs: Vec<f64>,
        warmup_steps: Option<usize>,
        total_steps: usize,
    ) -> Result<Self> {
        if total_steps == 0 {
            bail!("scheduler total_steps must be positive");
        }
        if warmup_steps == Some(0) {
            bail!("warmup_steps must be at least 1; use None to disable warmup");
        }
        if base_lrs.is_empty() {
            bail!("scheduler needs at least one parameter group base lr");
        }
        Ok(Self {
            step: 0,
            warmup_steps,
            total_steps,
            curve,
            base_lrs,
        })
    }

    /// Multiplier at an arbitrary step. Pure; does not touch the counter.
    pub fn factor_at(&self, step: usize) -> f64 {
        let mut factor = self.curve.raw_factor(step, self.total_steps);
        if let Some(warmup) = self.warmup_steps {
            if step <= warmup {
                factor *= step as f64 / warmup as f64;
            }
        }
        factor
    }

    /// Multiplier at the current step.
    pub fn factor(&self) -> f64 {
        self.factor_at(self.step)
    }

    /// Effective rate of the primary parameter group.
    pub fn lr(&self) -> f64 {
        self.base_lrs[0] * self.factor()
    }

    /// Effective rate per parameter group.
    pub fn lrs(&self) -> Vec<f64> {
        let factor = self.factor();
        self.base_lrs.iter().map(|base| base * factor).collect()
    }

    /// Advance the step counter by exactly 1. Called once per optimizer
    /// update — not once per micro-batch when gradients are accumulated.
    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
