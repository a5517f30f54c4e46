//! # packlm-train — Training Engine
//!
//! Training loop, learning-rate schedules, and gradient diagnostics:
//!
//! * **[`Trainer`]** — owns model + optimizer + schedule. One call to
//!   [`Trainer::step`] runs forward, loss, backward, diagnostics, clipping,
//!   the AdamW update, and exactly one schedule advance.
//! * **[`LrSchedule`]** — linear warmup into cosine or REX decay.
//! * **[`grad`]** — global and per-layer gradient norms, clipping.

pub mod grad;
pub mod scheduler;
pub mod trainer;

pub use grad::{clip_grad_norm, diagnostics, GradDiagnostics};
pub use scheduler::{DecayCurve, LrSchedule};
pub use trainer::{MetricObserver, StepMetrics, Trainer, TrainerConfig, TracingObserver};
