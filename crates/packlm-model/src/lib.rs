//! # packlm-model — Reference Model Collaborator
//!
//! A small decoder-only causal transformer implementing
//! [`packlm_common::CausalLm`]. The trainer is generic over that trait; this
//! crate exists so the full pipeline (batching → forward → loss → gradient
//! diagnostics) runs end-to-end with realistic parameter names
//! (`transformer.layers.{i}.*`).

pub mod model;

pub use model::CausalTransformer;
