//! KV-cache and I/O-binding engine for accelerator-backed autoregressive
//! LLM inference.
//!
//! This crate sits between a vendor neural-accelerator runtime (two
//! precompiled graphs: prefill and decode) and a driver binary. Given
//! per-graph tensor metadata it discovers model shape, classifies every
//! tensor into a semantic role, allocates and binds a SMART_MASK-layout KV
//! cache, builds attention masks, and drives the prefill/decode loop with
//! greedy sampling.
//!
//! The accelerator runtime, the on-disk shard format, the graph-metadata
//! JSON parser, and the tokenizer are all external collaborators; see
//! [`runtime::Runtime`] for the one trait this crate depends on to reach
//! real hardware.

pub mod arena;
pub mod binding;
pub mod cache;
pub mod classify;
pub mod error;
pub mod generate;
pub mod mask;
pub mod metrics;
pub mod runtime;
pub mod shape;
pub mod strided;
pub mod tensor;
pub mod update;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;
pub use generate::{generate, GenerateConfig, GenerationState, Graphs, Phase};
pub use shape::ModelShape;
pub use tensor::{ClassifiedTensor, DType, QuantParams, TensorDesc, TensorRole};
