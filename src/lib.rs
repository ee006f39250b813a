//! mandre-bridge: native bridge exposing llama.cpp text and vision inference
//! to a host application.
//!
//! The host configures the engine with a JSON blob, loads a model and an
//! optional multimodal projector, and receives generated text through a
//! callback. Tokenization, decoding, the KV cache and sampling all happen
//! inside llama.cpp; this crate sequences the calls and owns the handles.

pub mod bridge;
pub mod config;
pub mod crash;
pub mod error;
pub mod inference;
pub mod logging;

pub use config::{EngineConfig, SamplerConfig};
pub use error::{BridgeError, Result};
pub use inference::{Backend, CancelToken, Engine, GenerationSummary, StopReason};
