//! LLM inference engine.
//!
//! - [`engine`]: Call sequencing for load, prompt evaluation and generation
//! - [`backend`]: The trait the engine drives, and its parameter types
//! - [`llama_cpp`]: llama.cpp + mtmd backend (feature `llama-cpp`)
//! - [`mock`]: Scripted backend for tests and benchmarks
//! - [`model_loader`]: GGUF header validation
//! - [`pieces`]: UTF-8 assembly of streamed token pieces
//! - [`cancel`]: Cancellation token

pub mod backend;
pub mod cancel;
pub mod engine;
pub mod llama_cpp;
pub mod mock;
pub mod model_loader;
pub mod pieces;

pub use backend::{Backend, BackendError, TokenId};
pub use cancel::CancelToken;
pub use engine::{Engine, GenerationSummary, StopReason};
