//! The backend trait: the cutpoint between the engine's call sequence and the
//! external inference library.
//!
//! Tokenization, decoding, the KV cache and the sampling algorithms all live
//! behind this trait. The engine only decides *which* calls happen and in what
//! order. [`super::llama_cpp::LlamaCppBackend`] forwards to llama.cpp;
//! [`super::mock::MockBackend`] replays a script for tests.

use std::path::Path;

use thiserror::Error;

use crate::config::SamplerConfig;

/// Token ID type.
pub type TokenId = i32;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend initialization failed: {0}")]
    Init(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Context creation failed: {0}")]
    ContextCreate(String),

    #[error("Projector initialization failed: {0}")]
    ProjectorInit(String),

    #[error("Failed to load image: {0}")]
    ImageLoad(String),

    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Token to piece failed: {0}")]
    Piece(String),
}

/// Storage type of the cached attention keys/values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvCacheType {
    F16,
    Q8_0,
}

/// Model parameters (mirrors llama_model_params).
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Memory-map the weights instead of reading them into RAM.
    pub use_mmap: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self { use_mmap: true }
    }
}

/// Context parameters (mirrors llama_context_params).
#[derive(Debug, Clone)]
pub struct ContextParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
    pub type_k: KvCacheType,
    pub type_v: KvCacheType,
}

/// Multimodal projector parameters (mirrors mtmd_context_params).
#[derive(Debug, Clone)]
pub struct ProjectorParams {
    pub use_gpu: bool,
    pub n_threads: i32,
    pub image_min_tokens: i32,
    pub image_max_tokens: i32,
}

/// Operations the engine needs from an inference library.
///
/// Handles are owned values; dropping one releases the underlying resource.
/// A context may keep its model alive internally but the engine still drops
/// handles in dependency order: projector, sampler, context, model, runtime.
pub trait Backend {
    /// Process-wide library state (llama_backend_init / llama_backend_free).
    type Runtime;
    type Model;
    type Context;
    type Sampler;
    type Projector;
    type Image;

    fn init(&self) -> Result<Self::Runtime, BackendError>;

    fn load_model(
        &self,
        runtime: &Self::Runtime,
        path: &Path,
        params: &ModelParams,
    ) -> Result<Self::Model, BackendError>;

    fn new_context(
        &self,
        runtime: &Self::Runtime,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, BackendError>;

    fn new_sampler(&self, config: &SamplerConfig, seed: u32) -> Result<Self::Sampler, BackendError>;

    fn load_projector(
        &self,
        model: &Self::Model,
        path: &Path,
        params: &ProjectorParams,
    ) -> Result<Self::Projector, BackendError>;

    /// Remove every sequence from the context's memory.
    fn clear_memory(&self, ctx: &mut Self::Context);

    /// Tokenize with special tokens added and parsed.
    fn tokenize(&self, model: &Self::Model, text: &str) -> Result<Vec<TokenId>, BackendError>;

    /// Decode `tokens` at positions `start_pos..`; logits are kept for the last
    /// token only when `logits_last` is set.
    fn decode(
        &self,
        ctx: &mut Self::Context,
        tokens: &[TokenId],
        start_pos: usize,
        logits_last: bool,
    ) -> Result<(), BackendError>;

    /// The text marker standing in for an image inside a multimodal prompt.
    fn media_marker(&self) -> &str;

    fn load_image(&self, projector: &Self::Projector, path: &Path) -> Result<Self::Image, BackendError>;

    /// Tokenize `text` jointly with `image` and evaluate the resulting chunks.
    /// Returns the number of positions now in the context.
    fn eval_multimodal(
        &self,
        projector: &Self::Projector,
        ctx: &mut Self::Context,
        text: &str,
        image: &Self::Image,
        n_batch: u32,
    ) -> Result<usize, BackendError>;

    fn sample(&self, sampler: &mut Self::Sampler, ctx: &Self::Context) -> TokenId;

    fn accept(&self, sampler: &mut Self::Sampler, token: TokenId);

    fn is_end_of_generation(&self, model: &Self::Model, token: TokenId) -> bool;

    /// Raw bytes of a token's text. May be an incomplete UTF-8 sequence.
    fn token_bytes(&self, model: &Self::Model, token: TokenId) -> Result<Vec<u8>, BackendError>;
}
