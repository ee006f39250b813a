//! Inference engine: owns the model, context, sampler chain and projector, and
//! sequences the backend calls for a generation.
//!
//! A generation:
//! 1. Clears the context's memory
//! 2. Evaluates the prompt (text, or image + text through the projector)
//! 3. Samples, streams and decodes one token per step until end of
//!    generation, cancellation, a decode failure or the step cap

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::crash;
use crate::error::{BridgeError, Result};
use crate::inference::backend::{Backend, ContextParams, KvCacheType, ModelParams, ProjectorParams};
use crate::inference::cancel::CancelToken;
use crate::inference::model_loader;
use crate::inference::pieces::PieceAssembler;

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model sampled an end-of-generation token.
    EndOfGeneration,
    /// The step cap was reached.
    MaxTokens,
    /// A cancel request was observed.
    Cancelled,
    /// Decoding a sampled token failed (usually a full context).
    DecodeFailed,
}

impl StopReason {
    /// Code reported by `last_stop_reason()` at the C boundary. 0 means no
    /// generation has finished yet.
    pub fn code(self) -> i32 {
        match self {
            StopReason::EndOfGeneration => 1,
            StopReason::MaxTokens => 2,
            StopReason::Cancelled => 3,
            StopReason::DecodeFailed => 4,
        }
    }
}

/// Outcome of one generation.
#[derive(Debug, Clone)]
pub struct GenerationSummary {
    pub stop_reason: StopReason,
    /// Positions occupied by the evaluated prompt (image tokens included).
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub elapsed: Duration,
}

impl GenerationSummary {
    pub fn tokens_per_second(&self) -> f64 {
        self.generated_tokens as f64 / self.elapsed.as_secs_f64().max(0.001)
    }
}

/// The engine state. Handles are declared in release order.
pub struct Engine<B: Backend> {
    backend: B,
    config: EngineConfig,
    cancel: CancelToken,

    projector: Option<B::Projector>,
    sampler: Option<B::Sampler>,
    context: Option<B::Context>,
    model: Option<B::Model>,
    runtime: Option<B::Runtime>,

    /// Parameters the live context was created with.
    context_params: Option<ContextParams>,
    last_stop: Option<StopReason>,
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: B) -> Self {
        Self::with_cancel_token(backend, CancelToken::new())
    }

    /// Create an engine observing an existing cancellation token.
    pub fn with_cancel_token(backend: B, cancel: CancelToken) -> Self {
        Self {
            backend,
            config: EngineConfig::default(),
            cancel,
            projector: None,
            sampler: None,
            context: None,
            model: None,
            runtime: None,
            context_params: None,
            last_stop: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply a JSON configuration patch. On error nothing changes.
    pub fn configure(&mut self, json: &str) -> Result<()> {
        self.config.apply_json(json)
    }

    /// Replace the configuration wholesale.
    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = config;
    }

    /// Cap on decode steps per generation; 0 restores the default.
    pub fn set_max_tokens(&mut self, max_tokens: usize) {
        self.config.max_tokens = if max_tokens == 0 {
            crate::config::DEFAULT_MAX_TOKENS
        } else {
            max_tokens
        };
    }

    /// A handle that cancels the running generation from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cancellation of the running generation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.context.is_some() && self.sampler.is_some()
    }

    pub fn has_projector(&self) -> bool {
        self.projector.is_some()
    }

    pub fn last_stop_reason(&self) -> Option<StopReason> {
        self.last_stop
    }

    fn context_params(&self) -> ContextParams {
        let kv = if self.config.kv_quant {
            KvCacheType::Q8_0
        } else {
            KvCacheType::F16
        };
        ContextParams {
            n_ctx: self.config.n_ctx,
            n_batch: self.config.n_batch,
            n_ubatch: self.config.n_ubatch(),
            n_threads: self.config.n_threads,
            n_threads_batch: self.config.threads_batch(),
            type_k: kv,
            type_v: kv,
        }
    }

    /// Load model weights, create a context sized per the configuration and
    /// build the sampler chain.
    ///
    /// A model that is already loaded is released first. If the context cannot
    /// be created the new model is released again.
    pub fn load_model(&mut self, path: &Path) -> Result<()> {
        crash::install();

        if self.model.is_some() {
            info!("Replacing loaded model");
            self.release_handles();
        }

        model_loader::inspect(path).map_err(|e| BridgeError::ModelLoad(e.to_string()))?;

        let params = self.context_params();
        let runtime = match self.runtime.take() {
            Some(runtime) => runtime,
            None => self.backend.init()?,
        };
        let runtime = self.runtime.insert(runtime);

        let model = self
            .backend
            .load_model(runtime, path, &ModelParams::default())
            .map_err(|e| BridgeError::ModelLoad(e.to_string()))?;

        let context = self
            .backend
            .new_context(runtime, &model, &params)
            .map_err(|e| BridgeError::ContextCreate(e.to_string()))?;

        let seed = self.config.sampler.seed();
        let sampler = self.backend.new_sampler(&self.config.sampler, seed)?;

        info!(
            model = %path.display(),
            n_ctx = params.n_ctx,
            n_batch = params.n_batch,
            n_threads = params.n_threads,
            kv_cache = ?params.type_k,
            seed,
            "Engine loaded"
        );

        self.model = Some(model);
        self.context = Some(context);
        self.sampler = Some(sampler);
        self.context_params = Some(params);
        Ok(())
    }

    /// Load the multimodal projector for the current model, replacing any
    /// projector already loaded. Runs on the CPU.
    pub fn load_projector(&mut self, path: &Path) -> Result<()> {
        let Some(model) = self.model.as_ref() else {
            return Err(BridgeError::ModelNotLoaded);
        };

        if self.projector.take().is_some() {
            debug!("Released previous projector");
        }

        model_loader::inspect(path).map_err(|e| BridgeError::ProjectorInit(e.to_string()))?;

        let params = ProjectorParams {
            use_gpu: false,
            n_threads: self.config.n_threads,
            image_min_tokens: self.config.img_min_tokens.min(self.config.img_max_tokens),
            image_max_tokens: self.config.img_max_tokens,
        };
        let projector = self
            .backend
            .load_projector(model, path, &params)
            .map_err(|e| BridgeError::ProjectorInit(e.to_string()))?;

        info!(
            projector = %path.display(),
            image_min_tokens = params.image_min_tokens,
            image_max_tokens = params.image_max_tokens,
            "Projector loaded"
        );
        self.projector = Some(projector);
        Ok(())
    }

    /// Run one generation, passing every complete text fragment to `on_piece`.
    ///
    /// The image is used only when the path is non-empty and a projector is
    /// loaded. Cancellation requested before this call is discarded; a request
    /// made while it runs stops the loop at the next step.
    pub fn infer<F>(&mut self, prompt: &str, image: Option<&Path>, mut on_piece: F) -> Result<GenerationSummary>
    where
        F: FnMut(&str),
    {
        let (Some(model), Some(context), Some(sampler), Some(params)) = (
            self.model.as_ref(),
            self.context.as_mut(),
            self.sampler.as_mut(),
            self.context_params.as_ref(),
        ) else {
            return Err(BridgeError::ContextNotReady);
        };
        let backend = &self.backend;
        let projector = self.projector.as_ref();

        let span = info_span!("generation", id = %Uuid::new_v4());
        let _enter = span.enter();

        self.cancel.reset();
        let started = Instant::now();
        backend.clear_memory(context);

        let prompt_tokens = eval_prompt(backend, params, model, context, projector, prompt, image)?;
        debug!(
            prompt_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Prompt evaluated"
        );

        let max_tokens = self.config.max_tokens;
        let mut assembler = PieceAssembler::new();
        let mut generated = 0;
        let mut pos = prompt_tokens;
        let mut stop = StopReason::MaxTokens;
        let decode_started = Instant::now();

        for _ in 0..max_tokens {
            if self.cancel.is_cancelled() {
                stop = StopReason::Cancelled;
                break;
            }

            let token = backend.sample(sampler, context);
            if backend.is_end_of_generation(model, token) {
                stop = StopReason::EndOfGeneration;
                break;
            }

            match backend.token_bytes(model, token) {
                Ok(bytes) => {
                    let text = assembler.push(&bytes);
                    if !text.is_empty() {
                        on_piece(&text);
                    }
                }
                Err(e) => warn!(token, "Token has no text: {e}"),
            }

            backend.accept(sampler, token);
            generated += 1;

            if let Err(e) = backend.decode(context, &[token], pos, true) {
                warn!(pos, "Decode failed, ending generation: {e}");
                stop = StopReason::DecodeFailed;
                break;
            }
            pos += 1;
        }

        let tail = assembler.finish();
        if !tail.is_empty() {
            on_piece(&tail);
        }

        let summary = GenerationSummary {
            stop_reason: stop,
            prompt_tokens,
            generated_tokens: generated,
            elapsed: decode_started.elapsed(),
        };
        info!(
            generated,
            stop = ?stop,
            tokens_per_sec = summary.tokens_per_second(),
            "Generation complete"
        );

        self.last_stop = Some(stop);
        Ok(summary)
    }

    fn release_handles(&mut self) {
        self.projector = None;
        self.sampler = None;
        self.context = None;
        self.model = None;
        self.context_params = None;
    }

    /// Release every handle and the backend runtime. Safe to call at any time,
    /// any number of times.
    pub fn free(&mut self) {
        let had_model = self.model.is_some();
        self.release_handles();
        self.runtime = None;
        if had_model {
            info!("Engine freed");
        }
    }
}

impl<B: Backend> Drop for Engine<B> {
    fn drop(&mut self) {
        self.free();
    }
}

/// Evaluate the prompt and return the number of occupied positions.
fn eval_prompt<B: Backend>(
    backend: &B,
    params: &ContextParams,
    model: &B::Model,
    context: &mut B::Context,
    projector: Option<&B::Projector>,
    prompt: &str,
    image: Option<&Path>,
) -> Result<usize> {
    if let Some(path) = image.filter(|p| !p.as_os_str().is_empty()) {
        match projector {
            Some(projector) => match backend.load_image(projector, path) {
                Ok(bitmap) => {
                    let started = Instant::now();
                    let text = format!("{}\n{}", backend.media_marker(), prompt);
                    let n_past = backend
                        .eval_multimodal(projector, context, &text, &bitmap, params.n_batch)
                        .map_err(|e| BridgeError::PromptEval(e.to_string()))?;
                    info!(
                        n_past,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Vision prompt evaluated"
                    );
                    return Ok(n_past);
                }
                Err(e) => warn!("{e}; evaluating the prompt as text"),
            },
            None => warn!(image = %path.display(), "No projector loaded, ignoring image"),
        }
    }

    let tokens = backend
        .tokenize(model, prompt)
        .map_err(|e| BridgeError::PromptEval(e.to_string()))?;
    if tokens.is_empty() {
        return Err(BridgeError::PromptEval("prompt produced no tokens".into()));
    }
    let n_ctx = params.n_ctx as usize;
    if tokens.len() > n_ctx {
        return Err(BridgeError::PromptTooLong {
            tokens: tokens.len(),
            n_ctx,
        });
    }

    let n_batch = params.n_batch.max(1) as usize;
    let mut pos = 0;
    for chunk in tokens.chunks(n_batch) {
        let is_last = pos + chunk.len() == tokens.len();
        backend
            .decode(context, chunk, pos, is_last)
            .map_err(|e| BridgeError::PromptEval(e.to_string()))?;
        pos += chunk.len();
    }
    Ok(tokens.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::{MockBackend, MockScript};
    use std::io::Write;

    fn gguf_file(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&model_loader::header_bytes(3, 1, 1)).unwrap();
        path
    }

    #[test]
    fn test_generation_produces_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let model = gguf_file(&dir, "model.gguf");
        let mut engine = Engine::new(MockBackend::new(MockScript::with_pieces(["Hel", "lo", "!"])));
        engine.load_model(&model).unwrap();

        let mut out = String::new();
        let summary = engine.infer("say hello", None, |p| out.push_str(p)).unwrap();

        assert_eq!(out, "Hello!");
        assert_eq!(summary.generated_tokens, 3);
        assert_eq!(summary.prompt_tokens, 3);
        assert_eq!(summary.stop_reason, StopReason::EndOfGeneration);
        assert_eq!(engine.last_stop_reason(), Some(StopReason::EndOfGeneration));
    }

    #[test]
    fn test_infer_before_load() {
        let mut engine = Engine::new(MockBackend::default());
        let err = engine.infer("hi", None, |_| {}).unwrap_err();
        assert!(matches!(err, BridgeError::ContextNotReady));
        assert_eq!(err.status_code(), -1);
    }

    #[test]
    fn test_stop_reason_codes() {
        assert_eq!(StopReason::EndOfGeneration.code(), 1);
        assert_eq!(StopReason::MaxTokens.code(), 2);
        assert_eq!(StopReason::Cancelled.code(), 3);
        assert_eq!(StopReason::DecodeFailed.code(), 4);
    }
}
