//! Scripted backend.
//!
//! Replays a fixed list of token pieces instead of running a model, and counts
//! every live handle so tests can check that load/free cycles release
//! everything. Used by the test suites and benchmarks; it never touches the
//! model file contents beyond what the engine itself validates.

use std::cell::Cell;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::SamplerConfig;
use crate::inference::backend::{
    Backend, BackendError, ContextParams, ModelParams, ProjectorParams, TokenId,
};
use crate::inference::cancel::CancelToken;

pub const BOS_TOKEN: TokenId = 1;
pub const EOG_TOKEN: TokenId = 2;
/// Scripted pieces map to tokens `PIECE_BASE + index`.
pub const PIECE_BASE: TokenId = 100;

/// What the scripted backend does.
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    /// Pieces produced in order, one per sampled token. End of generation is
    /// sampled once they run out.
    pub pieces: Vec<Vec<u8>>,

    /// Cycle through the pieces forever instead of ending.
    pub endless: bool,

    pub fail_model_load: bool,
    pub fail_context: bool,
    pub fail_projector: bool,
    pub fail_image: bool,

    /// Fail the decode of the n-th generated token (0-based).
    pub fail_decode_at: Option<usize>,

    /// Tokens an image needs before the projector budget is applied.
    pub image_tokens: i32,

    /// Trip this token while the prompt is being evaluated.
    pub cancel_on_prompt: Option<CancelToken>,

    /// Trip the token right after the n-th token (0-based) is sampled.
    pub cancel_at_step: Option<(usize, CancelToken)>,
}

impl MockScript {
    pub fn with_pieces<I, P>(pieces: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        Self {
            pieces: pieces.into_iter().map(|p| p.as_ref().to_vec()).collect(),
            image_tokens: 256,
            ..Default::default()
        }
    }

    pub fn endless(mut self) -> Self {
        self.endless = true;
        self
    }
}

/// Live handle counts and call records.
#[derive(Debug, Default)]
pub struct MockStats {
    pub runtimes: AtomicUsize,
    pub models: AtomicUsize,
    pub contexts: AtomicUsize,
    pub samplers: AtomicUsize,
    pub projectors: AtomicUsize,
    pub images: AtomicUsize,

    pub decode_calls: AtomicUsize,
    pub largest_decode: AtomicUsize,
    pub memory_clears: AtomicUsize,

    pub last_model_params: Mutex<Option<ModelParams>>,
    pub last_context_params: Mutex<Option<ContextParams>>,
    pub last_projector_params: Mutex<Option<ProjectorParams>>,
    pub last_multimodal_text: Mutex<Option<String>>,
    pub last_seed: Mutex<Option<u32>>,
}

impl MockStats {
    /// Total handles that have been created and not yet dropped.
    pub fn live_handles(&self) -> usize {
        [
            &self.runtimes,
            &self.models,
            &self.contexts,
            &self.samplers,
            &self.projectors,
            &self.images,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

#[derive(Debug, Clone, Copy)]
enum Handle {
    Runtime,
    Model,
    Context,
    Sampler,
    Projector,
    Image,
}

impl Handle {
    fn counter(self, stats: &MockStats) -> &AtomicUsize {
        match self {
            Handle::Runtime => &stats.runtimes,
            Handle::Model => &stats.models,
            Handle::Context => &stats.contexts,
            Handle::Sampler => &stats.samplers,
            Handle::Projector => &stats.projectors,
            Handle::Image => &stats.images,
        }
    }
}

fn record<T>(slot: &Mutex<Option<T>>, value: T) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
}

/// Decrements its counter when dropped.
#[derive(Debug)]
struct Live {
    stats: Arc<MockStats>,
    handle: Handle,
}

impl Live {
    fn new(stats: &Arc<MockStats>, handle: Handle) -> Self {
        handle.counter(stats).fetch_add(1, Ordering::SeqCst);
        Self {
            stats: stats.clone(),
            handle,
        }
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        self.handle.counter(&self.stats).fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockRuntime {
    _live: Live,
}

#[derive(Debug)]
pub struct MockModel {
    _live: Live,
}

#[derive(Debug)]
pub struct MockContext {
    _live: Live,
    n_ctx: usize,
    n_past: usize,
    /// Tokens sampled since the last memory clear.
    steps: Cell<usize>,
    /// Generated tokens decoded since the last memory clear.
    generated_decodes: usize,
}

#[derive(Debug)]
pub struct MockSampler {
    _live: Live,
    pub accepted: Vec<TokenId>,
}

#[derive(Debug)]
pub struct MockProjector {
    _live: Live,
    params: ProjectorParams,
}

#[derive(Debug)]
pub struct MockImage {
    _live: Live,
}

#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    script: MockScript,
    stats: Arc<MockStats>,
}

impl MockBackend {
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Shared view of the handle counts, usable after the backend has moved
    /// into an engine.
    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }

    fn trip_prompt_cancel(&self) {
        if let Some(token) = &self.script.cancel_on_prompt {
            token.cancel();
        }
    }
}

impl Backend for MockBackend {
    type Runtime = MockRuntime;
    type Model = MockModel;
    type Context = MockContext;
    type Sampler = MockSampler;
    type Projector = MockProjector;
    type Image = MockImage;

    fn init(&self) -> Result<MockRuntime, BackendError> {
        Ok(MockRuntime {
            _live: Live::new(&self.stats, Handle::Runtime),
        })
    }

    fn load_model(
        &self,
        _runtime: &MockRuntime,
        path: &Path,
        params: &ModelParams,
    ) -> Result<MockModel, BackendError> {
        if self.script.fail_model_load {
            return Err(BackendError::ModelLoad(path.display().to_string()));
        }
        record(&self.stats.last_model_params, params.clone());
        Ok(MockModel {
            _live: Live::new(&self.stats, Handle::Model),
        })
    }

    fn new_context(
        &self,
        _runtime: &MockRuntime,
        _model: &MockModel,
        params: &ContextParams,
    ) -> Result<MockContext, BackendError> {
        if self.script.fail_context {
            return Err(BackendError::ContextCreate("scripted failure".into()));
        }
        record(&self.stats.last_context_params, params.clone());
        Ok(MockContext {
            _live: Live::new(&self.stats, Handle::Context),
            n_ctx: params.n_ctx as usize,
            n_past: 0,
            steps: Cell::new(0),
            generated_decodes: 0,
        })
    }

    fn new_sampler(&self, _config: &SamplerConfig, seed: u32) -> Result<MockSampler, BackendError> {
        record(&self.stats.last_seed, seed);
        Ok(MockSampler {
            _live: Live::new(&self.stats, Handle::Sampler),
            accepted: Vec::new(),
        })
    }

    fn load_projector(
        &self,
        _model: &MockModel,
        path: &Path,
        params: &ProjectorParams,
    ) -> Result<MockProjector, BackendError> {
        if self.script.fail_projector {
            return Err(BackendError::ProjectorInit(path.display().to_string()));
        }
        record(&self.stats.last_projector_params, params.clone());
        Ok(MockProjector {
            _live: Live::new(&self.stats, Handle::Projector),
            params: params.clone(),
        })
    }

    fn clear_memory(&self, ctx: &mut MockContext) {
        self.stats.memory_clears.fetch_add(1, Ordering::SeqCst);
        ctx.n_past = 0;
        ctx.steps.set(0);
        ctx.generated_decodes = 0;
    }

    /// One token per whitespace-separated word, after a BOS token.
    fn tokenize(&self, _model: &MockModel, text: &str) -> Result<Vec<TokenId>, BackendError> {
        self.trip_prompt_cancel();
        let mut tokens = vec![BOS_TOKEN];
        tokens.extend(text.split_whitespace().enumerate().map(|(i, _)| 1000 + i as TokenId));
        Ok(tokens)
    }

    fn decode(
        &self,
        ctx: &mut MockContext,
        tokens: &[TokenId],
        start_pos: usize,
        _logits_last: bool,
    ) -> Result<(), BackendError> {
        self.stats.decode_calls.fetch_add(1, Ordering::SeqCst);
        self.stats
            .largest_decode
            .fetch_max(tokens.len(), Ordering::SeqCst);

        if ctx.steps.get() > 0 {
            let index = ctx.generated_decodes;
            ctx.generated_decodes += 1;
            if self.script.fail_decode_at == Some(index) {
                return Err(BackendError::Decode(format!("scripted failure at {index}")));
            }
        }

        let end = start_pos + tokens.len();
        if end > ctx.n_ctx {
            return Err(BackendError::Decode(format!(
                "position {end} exceeds context {}",
                ctx.n_ctx
            )));
        }
        ctx.n_past = end;
        Ok(())
    }

    fn media_marker(&self) -> &str {
        "<__media__>"
    }

    fn load_image(&self, _projector: &MockProjector, path: &Path) -> Result<MockImage, BackendError> {
        if self.script.fail_image || !path.exists() {
            return Err(BackendError::ImageLoad(path.display().to_string()));
        }
        Ok(MockImage {
            _live: Live::new(&self.stats, Handle::Image),
        })
    }

    /// The image costs `image_tokens` clamped to the projector's budget.
    fn eval_multimodal(
        &self,
        projector: &MockProjector,
        ctx: &mut MockContext,
        text: &str,
        _image: &MockImage,
        _n_batch: u32,
    ) -> Result<usize, BackendError> {
        self.trip_prompt_cancel();
        record(&self.stats.last_multimodal_text, text.to_string());

        let image = self
            .script
            .image_tokens
            .clamp(projector.params.image_min_tokens, projector.params.image_max_tokens)
            as usize;
        let n_past = 1 + image + text.split_whitespace().count();
        if n_past > ctx.n_ctx {
            return Err(BackendError::Decode("image prompt exceeds context".into()));
        }
        ctx.n_past = n_past;
        Ok(n_past)
    }

    fn sample(&self, _sampler: &mut MockSampler, ctx: &MockContext) -> TokenId {
        let step = ctx.steps.get();
        ctx.steps.set(step + 1);

        if let Some((at, token)) = &self.script.cancel_at_step {
            if *at == step {
                token.cancel();
            }
        }

        let n = self.script.pieces.len();
        if n == 0 || (!self.script.endless && step >= n) {
            EOG_TOKEN
        } else {
            PIECE_BASE + (step % n) as TokenId
        }
    }

    fn accept(&self, sampler: &mut MockSampler, token: TokenId) {
        sampler.accepted.push(token);
    }

    fn is_end_of_generation(&self, _model: &MockModel, token: TokenId) -> bool {
        token == EOG_TOKEN
    }

    fn token_bytes(&self, _model: &MockModel, token: TokenId) -> Result<Vec<u8>, BackendError> {
        if token < PIECE_BASE {
            return Ok(Vec::new());
        }
        self.script
            .pieces
            .get((token - PIECE_BASE) as usize)
            .cloned()
            .ok_or_else(|| BackendError::Piece(format!("unknown token {token}")))
    }
}
