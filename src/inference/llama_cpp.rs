//! llama.cpp backend over the raw `llama-cpp-sys-2` bindings, with the mtmd
//! projector for images.
//!
//! Only compiled with the `llama-cpp` feature. Every handle owns one
//! llama.cpp object and releases it on drop.

/// Run a llama.cpp call that writes into `buf` and returns the count written,
/// or the negated count it needs when `buf` is too small. Retries once at the
/// requested size; `None` if the call still fails.
#[cfg_attr(not(feature = "llama-cpp"), allow(dead_code))]
fn fill_growing<T: Copy + Default>(initial: usize, mut fill: impl FnMut(&mut [T]) -> i32) -> Option<Vec<T>> {
    let mut buf = vec![T::default(); initial];
    let mut n = fill(&mut buf);
    if n < 0 {
        buf.resize(n.unsigned_abs() as usize, T::default());
        n = fill(&mut buf);
    }
    let n = usize::try_from(n).ok()?;
    buf.truncate(n);
    Some(buf)
}

#[cfg(feature = "llama-cpp")]
mod inner {
    use std::ffi::{c_char, CStr, CString};
    use std::path::Path;
    use std::ptr::NonNull;
    use std::sync::Arc;

    use llama_cpp_sys_2 as sys;
    use tracing::debug;

    use super::fill_growing;
    use crate::config::SamplerConfig;
    use crate::inference::backend::{
        Backend, BackendError, ContextParams, KvCacheType, ModelParams, ProjectorParams, TokenId,
    };

    /// Initial buffer for one token's text; longer pieces are retried.
    const PIECE_BUFFER: usize = 256;

    fn kv_type(t: KvCacheType) -> sys::ggml_type {
        match t {
            KvCacheType::F16 => sys::GGML_TYPE_F16,
            KvCacheType::Q8_0 => sys::GGML_TYPE_Q8_0,
        }
    }

    fn c_path(path: &Path) -> Result<CString, String> {
        let s = path
            .to_str()
            .ok_or_else(|| format!("path is not UTF-8: {}", path.display()))?;
        CString::new(s).map_err(|e| format!("{}: {e}", path.display()))
    }

    /// mtmd parameters with the image token budget applied.
    pub(super) fn mtmd_params(params: &ProjectorParams) -> sys::mtmd_context_params {
        let mut p = unsafe { sys::mtmd_context_params_default() };
        p.use_gpu = params.use_gpu;
        p.print_timings = false;
        p.n_threads = params.n_threads;
        p.image_min_tokens = params.image_min_tokens;
        p.image_max_tokens = params.image_max_tokens;
        p
    }

    #[derive(Debug, Default, Clone, Copy)]
    pub struct LlamaCppBackend;

    /// Process-wide llama.cpp state.
    pub struct LlamaRuntime(());

    impl Drop for LlamaRuntime {
        fn drop(&mut self) {
            unsafe { sys::llama_backend_free() };
        }
    }

    struct ModelPtr(NonNull<sys::llama_model>);

    impl Drop for ModelPtr {
        fn drop(&mut self) {
            unsafe { sys::llama_model_free(self.0.as_ptr()) };
        }
    }

    /// Shared so contexts and projectors can keep the weights alive.
    pub struct LlamaCppModel(Arc<ModelPtr>);

    impl LlamaCppModel {
        fn as_ptr(&self) -> *mut sys::llama_model {
            self.0 .0.as_ptr()
        }

        fn vocab(&self) -> *const sys::llama_vocab {
            unsafe { sys::llama_model_get_vocab(self.as_ptr()) }
        }
    }

    pub struct LlamaCppContext {
        ctx: NonNull<sys::llama_context>,
        _model: Arc<ModelPtr>,
    }

    impl Drop for LlamaCppContext {
        fn drop(&mut self) {
            unsafe { sys::llama_free(self.ctx.as_ptr()) };
        }
    }

    pub struct LlamaCppSampler(NonNull<sys::llama_sampler>);

    impl Drop for LlamaCppSampler {
        fn drop(&mut self) {
            unsafe { sys::llama_sampler_free(self.0.as_ptr()) };
        }
    }

    pub struct LlamaCppProjector {
        ctx: NonNull<sys::mtmd_context>,
        _model: Arc<ModelPtr>,
    }

    impl Drop for LlamaCppProjector {
        fn drop(&mut self) {
            unsafe { sys::mtmd_free(self.ctx.as_ptr()) };
        }
    }

    pub struct LlamaCppImage(NonNull<sys::mtmd_bitmap>);

    impl Drop for LlamaCppImage {
        fn drop(&mut self) {
            unsafe { sys::mtmd_bitmap_free(self.0.as_ptr()) };
        }
    }

    struct Batch(sys::llama_batch);

    impl Drop for Batch {
        fn drop(&mut self) {
            unsafe { sys::llama_batch_free(self.0) };
        }
    }

    struct Chunks(NonNull<sys::mtmd_input_chunks>);

    impl Drop for Chunks {
        fn drop(&mut self) {
            unsafe { sys::mtmd_input_chunks_free(self.0.as_ptr()) };
        }
    }

    // SAFETY: the engine is only ever driven from one thread at a time (it
    // lives behind a mutex); llama.cpp objects may move between threads as
    // long as they are not used concurrently.
    unsafe impl Send for LlamaRuntime {}
    unsafe impl Send for LlamaCppModel {}
    unsafe impl Send for LlamaCppContext {}
    unsafe impl Send for LlamaCppSampler {}
    unsafe impl Send for LlamaCppProjector {}
    unsafe impl Send for LlamaCppImage {}
    unsafe impl Send for ModelPtr {}
    unsafe impl Sync for ModelPtr {}

    impl Backend for LlamaCppBackend {
        type Runtime = LlamaRuntime;
        type Model = LlamaCppModel;
        type Context = LlamaCppContext;
        type Sampler = LlamaCppSampler;
        type Projector = LlamaCppProjector;
        type Image = LlamaCppImage;

        fn init(&self) -> Result<LlamaRuntime, BackendError> {
            unsafe { sys::llama_backend_init() };
            Ok(LlamaRuntime(()))
        }

        fn load_model(
            &self,
            _runtime: &LlamaRuntime,
            path: &Path,
            params: &ModelParams,
        ) -> Result<LlamaCppModel, BackendError> {
            debug!(use_mmap = params.use_mmap, path = %path.display(), "Loading model");
            let c_path = c_path(path).map_err(BackendError::ModelLoad)?;
            let mut model_params = unsafe { sys::llama_model_default_params() };
            model_params.use_mmap = params.use_mmap;

            let model = unsafe { sys::llama_model_load_from_file(c_path.as_ptr(), model_params) };
            let model = NonNull::new(model)
                .ok_or_else(|| BackendError::ModelLoad(format!("llama.cpp rejected {}", path.display())))?;
            Ok(LlamaCppModel(Arc::new(ModelPtr(model))))
        }

        fn new_context(
            &self,
            _runtime: &LlamaRuntime,
            model: &LlamaCppModel,
            params: &ContextParams,
        ) -> Result<LlamaCppContext, BackendError> {
            let mut ctx_params = unsafe { sys::llama_context_default_params() };
            ctx_params.n_ctx = params.n_ctx;
            ctx_params.n_batch = params.n_batch;
            ctx_params.n_ubatch = params.n_ubatch;
            ctx_params.n_threads = params.n_threads;
            ctx_params.n_threads_batch = params.n_threads_batch;
            ctx_params.type_k = kv_type(params.type_k);
            ctx_params.type_v = kv_type(params.type_v);

            let ctx = unsafe { sys::llama_init_from_model(model.as_ptr(), ctx_params) };
            let ctx = NonNull::new(ctx)
                .ok_or_else(|| BackendError::ContextCreate(format!("n_ctx {} not allocated", params.n_ctx)))?;
            Ok(LlamaCppContext {
                ctx,
                _model: model.0.clone(),
            })
        }

        fn new_sampler(&self, config: &SamplerConfig, seed: u32) -> Result<LlamaCppSampler, BackendError> {
            let chain = unsafe { sys::llama_sampler_chain_init(sys::llama_sampler_chain_default_params()) };
            let chain = NonNull::new(chain)
                .ok_or_else(|| BackendError::Init("sampler chain not allocated".to_string()))?;
            let sampler = LlamaCppSampler(chain);
            unsafe {
                let stages = [
                    sys::llama_sampler_init_penalties(
                        config.penalty_last_n,
                        config.penalty_repeat,
                        config.penalty_freq,
                        config.penalty_present,
                    ),
                    sys::llama_sampler_init_top_k(config.top_k),
                    sys::llama_sampler_init_top_p(config.top_p, config.min_keep),
                    sys::llama_sampler_init_temp(config.temperature),
                    sys::llama_sampler_init_dist(seed),
                ];
                // The chain owns its stages from here on.
                for stage in stages {
                    sys::llama_sampler_chain_add(sampler.0.as_ptr(), stage);
                }
            }
            Ok(sampler)
        }

        fn load_projector(
            &self,
            model: &LlamaCppModel,
            path: &Path,
            params: &ProjectorParams,
        ) -> Result<LlamaCppProjector, BackendError> {
            debug!(
                image_min_tokens = params.image_min_tokens,
                image_max_tokens = params.image_max_tokens,
                "Creating mtmd context"
            );
            let c_path = c_path(path).map_err(BackendError::ProjectorInit)?;
            let ctx = unsafe { sys::mtmd_init_from_file(c_path.as_ptr(), model.as_ptr(), mtmd_params(params)) };
            let ctx = NonNull::new(ctx)
                .ok_or_else(|| BackendError::ProjectorInit(format!("mtmd rejected {}", path.display())))?;
            Ok(LlamaCppProjector {
                ctx,
                _model: model.0.clone(),
            })
        }

        fn clear_memory(&self, ctx: &mut LlamaCppContext) {
            unsafe { sys::llama_memory_clear(sys::llama_get_memory(ctx.ctx.as_ptr()), true) };
        }

        fn tokenize(&self, model: &LlamaCppModel, text: &str) -> Result<Vec<TokenId>, BackendError> {
            let vocab = model.vocab();
            let len = i32::try_from(text.len()).map_err(|_| BackendError::Tokenize("prompt too large".to_string()))?;
            fill_growing(text.len() + 2, |buf: &mut [sys::llama_token]| unsafe {
                sys::llama_tokenize(
                    vocab,
                    text.as_ptr().cast::<c_char>(),
                    len,
                    buf.as_mut_ptr(),
                    buf.len() as i32,
                    true,
                    true,
                )
            })
            .ok_or_else(|| BackendError::Tokenize("llama_tokenize failed".to_string()))
        }

        fn decode(
            &self,
            ctx: &mut LlamaCppContext,
            tokens: &[TokenId],
            start_pos: usize,
            logits_last: bool,
        ) -> Result<(), BackendError> {
            let mut batch = Batch(unsafe { sys::llama_batch_init(tokens.len().max(1) as i32, 0, 1) });
            let last = tokens.len().saturating_sub(1);
            unsafe {
                let b = &mut batch.0;
                for (i, &token) in tokens.iter().enumerate() {
                    *b.token.add(i) = token;
                    *b.pos.add(i) = (start_pos + i) as sys::llama_pos;
                    *b.n_seq_id.add(i) = 1;
                    *(*b.seq_id.add(i)) = 0;
                    *b.logits.add(i) = i8::from(logits_last && i == last);
                }
                b.n_tokens = tokens.len() as i32;
            }
            match unsafe { sys::llama_decode(ctx.ctx.as_ptr(), batch.0) } {
                0 => Ok(()),
                rc => Err(BackendError::Decode(format!("llama_decode returned {rc}"))),
            }
        }

        fn media_marker(&self) -> &str {
            unsafe { CStr::from_ptr(sys::mtmd_default_marker()) }
                .to_str()
                .unwrap_or("<__media__>")
        }

        fn load_image(&self, projector: &LlamaCppProjector, path: &Path) -> Result<LlamaCppImage, BackendError> {
            let c_path = c_path(path).map_err(BackendError::ImageLoad)?;
            let bitmap = unsafe { sys::mtmd_helper_bitmap_init_from_file(projector.ctx.as_ptr(), c_path.as_ptr()) };
            NonNull::new(bitmap)
                .map(LlamaCppImage)
                .ok_or_else(|| BackendError::ImageLoad(format!("cannot decode {}", path.display())))
        }

        fn eval_multimodal(
            &self,
            projector: &LlamaCppProjector,
            ctx: &mut LlamaCppContext,
            text: &str,
            image: &LlamaCppImage,
            n_batch: u32,
        ) -> Result<usize, BackendError> {
            let c_text = CString::new(text).map_err(|e| BackendError::Tokenize(e.to_string()))?;
            let input = sys::mtmd_input_text {
                text: c_text.as_ptr(),
                add_special: true,
                parse_special: true,
            };
            let chunks = NonNull::new(unsafe { sys::mtmd_input_chunks_init() })
                .map(Chunks)
                .ok_or_else(|| BackendError::Tokenize("chunk list not allocated".to_string()))?;
            let mut bitmaps = [image.0.as_ptr().cast_const()];

            let rc = unsafe {
                sys::mtmd_tokenize(
                    projector.ctx.as_ptr(),
                    chunks.0.as_ptr(),
                    &input,
                    bitmaps.as_mut_ptr(),
                    bitmaps.len(),
                )
            };
            if rc != 0 {
                return Err(BackendError::Tokenize(format!("mtmd_tokenize returned {rc}")));
            }
            debug!(chunks = unsafe { sys::mtmd_input_chunks_size(chunks.0.as_ptr()) }, "Multimodal prompt tokenized");

            let mut n_past: sys::llama_pos = 0;
            let rc = unsafe {
                sys::mtmd_helper_eval_chunks(
                    projector.ctx.as_ptr(),
                    ctx.ctx.as_ptr(),
                    chunks.0.as_ptr(),
                    0,
                    0,
                    n_batch as i32,
                    true,
                    &mut n_past,
                )
            };
            if rc != 0 {
                return Err(BackendError::Decode(format!("mtmd_helper_eval_chunks returned {rc}")));
            }
            Ok(n_past.max(0) as usize)
        }

        fn sample(&self, sampler: &mut LlamaCppSampler, ctx: &LlamaCppContext) -> TokenId {
            unsafe { sys::llama_sampler_sample(sampler.0.as_ptr(), ctx.ctx.as_ptr(), -1) }
        }

        fn accept(&self, sampler: &mut LlamaCppSampler, token: TokenId) {
            unsafe { sys::llama_sampler_accept(sampler.0.as_ptr(), token) };
        }

        fn is_end_of_generation(&self, model: &LlamaCppModel, token: TokenId) -> bool {
            unsafe { sys::llama_vocab_is_eog(model.vocab(), token) }
        }

        fn token_bytes(&self, model: &LlamaCppModel, token: TokenId) -> Result<Vec<u8>, BackendError> {
            let vocab = model.vocab();
            fill_growing(PIECE_BUFFER, |buf: &mut [u8]| unsafe {
                sys::llama_token_to_piece(vocab, token, buf.as_mut_ptr().cast::<c_char>(), buf.len() as i32, 0, true)
            })
            .ok_or_else(|| BackendError::Piece(format!("token {token} has no text")))
        }
    }
}

#[cfg(feature = "llama-cpp")]
pub use inner::{
    LlamaCppBackend, LlamaCppContext, LlamaCppImage, LlamaCppModel, LlamaCppProjector,
    LlamaCppSampler, LlamaRuntime,
};
