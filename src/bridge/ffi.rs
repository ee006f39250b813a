//! C ABI entry points.
//!
//! A host application drives one process-wide engine through plain C calls:
//!
//! | export                    | returns                          |
//! |---------------------------|----------------------------------|
//! | `configure_engine(json)`  | 0, or -1 on malformed JSON       |
//! | `load_model(path)`        | 0, -1 model load, -2 context     |
//! | `load_mmproj(path)`       | 0, -2 no model, -1 init failed   |
//! | `infer(prompt, img, cb)`  | 0, -1 not ready, < -1 other      |
//! | `cancel_inference()`      | -                                |
//! | `set_inference_config(n)` | - (step cap, <= 0 for default)   |
//! | `free_engine()`           | -                                |
//! | `register_crash_handlers()` | -                             |
//! | `last_stop_reason()`      | 0 none, 1 eog, 2 max, 3 cancel, 4 decode |
//! | `bridge_last_error()`     | owned message or null            |
//! | `bridge_free_string(s)`   | -                                |
//!
//! [`Bridge`] holds the logic and [`BridgeSlot`] the locking, panic capture
//! and cancel path the exports share. Both are generic over the backend so
//! they can be exercised without llama.cpp; the exports themselves exist only
//! with the `llama-cpp` feature.
//!
//! Status codes -99 (panic caught) and -8 (called from inside a token
//! callback) can come back from any export that returns one.

use std::cell::Cell;
use std::ffi::{c_char, c_int, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Mutex;

use tracing::{error, warn};

use crate::error::{BridgeError, Result, STATUS_BUSY, STATUS_OK, STATUS_PANIC};
use crate::inference::backend::Backend;
use crate::inference::cancel::CancelToken;
use crate::inference::engine::{Engine, StopReason};
use crate::logging::{self, LogOptions};

/// Receives each generated text fragment as a NUL-terminated UTF-8 string.
/// The pointer is only valid for the duration of the call. The callback may
/// call `cancel_inference` but no other export.
pub type TokenCallback = Option<unsafe extern "C" fn(*const c_char)>;

/// Engine plus the bookkeeping the C boundary needs.
pub struct Bridge<B: Backend> {
    engine: Engine<B>,
    last_error: Option<String>,
}

impl<B: Backend> Bridge<B> {
    pub fn new(backend: B) -> Self {
        Self::with_cancel_token(backend, CancelToken::new())
    }

    pub fn with_cancel_token(backend: B, cancel: CancelToken) -> Self {
        Self {
            engine: Engine::with_cancel_token(backend, cancel),
            last_error: None,
        }
    }

    pub fn engine(&self) -> &Engine<B> {
        &self.engine
    }

    /// Message of the most recent failed call, cleared by a successful one.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn report(&mut self, op: &'static str, result: Result<()>) -> c_int {
        match result {
            Ok(()) => {
                self.last_error = None;
                STATUS_OK
            }
            Err(e) => {
                let code = e.status_code();
                error!(op, code, "{e}");
                self.last_error = Some(e.to_string());
                code
            }
        }
    }

    /// # Safety
    /// `json` must be null or a NUL-terminated string valid for the call.
    pub unsafe fn configure(&mut self, json: *const c_char) -> c_int {
        let result = c_str(json, "config").and_then(|json| self.engine.configure(json));
        self.report("configure_engine", result)
    }

    /// # Safety
    /// `path` must be null or a NUL-terminated string valid for the call.
    pub unsafe fn load_model(&mut self, path: *const c_char) -> c_int {
        let result = c_str(path, "model path").and_then(|p| self.engine.load_model(Path::new(p)));
        self.report("load_model", result)
    }

    /// # Safety
    /// `path` must be null or a NUL-terminated string valid for the call.
    pub unsafe fn load_projector(&mut self, path: *const c_char) -> c_int {
        let result =
            c_str(path, "projector path").and_then(|p| self.engine.load_projector(Path::new(p)));
        self.report("load_mmproj", result)
    }

    /// Run a generation, forwarding fragments to `callback`. A null `image`
    /// or an empty one means text only; a null callback discards the output.
    ///
    /// # Safety
    /// `prompt` and `image` must be null or NUL-terminated strings valid for
    /// the call; `callback` must be safe to call with a string pointer.
    pub unsafe fn infer(
        &mut self,
        prompt: *const c_char,
        image: *const c_char,
        callback: TokenCallback,
    ) -> c_int {
        let result = self.infer_inner(prompt, image, callback);
        self.report("infer", result)
    }

    unsafe fn infer_inner(
        &mut self,
        prompt: *const c_char,
        image: *const c_char,
        callback: TokenCallback,
    ) -> Result<()> {
        let prompt = c_str(prompt, "prompt")?;
        let image = if image.is_null() {
            None
        } else {
            Some(Path::new(c_str(image, "image path")?))
        };
        self.engine
            .infer(prompt, image, |piece| unsafe { emit(callback, piece) })?;
        Ok(())
    }

    /// Step cap for later generations; zero or negative restores the default.
    pub fn set_max_tokens(&mut self, max_tokens: c_int) {
        self.engine.set_max_tokens(max_tokens.max(0) as usize);
    }

    pub fn free(&mut self) {
        self.engine.free();
    }

    pub fn last_stop_reason(&self) -> c_int {
        self.engine.last_stop_reason().map_or(0, StopReason::code)
    }
}

/// Borrow a C string as UTF-8.
///
/// # Safety
/// `ptr` must be null or a NUL-terminated string that outlives `'a`.
unsafe fn c_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(BridgeError::InvalidArgument(format!("{what} is null")));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|e| BridgeError::InvalidArgument(format!("{what} is not UTF-8: {e}")))
}

/// # Safety
/// See [`TokenCallback`].
unsafe fn emit(callback: TokenCallback, piece: &str) {
    let Some(callback) = callback else {
        return;
    };
    // Interior NULs would truncate the fragment on the C side.
    let text = CString::new(piece)
        .or_else(|_| CString::new(piece.replace('\0', "")))
        .unwrap_or_default();
    callback(text.as_ptr());
}

thread_local! {
    /// Set while this thread holds a [`BridgeSlot`] lock.
    static IN_CALL: Cell<bool> = const { Cell::new(false) };
}

struct CallGuard;

impl CallGuard {
    fn enter() -> Self {
        IN_CALL.with(|c| c.set(true));
        CallGuard
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        IN_CALL.with(|c| c.set(false));
    }
}

/// Why a [`BridgeSlot::call`] did not run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    /// The operation panicked; the panic was caught.
    Panicked,
    /// Made from a token callback while this thread already holds the bridge.
    Reentrant,
}

impl CallFailure {
    pub fn status_code(self) -> c_int {
        match self {
            CallFailure::Panicked => STATUS_PANIC,
            CallFailure::Reentrant => STATUS_BUSY,
        }
    }
}

/// The process-wide bridge as the C exports see it: the bridge behind a lock,
/// plus a cancel token that is reachable without taking that lock.
pub struct BridgeSlot<B: Backend> {
    cancel: CancelToken,
    bridge: Mutex<Bridge<B>>,
}

impl<B: Backend> BridgeSlot<B> {
    pub fn new(backend: B) -> Self {
        let cancel = CancelToken::new();
        Self {
            bridge: Mutex::new(Bridge::with_cancel_token(backend, cancel.clone())),
            cancel,
        }
    }

    /// Request cancellation of the running generation. Never blocks.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run `f` on the bridge under its lock with panics caught.
    ///
    /// The lock is held for the whole call, including every token callback of
    /// an `infer`. A call from inside such a callback fails with
    /// [`CallFailure::Reentrant`] instead of deadlocking.
    pub fn call<R>(&self, op: &'static str, f: impl FnOnce(&mut Bridge<B>) -> R) -> std::result::Result<R, CallFailure> {
        logging::init(LogOptions::default());
        if IN_CALL.with(Cell::get) {
            warn!(op, "Called from inside a token callback; only cancel_inference is allowed there");
            return Err(CallFailure::Reentrant);
        }
        catch_unwind(AssertUnwindSafe(|| {
            let mut bridge = self.bridge.lock().unwrap_or_else(|e| e.into_inner());
            let _guard = CallGuard::enter();
            f(&mut bridge)
        }))
        .map_err(|_| {
            error!(op, "Panic caught at the C boundary");
            CallFailure::Panicked
        })
    }

    /// The last error message as a heap C string owned by the caller, or null.
    /// Release it with [`free_c_string`].
    pub fn last_error_c_string(&self) -> *mut c_char {
        self.call("bridge_last_error", |b| {
            b.last_error()
                .and_then(|msg| CString::new(msg.replace('\0', "")).ok())
                .map_or(std::ptr::null_mut(), CString::into_raw)
        })
        .unwrap_or(std::ptr::null_mut())
    }
}

/// Release a string returned by [`BridgeSlot::last_error_c_string`]. Null is
/// ignored.
///
/// # Safety
/// `s` must be null or a pointer obtained from `last_error_c_string` that has
/// not been freed yet.
pub unsafe fn free_c_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

#[cfg(feature = "llama-cpp")]
mod exports {
    use std::ffi::{c_char, c_int};
    use std::sync::LazyLock;

    use super::{free_c_string, BridgeSlot, TokenCallback};
    use crate::crash;
    use crate::inference::llama_cpp::LlamaCppBackend;
    use crate::logging::{self, LogOptions};

    static BRIDGE: LazyLock<BridgeSlot<LlamaCppBackend>> =
        LazyLock::new(|| BridgeSlot::new(LlamaCppBackend));

    #[no_mangle]
    pub unsafe extern "C" fn configure_engine(json: *const c_char) -> c_int {
        BRIDGE
            .call("configure_engine", |b| unsafe { b.configure(json) })
            .unwrap_or_else(|e| e.status_code())
    }

    #[no_mangle]
    pub unsafe extern "C" fn load_model(path: *const c_char) -> c_int {
        BRIDGE
            .call("load_model", |b| unsafe { b.load_model(path) })
            .unwrap_or_else(|e| e.status_code())
    }

    #[no_mangle]
    pub unsafe extern "C" fn load_mmproj(path: *const c_char) -> c_int {
        BRIDGE
            .call("load_mmproj", |b| unsafe { b.load_projector(path) })
            .unwrap_or_else(|e| e.status_code())
    }

    /// Only `cancel_inference` may be called from inside `callback`; any
    /// other export returns its busy value there.
    #[no_mangle]
    pub unsafe extern "C" fn infer(
        prompt: *const c_char,
        image: *const c_char,
        callback: TokenCallback,
    ) -> c_int {
        BRIDGE
            .call("infer", |b| unsafe { b.infer(prompt, image, callback) })
            .unwrap_or_else(|e| e.status_code())
    }

    #[no_mangle]
    pub extern "C" fn cancel_inference() {
        BRIDGE.cancel();
    }

    #[no_mangle]
    pub extern "C" fn set_inference_config(max_tokens: c_int) {
        let _ = BRIDGE.call("set_inference_config", |b| b.set_max_tokens(max_tokens));
    }

    #[no_mangle]
    pub extern "C" fn free_engine() {
        let _ = BRIDGE.call("free_engine", |b| b.free());
    }

    #[no_mangle]
    pub extern "C" fn register_crash_handlers() {
        logging::init(LogOptions::default());
        crash::install();
    }

    #[no_mangle]
    pub extern "C" fn last_stop_reason() -> c_int {
        BRIDGE
            .call("last_stop_reason", |b| b.last_stop_reason())
            .unwrap_or(0)
    }

    /// Message of the last failed call, or null. Release it with
    /// [`bridge_free_string`].
    #[no_mangle]
    pub extern "C" fn bridge_last_error() -> *mut c_char {
        BRIDGE.last_error_c_string()
    }

    #[no_mangle]
    pub unsafe extern "C" fn bridge_free_string(s: *mut c_char) {
        unsafe { free_c_string(s) };
    }
}

#[cfg(feature = "llama-cpp")]
pub use exports::*;
