//! Error types for the bridge.
//!
//! The host sees plain integer status codes; inside the crate every failure is
//! a [`BridgeError`] so callers can match on what went wrong.

use thiserror::Error;

use crate::inference::backend::BackendError;

/// Status code returned by a C entry point that completed normally.
pub const STATUS_OK: i32 = 0;

/// Status code returned when a panic was caught at the C boundary.
pub const STATUS_PANIC: i32 = -99;

/// Status code returned by an export called from inside a token callback.
pub const STATUS_BUSY: i32 = -8;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid configuration: {0}")]
    ConfigParse(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Context creation failed: {0}")]
    ContextCreate(String),

    #[error("No model loaded")]
    ModelNotLoaded,

    #[error("Engine not ready: load a model first")]
    ContextNotReady,

    #[error("Projector initialization failed: {0}")]
    ProjectorInit(String),

    #[error("Prompt evaluation failed: {0}")]
    PromptEval(String),

    #[error("Prompt too long: {tokens} tokens, context holds {n_ctx}")]
    PromptTooLong { tokens: usize, n_ctx: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Integer code reported across the C boundary.
    ///
    /// The load/projector/infer codes keep the values hosts already rely on:
    /// `-1` model load, `-2` context creation, `-2` projector without a model,
    /// `-1` inference before load.
    pub fn status_code(&self) -> i32 {
        match self {
            BridgeError::ConfigParse(_) => -1,
            BridgeError::ModelLoad(_) => -1,
            BridgeError::ContextCreate(_) => -2,
            BridgeError::ModelNotLoaded => -2,
            BridgeError::ContextNotReady => -1,
            BridgeError::ProjectorInit(_) => -1,
            BridgeError::PromptEval(_) => -3,
            BridgeError::PromptTooLong { .. } => -4,
            BridgeError::InvalidArgument(_) => -5,
            BridgeError::Backend(_) => -6,
            BridgeError::Io(_) => -7,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
