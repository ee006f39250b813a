//! Channel and `Stream` adapters over a blocking generation.
//!
//! The engine's generation loop is synchronous and holds the engine for its
//! whole run, so it is moved onto tokio's blocking pool and its fragments are
//! forwarded through a bounded channel.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::inference::backend::Backend;
use crate::inference::engine::{Engine, GenerationSummary};

/// A generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Unique request ID.
    pub request_id: String,

    pub prompt: String,

    /// Image evaluated with the prompt when a projector is loaded.
    pub image: Option<PathBuf>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// A generation event.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A complete text fragment.
    Token { text: String },
    /// Generation is complete.
    Done(GenerationSummary),
    /// The generation could not run.
    Error(String),
}

/// Run `request` on the blocking pool. Must be called from within a tokio
/// runtime.
///
/// Dropping the receiver cancels the generation at its next step.
pub fn spawn_generation<B>(
    engine: Arc<Mutex<Engine<B>>>,
    request: GenerationRequest,
) -> mpsc::Receiver<GenerationEvent>
where
    B: Backend + 'static,
    Engine<B>: Send,
{
    let (tx, rx) = mpsc::channel(32);

    tokio::task::spawn_blocking(move || {
        let mut engine = engine.lock().unwrap_or_else(|e| e.into_inner());
        let cancel = engine.cancel_token();
        info!(request_id = %request.request_id, "Generation started");

        let result = engine.infer(&request.prompt, request.image.as_deref(), |piece| {
            let event = GenerationEvent::Token {
                text: piece.to_string(),
            };
            if tx.blocking_send(event).is_err() && !cancel.is_cancelled() {
                debug!("Receiver dropped, cancelling");
                cancel.cancel();
            }
        });

        let event = match result {
            Ok(summary) => GenerationEvent::Done(summary),
            Err(e) => GenerationEvent::Error(e.to_string()),
        };
        let _ = tx.blocking_send(event);
    });

    rx
}

/// The events of a spawned generation as a `Stream`.
pub fn generation_stream(rx: mpsc::Receiver<GenerationEvent>) -> impl Stream<Item = GenerationEvent> {
    ReceiverStream::new(rx)
}
