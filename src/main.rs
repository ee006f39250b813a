//! mandre-bridge CLI: run one text or vision generation from the terminal.
//!
//! Streams generated text to stdout; Ctrl-C cancels the running generation
//! and the partial output is kept.

use std::io::Write;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use mandre_bridge::bridge::streaming::{generation_stream, spawn_generation, GenerationEvent, GenerationRequest};
use mandre_bridge::config::{Cli, EngineConfig};
use mandre_bridge::inference::llama_cpp::LlamaCppBackend;
use mandre_bridge::logging::{self, LogOptions};
use mandre_bridge::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    logging::init(LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
    });

    info!("mandre-bridge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = EngineConfig::load(&cli.config)?;
    if let Some(max_tokens) = cli.max_tokens {
        config.max_tokens = max_tokens;
    }
    info!(
        n_threads = config.n_threads,
        n_ctx = config.n_ctx,
        n_batch = config.n_batch,
        max_tokens = config.max_tokens,
        "Configuration loaded"
    );

    let mut engine = Engine::new(LlamaCppBackend);
    engine.set_config(config);
    engine.load_model(&cli.model)?;
    if let Some(mmproj) = &cli.mmproj {
        engine.load_projector(mmproj)?;
    } else if cli.image.is_some() {
        warn!("--image given without --mmproj, running text only");
    }

    let cancel = engine.cancel_token();
    let engine = Arc::new(Mutex::new(engine));

    let mut request = GenerationRequest::new(cli.prompt);
    if let Some(image) = cli.image {
        request = request.with_image(image);
    }

    let mut events = generation_stream(spawn_generation(engine, request));
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(GenerationEvent::Token { text }) => {
                    stdout.write_all(text.as_bytes())?;
                    stdout.flush()?;
                }
                Some(GenerationEvent::Done(summary)) => {
                    writeln!(stdout)?;
                    info!(
                        stop = ?summary.stop_reason,
                        prompt_tokens = summary.prompt_tokens,
                        generated = summary.generated_tokens,
                        tokens_per_sec = summary.tokens_per_second(),
                        "Done"
                    );
                }
                Some(GenerationEvent::Error(e)) => anyhow::bail!(e),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling generation");
                cancel.cancel();
            }
        }
    }

    Ok(())
}
