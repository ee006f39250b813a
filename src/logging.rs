//! Tracing subscriber setup.
//!
//! A host process has no Rust `main`, so the C entry points call [`init`]
//! lazily. The first call wins; later calls are no-ops.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Log output options.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub json: bool,
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(options: LogOptions) {
    INIT.call_once(|| {
        let filter = if options.verbose {
            "mandre_bridge=debug"
        } else {
            "mandre_bridge=info"
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

        // Another subscriber may already be installed by the host or a test harness.
        let _ = if options.json {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .try_init()
        };
    });
}
