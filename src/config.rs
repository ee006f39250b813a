//! Runtime configuration for the bridge.
//!
//! The host patches the configuration with a JSON object before loading a
//! model. Values are read when the model, context and projector are created,
//! so changes after a load take effect on the next load.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "mandre-bridge", about = "Run text or vision inference through the native bridge")]
pub struct Cli {
    /// Path to the model weights (GGUF).
    #[arg(short, long)]
    pub model: PathBuf,

    /// Path to the multimodal projector (GGUF).
    #[arg(long)]
    pub mmproj: Option<PathBuf>,

    /// Prompt text.
    #[arg(short, long)]
    pub prompt: String,

    /// Image to pair with the prompt (requires --mmproj).
    #[arg(short, long)]
    pub image: Option<PathBuf>,

    /// Path to a JSON configuration patch.
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Maximum number of generated tokens.
    #[arg(long)]
    pub max_tokens: Option<usize>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Threads used for single-token decoding.
    pub n_threads: i32,

    /// Threads used for prompt/batch processing. Follows `n_threads` when unset.
    pub n_threads_batch: Option<i32>,

    /// Context size in tokens.
    pub n_ctx: u32,

    /// Logical batch size for prompt processing.
    pub n_batch: u32,

    /// Lower bound on tokens produced per image by the projector.
    pub img_min_tokens: i32,

    /// Upper bound on tokens produced per image by the projector.
    pub img_max_tokens: i32,

    /// Store the K/V cache as Q8_0 instead of F16.
    pub kv_quant: bool,

    /// Maximum number of decode steps per inference.
    pub max_tokens: usize,

    /// Sampler chain settings.
    pub sampler: SamplerConfig,
}

pub const DEFAULT_MAX_TOKENS: usize = 4096;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_threads: 4,
            n_threads_batch: None,
            n_ctx: 2048,
            n_batch: 512,
            img_min_tokens: 32,
            img_max_tokens: 128,
            kv_quant: true,
            max_tokens: DEFAULT_MAX_TOKENS,
            sampler: SamplerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Threads for batch processing.
    pub fn threads_batch(&self) -> i32 {
        self.n_threads_batch.unwrap_or(self.n_threads)
    }

    /// Physical micro-batch size: half the logical batch, at least one token.
    pub fn n_ubatch(&self) -> u32 {
        (self.n_batch / 2).max(1)
    }

    /// Parse a JSON patch and apply it.
    ///
    /// Either every recognized key is applied or, on any parse or type error,
    /// nothing is.
    pub fn apply_json(&mut self, json: &str) -> Result<()> {
        let patch: ConfigPatch =
            serde_json::from_str(json).map_err(|e| BridgeError::ConfigParse(e.to_string()))?;
        patch.validate()?;
        patch.apply_to(self);
        debug!(
            n_threads = self.n_threads,
            n_ctx = self.n_ctx,
            n_batch = self.n_batch,
            img_max_tokens = self.img_max_tokens,
            "Config applied"
        );
        Ok(())
    }

    /// Load a JSON patch file over the defaults, falling back to defaults if the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = EngineConfig::default();
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            config.apply_json(&data)?;
        } else {
            warn!("Config file not found at {:?}, using defaults", path);
        }
        Ok(config)
    }
}

/// A partial configuration update. Unknown keys are ignored; a recognized
/// key must carry a value of its type, so `null` is rejected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    #[serde(default, deserialize_with = "present")]
    pub n_threads: Option<i32>,
    #[serde(default, deserialize_with = "present")]
    pub n_threads_batch: Option<i32>,
    #[serde(default, deserialize_with = "present")]
    pub n_ctx: Option<u32>,
    #[serde(default, deserialize_with = "present")]
    pub n_batch: Option<u32>,
    #[serde(default, deserialize_with = "present")]
    pub img_max_tokens: Option<i32>,
    #[serde(default, deserialize_with = "present")]
    pub kv_quant: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub max_tokens: Option<usize>,
}

/// A key that is present must hold a `T`; absence is handled by `default`.
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl ConfigPatch {
    fn validate(&self) -> Result<()> {
        let positive = [
            ("n_threads", self.n_threads.map(i64::from)),
            ("n_threads_batch", self.n_threads_batch.map(i64::from)),
            ("n_ctx", self.n_ctx.map(i64::from)),
            ("n_batch", self.n_batch.map(i64::from)),
            ("img_max_tokens", self.img_max_tokens.map(i64::from)),
        ];
        for (key, value) in positive {
            if let Some(v) = value {
                if v <= 0 {
                    return Err(BridgeError::ConfigParse(format!(
                        "{key} must be positive, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn apply_to(self, config: &mut EngineConfig) {
        if let Some(v) = self.n_threads {
            config.n_threads = v;
        }
        if let Some(v) = self.n_threads_batch {
            config.n_threads_batch = Some(v);
        }
        if let Some(v) = self.n_ctx {
            config.n_ctx = v;
        }
        if let Some(v) = self.n_batch {
            config.n_batch = v;
        }
        if let Some(v) = self.img_max_tokens {
            config.img_max_tokens = v;
        }
        if let Some(v) = self.kv_quant {
            config.kv_quant = v;
        }
        if let Some(v) = self.max_tokens {
            config.max_tokens = if v == 0 { DEFAULT_MAX_TOKENS } else { v };
        }
    }
}

/// Settings for the five-stage sampler chain:
/// penalties, top-k, top-p, temperature, seeded draw.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// How many recent tokens the repetition penalty looks at.
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    pub top_k: i32,
    pub top_p: f32,
    /// Minimum candidates kept by top-p.
    pub min_keep: usize,
    pub temperature: f32,
    /// Seed for the final draw. `None` seeds from the wall clock.
    pub seed: Option<u32>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            penalty_last_n: 64,
            penalty_repeat: 1.45,
            penalty_freq: 0.4,
            penalty_present: 0.4,
            top_k: 40,
            top_p: 0.95,
            min_keep: 1,
            temperature: 0.7,
            seed: None,
        }
    }
}

impl SamplerConfig {
    /// The seed for the final draw.
    pub fn seed(&self) -> u32 {
        match self.seed {
            Some(seed) => seed,
            None => std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0),
        }
    }
}
