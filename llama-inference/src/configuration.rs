#[cfg(test)]
#[path = "../tests/unit/configuration_test.rs"]
mod configuration_test;

use crate::gguf::GgufFile;
use anyhow::{Context, Error, Result};

const DEFAULT_RMS_NORM_EPS: f32 = 1e-5;
const DEFAULT_ROPE_THETA: f32 = 10000.0;
const ROPE_SCALED_BASENAME: &str = "Meta-Llama-3.1";
const ROPE_SCALING_TYPE: &str = "llama3";

/// Frequency scaling applied to rotary embeddings by Llama 3.1 checkpoints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeScaling {
    pub factor: f32,
    pub low_freq_factor: f32,
    pub high_freq_factor: f32,
    pub original_context_length: f32,
}

impl Default for RopeScaling {
    fn default() -> Self {
        Self { factor: 8.0, low_freq_factor: 1.0, high_freq_factor: 3.0, original_context_length: 8192.0 }
    }
}

/// Configuration struct for transformer models.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub seq_len: usize,
    pub vocab_size: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    pub rope_scaling: Option<RopeScaling>,
    pub shared_classifier: bool,
}

impl ModelConfig {
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Number of query heads sharing one key/value head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Validates the model configuration to ensure it's supported.
    pub fn validate(&self) -> Result<()> {
        let dimensions = [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("vocab_size", self.vocab_size),
            ("seq_len", self.seq_len),
        ];

        for (name, value) in dimensions {
            if value == 0 {
                anyhow::bail!("Invalid {}: must be positive, got {}", name, value);
            }
        }

        if self.n_heads % self.n_kv_heads != 0 {
            anyhow::bail!("n_heads ({}) must be a multiple of n_kv_heads ({})", self.n_heads, self.n_kv_heads);
        }
        if self.dim % self.n_heads != 0 {
            anyhow::bail!("dim ({}) must be divisible by n_heads ({})", self.dim, self.n_heads);
        }
        if self.head_dim != self.dim / self.n_heads || self.head_dim % 2 != 0 {
            anyhow::bail!("Invalid head_dim: {}", self.head_dim);
        }
        if !(self.rms_norm_eps > 0.0 && self.rope_theta > 0.0) {
            anyhow::bail!("rms_norm_eps and rope_theta must be positive");
        }

        Ok(())
    }
}

/// Hyperparameters as they are found in the file, before validation.
#[derive(Debug, Clone)]
struct Config {
    dim: usize,
    hidden_dim: usize,
    n_layers: usize,
    n_heads: usize,
    n_kv_heads: usize,
    vocab_size: usize,
    context_length: usize,
    rms_norm_eps: f32,
    rope_theta: f32,
    rope_scaling: Option<RopeScaling>,
    shared_classifier: bool,
}

impl TryFrom<Config> for ModelConfig {
    type Error = Error;

    fn try_from(config: Config) -> Result<Self> {
        let head_dim = if config.n_heads == 0 { 0 } else { config.dim / config.n_heads };

        let model_config = ModelConfig {
            dim: config.dim,
            hidden_dim: config.hidden_dim,
            n_layers: config.n_layers,
            n_heads: config.n_heads,
            n_kv_heads: config.n_kv_heads,
            head_dim,
            seq_len: config.context_length,
            vocab_size: config.vocab_size,
            rms_norm_eps: config.rms_norm_eps,
            rope_theta: config.rope_theta,
            rope_scaling: config.rope_scaling,
            shared_classifier: config.shared_classifier,
        };

        model_config.validate().context("Invalid model configuration")?;

        Ok(model_config)
    }
}

/// Reads and validates the model configuration from GGUF metadata.
///
/// Keys are looked up under the `general.architecture` prefix (for example `llama.block_count`).
/// The context length is capped by `ctx_length` when given.
pub fn read_config(file: &GgufFile, ctx_length: Option<usize>) -> Result<ModelConfig> {
    let arch = file.get_str("general.architecture")?;

    macro_rules! read_usize {
        ($suffix:literal) => {
            file.get_usize(&format!("{arch}.{}", $suffix))
                .with_context(|| format!("Failed to read {}", $suffix))?
        };
    }

    let read_f32_or = |suffix: &str, default: f32| -> Result<f32> {
        let key = format!("{arch}.{suffix}");
        match file.get(&key) {
            Some(_) => file.get_f32(&key),
            None => Ok(default),
        }
    };

    let n_heads = read_usize!("attention.head_count");
    let n_kv_heads = match file.get(&format!("{arch}.attention.head_count_kv")) {
        Some(_) => read_usize!("attention.head_count_kv"),
        None => n_heads,
    };

    let model_context_length = read_usize!("context_length");
    let context_length = ctx_length.map_or(model_context_length, |ctx| ctx.min(model_context_length));

    let config = Config {
        dim: read_usize!("embedding_length"),
        hidden_dim: read_usize!("feed_forward_length"),
        n_layers: read_usize!("block_count"),
        n_heads,
        n_kv_heads,
        vocab_size: read_vocab_size(file, arch)?,
        context_length,
        rms_norm_eps: read_f32_or("attention.layer_norm_rms_epsilon", DEFAULT_RMS_NORM_EPS)?,
        rope_theta: read_f32_or("rope.freq_base", DEFAULT_ROPE_THETA)?,
        rope_scaling: read_rope_scaling(file, arch)?,
        shared_classifier: !file.contains_tensor("output.weight"),
    };

    config.try_into()
}

fn read_vocab_size(file: &GgufFile, arch: &str) -> Result<usize> {
    if let Some(tokens) = file.get("tokenizer.ggml.tokens").and_then(|value| value.as_array()) {
        return Ok(tokens.len());
    }

    let key = format!("{arch}.vocab_size");
    if file.get(&key).is_some() {
        return file.get_usize(&key);
    }

    file.tensor_info("token_embd.weight")
        .and_then(|info| info.dimensions.get(1).copied())
        .context("Cannot determine vocabulary size")
}

fn read_rope_scaling(file: &GgufFile, arch: &str) -> Result<Option<RopeScaling>> {
    let by_name = file
        .get("general.basename")
        .and_then(|v| v.as_str())
        .is_some_and(|name| name.starts_with(ROPE_SCALED_BASENAME));
    let by_type = file
        .get(&format!("{arch}.rope.scaling.type"))
        .and_then(|v| v.as_str())
        .is_some_and(|kind| kind == ROPE_SCALING_TYPE);

    if !by_name && !by_type {
        return Ok(None);
    }

    let defaults = RopeScaling::default();
    let read_or = |suffix: &str, default: f32| -> Result<f32> {
        let key = format!("{arch}.rope.scaling.{suffix}");
        match file.get(&key) {
            Some(value) => value
                .as_f32()
                .or_else(|| value.as_u64().map(|v| v as f32))
                .with_context(|| format!("Metadata '{key}' is not a number")),
            None => Ok(default),
        }
    };

    Ok(Some(RopeScaling {
        factor: read_or("factor", defaults.factor)?,
        low_freq_factor: read_or("low_freq_factor", defaults.low_freq_factor)?,
        high_freq_factor: read_or("high_freq_factor", defaults.high_freq_factor)?,
        original_context_length: read_or("original_context_length", defaults.original_context_length)?,
    }))
}
