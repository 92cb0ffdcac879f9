//! Llama 3 inference over quantized GGUF checkpoints.
//!
//! The crate memory-maps a GGUF file, views its F32, Q4_0 and Q8_0 tensors in place, runs the
//! decoder forward pass on the CPU and drives sampling loops for single prompts and chat sessions.

pub mod chat;
mod configuration;
pub mod generation;
pub mod gguf;
pub mod layers;
pub mod models;
pub mod sampler;
mod simd;
pub mod tensor;
pub mod tokenizer;
mod utils;

use anyhow::Result;
use log::debug;
use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::configuration::{ModelConfig, RopeScaling, read_config};
pub use crate::generation::{
    GenerationOutput, GenerationRequest, GenerationStats, Response, generate_response, generate_tokens,
};
pub use crate::gguf::GgufFile;
pub use crate::models::{Transformer, TransformerBuilder, Transformers};
pub use crate::sampler::{Sampler, select_sampler};
pub use crate::tensor::{DotKernel, LaneWidth, QuantizedTensor};
pub use crate::tokenizer::{BpeTokenizer, Tokenizer};

use crate::generation::{run_instruct_once, run_interactive};

pub const MODE_INSTRUCT: &str = "instruct";
pub const MODE_CHAT: &str = "chat";

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub checkpoint_path: String,
    pub temperature: f32,
    pub topp: f32,
    pub ctx_length: Option<usize>,
    /// Absolute bound on positions, `None` runs up to the context length.
    pub max_tokens: Option<usize>,
    pub mode: String,
    pub prompt: Option<String>,
    pub system_prompt: Option<String>,
    pub stream: bool,
    pub echo: bool,
    pub seed: u64,
    pub kernel: DotKernel,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    checkpoint_path: Option<String>,
    temperature: Option<f32>,
    topp: Option<f32>,
    ctx_length: Option<usize>,
    max_tokens: Option<i64>,
    mode: Option<String>,
    prompt: Option<String>,
    system_prompt: Option<String>,
    stream: Option<bool>,
    echo: Option<bool>,
    seed: Option<u64>,
    kernel: Option<DotKernel>,
}

impl InferenceConfigBuilder {
    pub fn checkpoint_path(mut self, path: Option<&String>) -> Self {
        self.checkpoint_path = path.cloned();
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn topp(mut self, topp: Option<f32>) -> Self {
        self.topp = topp;
        self
    }
    pub fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    /// A negative value lets generation run until the context is full.
    pub fn max_tokens(mut self, max_tokens: Option<i64>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
    pub fn mode(mut self, mode: Option<&String>) -> Self {
        self.mode = mode.cloned();
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn system_prompt(mut self, system_prompt: Option<&String>) -> Self {
        self.system_prompt = system_prompt.cloned();
        self
    }
    pub fn stream(mut self, stream: Option<bool>) -> Self {
        self.stream = stream;
        self
    }
    pub fn echo(mut self, echo: Option<bool>) -> Self {
        self.echo = echo;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn kernel(mut self, kernel: Option<DotKernel>) -> Self {
        self.kernel = kernel;
        self
    }
    pub fn build(self) -> Result<InferenceConfig, String> {
        let temperature = self.temperature.unwrap_or(0.1);
        if temperature < 0.0 {
            return Err(format!("temperature must be non-negative, got {temperature}"));
        }

        let topp = self.topp.unwrap_or(0.95);
        if !(0.0..=1.0).contains(&topp) {
            return Err(format!("topp must be in [0, 1], got {topp}"));
        }

        let mode = self.mode.unwrap_or_else(|| {
            if self.prompt.is_some() { MODE_INSTRUCT } else { MODE_CHAT }.to_string()
        });

        Ok(InferenceConfig {
            checkpoint_path: self.checkpoint_path.ok_or("checkpoint_path is required")?,
            temperature,
            topp,
            ctx_length: self.ctx_length,
            max_tokens: match self.max_tokens.unwrap_or(512) {
                max_tokens if max_tokens < 0 => None,
                max_tokens => Some(max_tokens as usize),
            },
            mode,
            prompt: self.prompt,
            system_prompt: self.system_prompt,
            stream: self.stream.unwrap_or(true),
            echo: self.echo.unwrap_or(false),
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
            }),
            kernel: self.kernel.unwrap_or_default(),
        })
    }
}

/// Runs inference.
pub fn run_inference(inference_config: InferenceConfig) -> Result<()> {
    debug!("{inference_config:#?}");

    let file = GgufFile::open(&inference_config.checkpoint_path)?;

    // without an explicit context the KV cache only needs to hold max_tokens positions
    let transformer = TransformerBuilder::new(&file)
        .with_ctx_length(inference_config.ctx_length.or(inference_config.max_tokens))
        .with_kernel(inference_config.kernel)
        .build()?;

    debug!("{transformer:#?}");

    let tokenizer = BpeTokenizer::from_gguf(&file)?;

    let mut sampler = select_sampler(inference_config.temperature, inference_config.topp, inference_config.seed);

    // Run
    match inference_config.mode.as_str() {
        MODE_INSTRUCT => run_instruct_once(&transformer, &tokenizer, sampler.as_mut(), &inference_config),
        MODE_CHAT => run_interactive(&transformer, &tokenizer, sampler.as_mut(), &inference_config),
        _ => anyhow::bail!("Unknown mode: {inference_config:?}"),
    }
}

/// Renders the header, metadata and tensor directory of a GGUF file.
pub fn describe_model(file: &GgufFile) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "GGUF version: {}", file.version());
    let _ = writeln!(out, "Alignment: {}", file.alignment());
    let _ = writeln!(out, "Tensor data offset: {}", file.tensor_data_offset());

    let _ = writeln!(out, "Metadata ({} entries):", file.metadata().len());
    for (key, value) in file.metadata() {
        let _ = writeln!(out, "  {key} = {value}");
    }

    let _ = writeln!(out, "Tensors ({} entries):", file.tensor_infos().len());
    for info in file.tensor_infos() {
        let _ = writeln!(out, "  {} {:?} {:?} @ {}", info.name, info.ggml_type, info.dimensions, info.offset);
    }

    out
}
