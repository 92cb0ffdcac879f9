use crate::{
    configuration::{ModelConfig, read_config},
    gguf::GgufFile,
    layers::InferenceState,
    tensor::DotKernel,
};
use anyhow::Result;
use log::debug;

mod llama;

pub use llama::{LlamaLayerWeights, LlamaTransformer, LlamaWeights};

/// Contains the main inference logic for the Transformer model.
///
/// Models are immutable once built; every session brings its own [`InferenceState`].
pub trait Transformer {
    /// Runs one decoder step for `token` at `pos` and returns the logits stored in `state`.
    fn forward<'s>(&self, state: &'s mut InferenceState, token: usize, pos: usize) -> &'s [f32];

    fn get_config(&self) -> &ModelConfig;

    fn new_state(&self) -> InferenceState {
        InferenceState::new(self.get_config())
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum Transformers<'a> {
    Llama(LlamaTransformer<'a>),
}

impl Transformer for Transformers<'_> {
    fn forward<'s>(&self, state: &'s mut InferenceState, token: usize, pos: usize) -> &'s [f32] {
        match self {
            Transformers::Llama(model) => model.forward(state, token, pos),
        }
    }

    fn get_config(&self) -> &ModelConfig {
        match self {
            Transformers::Llama(model) => model.get_config(),
        }
    }
}

/// Builder pattern for creating transformer models
pub struct TransformerBuilder<'a> {
    file: &'a GgufFile,
    ctx_length: Option<usize>,
    kernel: DotKernel,
}

impl<'a> TransformerBuilder<'a> {
    pub fn new(file: &'a GgufFile) -> Self {
        Self { file, ctx_length: None, kernel: DotKernel::default() }
    }

    pub fn with_ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }

    pub fn with_kernel(mut self, kernel: DotKernel) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn build(self) -> Result<Transformers<'a>> {
        let config = read_config(self.file, self.ctx_length)?;
        debug!("{config:#?}");

        match self.file.get_str("general.architecture")? {
            "llama" => Ok(Transformers::Llama(LlamaTransformer::load(config, self.file, self.kernel)?)),
            x => anyhow::bail!("Unknown architecture: {x}"),
        }
    }
}
