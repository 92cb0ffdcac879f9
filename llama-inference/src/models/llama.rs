use crate::{
    configuration::ModelConfig, gguf::GgufFile, layers::*, models::Transformer, tensor::*, utils::LogTimer,
};
use anyhow::{Context, Result};
use std::borrow::Cow;

/// Llama decoder-only transformer over weights borrowed from a GGUF mapping.
pub struct LlamaTransformer<'a> {
    config: ModelConfig,
    token_embedding: TokenEmbedding<'a>,
    blocks: Vec<LlamaTransformerBlock<'a>>,
    final_norm: RMSNorm<'a>,
    lm_head: Linear<'a>,
    rope: RotaryEmbedding,
}

impl<'a> LlamaTransformer<'a> {
    /// Loads weights named after the GGUF llama convention (`blk.{i}.attn_q.weight`, ...).
    pub fn load(config: ModelConfig, file: &'a GgufFile, kernel: DotKernel) -> Result<Self> {
        let _timer = LogTimer::new("Load weights");
        let weights = LlamaWeights::load(file, &config)?;

        Self::new(config, weights, kernel)
    }

    pub fn new(config: ModelConfig, weights: LlamaWeights<'a>, kernel: DotKernel) -> Result<Self> {
        config.validate().context("Invalid model configuration")?;
        weights.validate(&config).context("Weights do not match the model configuration")?;

        let LlamaWeights { token_embedding_table, layers, rms_final_weight, wcls } = weights;

        let blocks = layers
            .into_iter()
            .enumerate()
            .map(|(layer_idx, layer)| create_transformer_block(&config, layer_idx, layer, kernel))
            .collect();

        let final_norm = RMSNorm::new(rms_final_weight, config.rms_norm_eps);
        let lm_head = Linear::new(wcls, config.dim, config.vocab_size, kernel);
        let token_embedding = TokenEmbedding::new(token_embedding_table, config.dim);
        let rope =
            RotaryEmbedding::new(config.seq_len, config.head_dim, config.rope_theta, config.rope_scaling.as_ref());

        Ok(Self { config, token_embedding, blocks, final_norm, lm_head, rope })
    }
}

impl Transformer for LlamaTransformer<'_> {
    fn forward<'s>(&self, state: &'s mut InferenceState, token: usize, pos: usize) -> &'s [f32] {
        debug_assert!(token < self.config.vocab_size);
        debug_assert!(pos < self.config.seq_len);

        self.token_embedding.forward(token, &mut state.x);

        for block in &self.blocks {
            block.forward(pos, &self.rope, state);
        }

        self.final_norm.forward_inplace(&mut state.x);
        self.lm_head.forward(&mut state.logits, &state.x);

        &state.logits
    }

    fn get_config(&self) -> &ModelConfig {
        &self.config
    }
}

impl std::fmt::Debug for LlamaTransformer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct BlocksSummary<'a, T>(&'a [T]);

        impl<'a, T: std::fmt::Debug> std::fmt::Debug for BlocksSummary<'a, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_list()
                    .entries(self.0.iter().take(1))
                    .entry(&format_args!("... and {} more", self.0.len().saturating_sub(1)))
                    .finish()
            }
        }

        f.debug_struct("LlamaTransformer")
            .field("config", &self.config)
            .field("token_embedding", &self.token_embedding)
            .field("blocks", &BlocksSummary(&self.blocks))
            .field("final_norm", &self.final_norm)
            .field("lm_head", &self.lm_head)
            .field("rope", &self.rope)
            .finish()
    }
}

/// Transformer Block - decoder layer combining self-attention and feed-forward
pub struct LlamaTransformerBlock<'a> {
    pub attn_norm: RMSNorm<'a>,
    pub attention: MultiHeadAttention<'a>,
    pub ffn_norm: RMSNorm<'a>,
    pub feed_forward: FeedForward<'a>,
    pub layer_idx: usize,
}

impl LlamaTransformerBlock<'_> {
    fn forward(&self, pos: usize, rope: &RotaryEmbedding, state: &mut InferenceState) {
        // Attention block with residual connection
        self.attn_norm.forward(&mut state.xb, &state.x);
        self.attention.forward(pos, self.layer_idx, rope, state);
        self.attention.wo.forward(&mut state.xb2, &state.xb);
        add_residual(state);

        // Feed-forward block with residual connection
        self.ffn_norm.forward(&mut state.xb, &state.x);
        self.feed_forward.forward(state);
        add_residual(state);
    }
}

impl std::fmt::Debug for LlamaTransformerBlock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerBlock")
            .field("layer_idx", &self.layer_idx)
            .field("attn_norm", &self.attn_norm)
            .field("attention", &self.attention)
            .field("ffn_norm", &self.ffn_norm)
            .field("feed_forward", &self.feed_forward)
            .finish()
    }
}

fn create_transformer_block<'a>(
    config: &ModelConfig,
    layer_idx: usize,
    layer: LlamaLayerWeights<'a>,
    kernel: DotKernel,
) -> LlamaTransformerBlock<'a> {
    let ModelConfig { dim, hidden_dim, rms_norm_eps, .. } = *config;
    let kv_dim = config.kv_dim();

    let wq = Linear::new(layer.wq, dim, dim, kernel);
    let wk = Linear::new(layer.wk, dim, kv_dim, kernel);
    let wv = Linear::new(layer.wv, dim, kv_dim, kernel);
    let wo = Linear::new(layer.wo, dim, dim, kernel);

    let w1 = Linear::new(layer.w1, dim, hidden_dim, kernel);
    let w2 = Linear::new(layer.w2, hidden_dim, dim, kernel);
    let w3 = Linear::new(layer.w3, dim, hidden_dim, kernel);

    LlamaTransformerBlock {
        attn_norm: RMSNorm::new(layer.attn_norm, rms_norm_eps),
        attention: MultiHeadAttention::new(wq, wk, wv, wo, config),
        ffn_norm: RMSNorm::new(layer.ffn_norm, rms_norm_eps),
        feed_forward: FeedForward::new(w1, w2, w3),
        layer_idx,
    }
}

/// Learned parameters of one decoder layer.
#[derive(Debug, Clone)]
pub struct LlamaLayerWeights<'a> {
    /// Shape: [dim]
    pub attn_norm: Cow<'a, [f32]>,
    /// Query projection: [dim, dim]
    pub wq: QuantizedTensor<'a>,
    /// Key projection: [kv_dim, dim]
    pub wk: QuantizedTensor<'a>,
    /// Value projection: [kv_dim, dim]
    pub wv: QuantizedTensor<'a>,
    /// Output projection: [dim, dim]
    pub wo: QuantizedTensor<'a>,
    /// Shape: [dim]
    pub ffn_norm: Cow<'a, [f32]>,
    /// Gate projection: [hidden_dim, dim]
    pub w1: QuantizedTensor<'a>,
    /// Down projection: [dim, hidden_dim]
    pub w2: QuantizedTensor<'a>,
    /// Up projection: [hidden_dim, dim]
    pub w3: QuantizedTensor<'a>,
}

/// Contains all the learned parameters for the transformer model.
#[derive(Debug, Clone)]
pub struct LlamaWeights<'a> {
    /// Shape: [vocab_size, dim]
    pub token_embedding_table: QuantizedTensor<'a>,
    pub layers: Vec<LlamaLayerWeights<'a>>,
    /// Shape: [dim]
    pub rms_final_weight: Cow<'a, [f32]>,
    /// Classification head, tied to the embedding table when the file has no `output.weight`
    /// Shape: [vocab_size, dim]
    pub wcls: QuantizedTensor<'a>,
}

impl<'a> LlamaWeights<'a> {
    pub fn load(file: &'a GgufFile, config: &ModelConfig) -> Result<Self> {
        let token_embedding_table = file.tensor("token_embd.weight")?;

        let layers = (0..config.n_layers)
            .map(|i| {
                let tensor = |name: &str| file.tensor(&format!("blk.{i}.{name}.weight"));
                let dense = |name: &str| file.dense_tensor(&format!("blk.{i}.{name}.weight"));

                Ok(LlamaLayerWeights {
                    attn_norm: dense("attn_norm")?,
                    wq: tensor("attn_q")?,
                    wk: tensor("attn_k")?,
                    wv: tensor("attn_v")?,
                    wo: tensor("attn_output")?,
                    ffn_norm: dense("ffn_norm")?,
                    w1: tensor("ffn_gate")?,
                    w2: tensor("ffn_down")?,
                    w3: tensor("ffn_up")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let rms_final_weight = file.dense_tensor("output_norm.weight")?;

        let wcls = if config.shared_classifier {
            token_embedding_table.clone()
        } else {
            file.tensor("output.weight")?
        };

        Ok(Self { token_embedding_table, layers, rms_final_weight, wcls })
    }

    /// Checks that every tensor holds exactly the number of elements the configuration implies.
    pub fn validate(&self, config: &ModelConfig) -> Result<()> {
        let ModelConfig { dim, hidden_dim, vocab_size, n_layers, .. } = *config;
        let kv_dim = config.kv_dim();

        if self.layers.len() != n_layers {
            anyhow::bail!("Expected {n_layers} layers, got {}", self.layers.len());
        }

        let check = |name: String, actual: usize, expected: usize| -> Result<()> {
            if actual != expected {
                anyhow::bail!("Tensor '{name}' has {actual} elements, expected {expected}");
            }
            Ok(())
        };

        check("token_embd".to_string(), self.token_embedding_table.size(), vocab_size * dim)?;
        check("output_norm".to_string(), self.rms_final_weight.len(), dim)?;
        check("output".to_string(), self.wcls.size(), vocab_size * dim)?;

        for (i, layer) in self.layers.iter().enumerate() {
            check(format!("blk.{i}.attn_norm"), layer.attn_norm.len(), dim)?;
            check(format!("blk.{i}.attn_q"), layer.wq.size(), dim * dim)?;
            check(format!("blk.{i}.attn_k"), layer.wk.size(), kv_dim * dim)?;
            check(format!("blk.{i}.attn_v"), layer.wv.size(), kv_dim * dim)?;
            check(format!("blk.{i}.attn_output"), layer.wo.size(), dim * dim)?;
            check(format!("blk.{i}.ffn_norm"), layer.ffn_norm.len(), dim)?;
            check(format!("blk.{i}.ffn_gate"), layer.w1.size(), hidden_dim * dim)?;
            check(format!("blk.{i}.ffn_down"), layer.w2.size(), dim * hidden_dim)?;
            check(format!("blk.{i}.ffn_up"), layer.w3.size(), hidden_dim * dim)?;
        }

        Ok(())
    }
}
