#[cfg(test)]
#[path = "../tests/unit/layers_test.rs"]
mod layers_test;

use crate::configuration::{ModelConfig, RopeScaling};
use crate::tensor::{
    DotKernel, QuantizedTensor, add_in_place, map_in_place, matmul, multiply_in_place, saxpy_in_place,
    softmax_in_place, sum_of_squares,
};
use rayon::prelude::*;
use std::borrow::Cow;
use std::f64::consts::PI;

/// Token embedding layer - converts token IDs to dense vectors
///
/// **Shape**: [vocab_size, embedding_dim]
/// **Note**: Rows are decoded on lookup, so a quantized table is never expanded in memory.
pub struct TokenEmbedding<'a> {
    pub embedding_table: QuantizedTensor<'a>,
    pub dim: usize,
}

impl<'a> TokenEmbedding<'a> {
    pub fn new(embedding_table: QuantizedTensor<'a>, dim: usize) -> Self {
        Self { embedding_table, dim }
    }

    pub fn forward(&self, token: usize, output: &mut [f32]) {
        self.embedding_table.copy_to(token * self.dim, &mut output[..self.dim]);
    }
}

impl std::fmt::Debug for TokenEmbedding<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEmbedding")
            .field("dim", &self.dim)
            .field("vocab_size", &(self.embedding_table.size() / self.dim))
            .field("type", &self.embedding_table.ggml_type())
            .finish()
    }
}

/// RMS Layer Normalization
///
/// **Mathematical Formula**:
/// ```text
/// RMSNorm(x) = x / RMS(x) * γ
/// where RMS(x) = sqrt(mean(x²) + ε)
/// ```
pub struct RMSNorm<'a> {
    pub weight: Cow<'a, [f32]>,
    pub eps: f32,
}

impl<'a> RMSNorm<'a> {
    pub fn new(weight: Cow<'a, [f32]>, eps: f32) -> Self {
        Self { weight, eps }
    }

    fn scale(&self, input: &[f32]) -> f32 {
        1.0f32 / ((sum_of_squares(input) / input.len() as f32) + self.eps).sqrt()
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        debug_assert_eq!(output.len(), input.len());
        debug_assert_eq!(input.len(), self.weight.len());

        let rms_norm_factor = self.scale(input);

        output.iter_mut().zip(input.iter()).zip(self.weight.iter()).for_each(|((out, &inp), &w)| {
            *out = w * (rms_norm_factor * inp);
        });
    }

    pub fn forward_inplace(&self, x: &mut [f32]) {
        debug_assert_eq!(x.len(), self.weight.len());

        let rms_norm_factor = self.scale(x);

        x.iter_mut().zip(self.weight.iter()).for_each(|(val, &w)| {
            *val = w * (rms_norm_factor * *val);
        });
    }
}

impl std::fmt::Debug for RMSNorm<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RMSNorm").field("dim", &self.weight.len()).field("eps", &self.eps).finish()
    }
}

/// Rotary Position Embedding (RoPE) with precomputed tables
///
/// Adjacent pairs `(i, i + 1)` of each head are rotated by `pos * freq(i)`. Cosines and sines for
/// every position are stored flat at `pos * (head_dim / 2) + i / 2`.
pub struct RotaryEmbedding {
    pub head_dim: usize,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RotaryEmbedding {
    pub fn new(seq_len: usize, head_dim: usize, theta: f32, scaling: Option<&RopeScaling>) -> Self {
        debug_assert_eq!(head_dim % 2, 0);

        let freqs = (0..head_dim).step_by(2).map(|i| Self::frequency(i, head_dim, theta, scaling)).collect::<Vec<_>>();

        let (cos, sin): (Vec<f32>, Vec<f32>) = (0..seq_len)
            .flat_map(|pos| {
                freqs.iter().map(move |&freq| {
                    let angle = pos as f32 * freq;
                    (angle.cos(), angle.sin())
                })
            })
            .unzip();

        Self { head_dim, cos, sin }
    }

    /// Rotation frequency of the pair starting at even dimension `i`.
    pub fn frequency(i: usize, head_dim: usize, theta: f32, scaling: Option<&RopeScaling>) -> f32 {
        let freq = (1.0 / (theta as f64).powf(i as f64 / head_dim as f64)) as f32;

        let Some(scaling) = scaling else {
            return freq;
        };

        let low_freq_wavelen = scaling.original_context_length / scaling.low_freq_factor;
        let high_freq_wavelen = scaling.original_context_length / scaling.high_freq_factor;
        let wavelen = (2.0 * PI / freq as f64) as f32;

        if wavelen < high_freq_wavelen {
            freq
        } else if wavelen > low_freq_wavelen {
            freq / scaling.factor
        } else {
            let smooth = (scaling.original_context_length / wavelen - scaling.low_freq_factor)
                / (scaling.high_freq_factor - scaling.low_freq_factor);
            (1.0 - smooth) * freq / scaling.factor + smooth * freq
        }
    }

    pub fn cos_sin(&self, pos: usize, pair: usize) -> (f32, f32) {
        let idx = pos * (self.head_dim / 2) + pair;
        (self.cos[idx], self.sin[idx])
    }

    /// Rotates every head of `q` and, where in range, of `k` for position `pos`.
    pub fn rotate(&self, q: &mut [f32], k: &mut [f32], pos: usize) {
        debug_assert!(k.len() <= q.len());

        for i in (0..q.len()).step_by(2) {
            let (fcr, fci) = self.cos_sin(pos, (i % self.head_dim) / 2);

            rotate_pair(&mut q[i..i + 2], fcr, fci);
            if i < k.len() {
                rotate_pair(&mut k[i..i + 2], fcr, fci);
            }
        }
    }
}

#[inline]
fn rotate_pair(pair: &mut [f32], fcr: f32, fci: f32) {
    let (v0, v1) = (pair[0], pair[1]);
    pair[0] = v0 * fcr - v1 * fci;
    pair[1] = v0 * fci + v1 * fcr;
}

impl std::fmt::Debug for RotaryEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotaryEmbedding")
            .field("head_dim", &self.head_dim)
            .field("positions", &(self.cos.len() / (self.head_dim / 2).max(1)))
            .finish()
    }
}

/// Linear layer over a possibly quantized weight matrix, rows of `in_features` elements.
pub struct Linear<'a> {
    pub weight: QuantizedTensor<'a>,
    pub in_features: usize,
    pub out_features: usize,
    pub kernel: DotKernel,
}

impl<'a> Linear<'a> {
    pub fn new(weight: QuantizedTensor<'a>, in_features: usize, out_features: usize, kernel: DotKernel) -> Self {
        Self { weight, in_features, out_features, kernel }
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        matmul(&self.weight, input, output, self.out_features, self.in_features, self.kernel);
    }
}

impl std::fmt::Debug for Linear<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .field("type", &self.weight.ggml_type())
            .field("kernel", &self.kernel)
            .finish()
    }
}

/// Multi-Head Attention with Grouped Query Attention (GQA)
///
/// `n_heads` query heads share `n_kv_heads` key/value heads; query head `h` reads the cached
/// keys and values of head `h / kv_mul`.
///
/// **Attention Formula**:
/// ```text
/// Attention(Q,K,V) = softmax(QK^T / √d_k)V
/// ```
pub struct MultiHeadAttention<'a> {
    pub wq: Linear<'a>,
    pub wk: Linear<'a>,
    pub wv: Linear<'a>,
    pub wo: Linear<'a>,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub kv_mul: usize,
    pub seq_len: usize,
}

impl<'a> MultiHeadAttention<'a> {
    pub fn new(wq: Linear<'a>, wk: Linear<'a>, wv: Linear<'a>, wo: Linear<'a>, config: &ModelConfig) -> Self {
        Self {
            wq,
            wk,
            wv,
            wo,
            n_heads: config.n_heads,
            n_kv_heads: config.n_kv_heads,
            head_dim: config.head_dim,
            kv_mul: config.kv_mul(),
            seq_len: config.seq_len,
        }
    }

    /// Attends from the normalized input in `state.xb`, leaving the per-head outputs in `state.xb`.
    pub fn forward(&self, pos: usize, layer_idx: usize, rope: &RotaryEmbedding, state: &mut InferenceState) {
        debug_assert!(pos < self.seq_len);
        let kv_dim = self.n_kv_heads * self.head_dim;

        self.wq.forward(&mut state.q, &state.xb);
        self.wk.forward(&mut state.k, &state.xb);
        self.wv.forward(&mut state.v, &state.xb);

        rope.rotate(&mut state.q, &mut state.k, pos);

        let slot = pos * kv_dim..(pos + 1) * kv_dim;
        state.key_cache[layer_idx][slot.clone()].copy_from_slice(&state.k);
        state.value_cache[layer_idx][slot].copy_from_slice(&state.v);

        self.compute_attention(pos, layer_idx, state);
    }

    fn compute_attention(&self, pos: usize, layer_idx: usize, state: &mut InferenceState) {
        let attention_scale = (self.head_dim as f32).sqrt().recip();
        let kv_dim = self.n_kv_heads * self.head_dim;
        let key_cache = &state.key_cache[layer_idx];
        let value_cache = &state.value_cache[layer_idx];
        let q = &state.q;

        state.att.par_chunks_mut(self.seq_len).zip(state.xb.par_chunks_mut(self.head_dim)).enumerate().for_each(
            |(head_idx, (att_slice, xb_slice))| {
                let q_head = &q[head_idx * self.head_dim..(head_idx + 1) * self.head_dim];
                let kv_head_offset = (head_idx / self.kv_mul) * self.head_dim;

                let att_head = &mut att_slice[0..=pos];

                att_head.iter_mut().enumerate().for_each(|(time_step, att_score)| {
                    let k_start = time_step * kv_dim + kv_head_offset;
                    *att_score = q_head
                        .iter()
                        .zip(&key_cache[k_start..k_start + self.head_dim])
                        .map(|(&q, &k)| q * k)
                        .sum::<f32>()
                        * attention_scale;
                });

                softmax_in_place(att_head);

                xb_slice.fill(0.0);
                for (time_step, &attention_weight) in att_head.iter().enumerate() {
                    let v_start = time_step * kv_dim + kv_head_offset;

                    saxpy_in_place(xb_slice, &value_cache[v_start..v_start + self.head_dim], attention_weight);
                }
            },
        );
    }
}

impl std::fmt::Debug for MultiHeadAttention<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("n_heads", &self.n_heads)
            .field("n_kv_heads", &self.n_kv_heads)
            .field("head_dim", &self.head_dim)
            .field("wq", &self.wq)
            .field("wk", &self.wk)
            .field("wv", &self.wv)
            .field("wo", &self.wo)
            .finish()
    }
}

/// Feed-Forward Network with SwiGLU activation
///
/// ```text
/// FFN(x) = W2 · (SiLU(W1·x) ⊙ (W3·x))
/// ```
pub struct FeedForward<'a> {
    pub w1: Linear<'a>, // Gate projection
    pub w2: Linear<'a>, // Down projection
    pub w3: Linear<'a>, // Up projection
}

impl<'a> FeedForward<'a> {
    pub fn new(w1: Linear<'a>, w2: Linear<'a>, w3: Linear<'a>) -> Self {
        Self { w1, w2, w3 }
    }

    /// Reads the normalized input from `state.xb` and writes the projection into `state.xb2`.
    pub fn forward(&self, state: &mut InferenceState) {
        self.w1.forward(&mut state.hb, &state.xb);
        self.w3.forward(&mut state.hb2, &state.xb);

        // SiLU(w1(x)) * w3(x)
        map_in_place(&mut state.hb, |gate| gate * (1.0f32 + (-gate).exp()).recip());
        multiply_in_place(&mut state.hb, &state.hb2);

        self.w2.forward(&mut state.xb2, &state.hb);
    }
}

impl std::fmt::Debug for FeedForward<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward")
            .field("hidden_dim", &self.w1.out_features)
            .field("w1", &self.w1)
            .field("w2", &self.w2)
            .field("w3", &self.w3)
            .finish()
    }
}

/// Adds the residual branch in `state.xb2` to the stream.
pub(crate) fn add_residual(state: &mut InferenceState) {
    add_in_place(&mut state.x, &state.xb2);
}

/// Per-session state for transformer inference.
///
/// Buffers are pre-allocated from the model configuration; the key/value caches grow
/// logically with the position but never reallocate.
#[derive(Debug)]
pub struct InferenceState {
    /// Residual stream
    /// Shape: [dim]
    pub x: Vec<f32>,

    /// Normalized input of the current sublayer, later the attention output
    /// Shape: [dim]
    pub xb: Vec<f32>,

    /// Output of the current sublayer before the residual add
    /// Shape: [dim]
    pub xb2: Vec<f32>,

    /// Hidden state buffer for feed-forward computations
    /// Shape: [hidden_dim]
    pub hb: Vec<f32>,

    /// Secondary hidden buffer for FFN gate operations
    /// Shape: [hidden_dim]
    pub hb2: Vec<f32>,

    /// Shape: [dim]
    pub q: Vec<f32>,
    /// Shape: [n_kv_heads * head_dim]
    pub k: Vec<f32>,
    /// Shape: [n_kv_heads * head_dim]
    pub v: Vec<f32>,

    /// Attention scores
    /// Shape: [n_heads, seq_len]
    pub att: Vec<f32>,

    /// Output logits over vocabulary
    /// Shape: [vocab_size]
    pub logits: Vec<f32>,

    /// Keys per layer: [n_layers] × [seq_len, n_kv_heads * head_dim]
    pub key_cache: Vec<Vec<f32>>,
    /// Values per layer: [n_layers] × [seq_len, n_kv_heads * head_dim]
    pub value_cache: Vec<Vec<f32>>,

    /// Last token fed into or produced by the model.
    pub latest_token: usize,
}

impl InferenceState {
    pub fn new(config: &ModelConfig) -> Self {
        let ModelConfig { dim, hidden_dim, n_layers, n_heads, vocab_size, seq_len, .. } = *config;
        let kv_dim = config.kv_dim();

        Self {
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            xb2: vec![0.0; dim],
            hb: vec![0.0; hidden_dim],
            hb2: vec![0.0; hidden_dim],
            q: vec![0.0; dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; n_heads * seq_len],
            logits: vec![0.0; vocab_size],
            key_cache: (0..n_layers).map(|_| vec![0.0; seq_len * kv_dim]).collect(),
            value_cache: (0..n_layers).map(|_| vec![0.0; seq_len * kv_dim]).collect(),
            latest_token: 0,
        }
    }
}
