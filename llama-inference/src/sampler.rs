#[cfg(test)]
#[path = "../tests/unit/sampler_test.rs"]
mod sampler_test;

use crate::tensor::{argmax, softmax_in_place};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Picks the next token from a logits (or probabilities) buffer, which it may overwrite.
pub trait Sampler {
    fn sample(&mut self, logits: &mut [f32]) -> usize;
}

impl<F> Sampler for F
where
    F: FnMut(&mut [f32]) -> usize,
{
    fn sample(&mut self, logits: &mut [f32]) -> usize {
        self(logits)
    }
}

/// Xorshift-based random number generator.
#[derive(Debug, Clone)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    pub fn new(seed: u64) -> Self {
        // an all-zero state would only ever produce zeros
        let state = if seed == 0 { 0x2545_F491_4F6C_DD1D } else { seed };
        Self { state }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        (self.state.wrapping_mul(0x2545F4914F6CDD1D) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16777216.0
    }
}

/// Greedy decoding: the index of the maximum logit, lowest index on ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArgmaxSampler;

impl Sampler for ArgmaxSampler {
    fn sample(&mut self, logits: &mut [f32]) -> usize {
        argmax(logits)
    }
}

/// Multinomial sampling from a probability distribution.
#[derive(Debug, Clone)]
pub struct CategoricalSampler {
    rng: XorShiftRng,
}

impl CategoricalSampler {
    pub fn new(rng: XorShiftRng) -> Self {
        Self { rng }
    }

    /// Smallest index whose cumulative probability exceeds `coin`, the last index if none does.
    pub fn sample_with_coin(probabilities: &[f32], coin: f32) -> usize {
        let mut cdf = 0.0;
        for (i, &prob) in probabilities.iter().enumerate() {
            cdf += prob;
            if coin < cdf {
                return i;
            }
        }
        probabilities.len().saturating_sub(1)
    }
}

impl Sampler for CategoricalSampler {
    fn sample(&mut self, logits: &mut [f32]) -> usize {
        let coin = self.rng.next_f32();
        Self::sample_with_coin(logits, coin)
    }
}

/// Stores a probability and its associated index (token id).
#[derive(Clone, Copy, Debug)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: usize,
}

impl PartialEq for ProbIndex {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ProbIndex {}

impl PartialOrd for ProbIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProbIndex {
    /// Higher probability first, then the lower index.
    fn cmp(&self, other: &Self) -> Ordering {
        self.prob.total_cmp(&other.prob).then_with(|| other.index.cmp(&self.index))
    }
}

/// Top-p (nucleus) sampling: sample from the smallest set of tokens whose cumulative probability exceeds `topp`.
#[derive(Debug, Clone)]
pub struct NucleusSampler {
    topp: f32,
    rng: XorShiftRng,
    heap: BinaryHeap<ProbIndex>,
    retained: Vec<ProbIndex>,
}

impl NucleusSampler {
    pub fn new(topp: f32, rng: XorShiftRng) -> Self {
        debug_assert!(topp > 0.0 && topp < 1.0, "Top-p must be in (0, 1), got {topp}");
        Self { topp, rng, heap: BinaryHeap::new(), retained: Vec::new() }
    }

    pub fn sample_with_coin(&mut self, probabilities: &[f32], coin: f32) -> usize {
        // values smaller than (1 - topp) / (n - 1) cannot be part of the result
        let cutoff = (1.0 - self.topp) / (probabilities.len().saturating_sub(1).max(1)) as f32;

        self.heap.clear();
        self.heap.extend(
            probabilities
                .iter()
                .enumerate()
                .filter(|&(_, &prob)| prob >= cutoff)
                .map(|(index, &prob)| ProbIndex { prob, index }),
        );

        if self.heap.is_empty() {
            return argmax(probabilities);
        }

        self.retained.clear();
        let mut cumulative_prob = 0.0;
        while let Some(candidate) = self.heap.pop() {
            cumulative_prob += candidate.prob;
            self.retained.push(candidate);
            if cumulative_prob > self.topp {
                break;
            }
        }

        let r = coin * cumulative_prob;
        let mut cdf = 0.0;
        for candidate in &self.retained {
            cdf += candidate.prob;
            if r < cdf {
                return candidate.index;
            }
        }

        // rounding errors
        self.retained.last().map_or_else(|| argmax(probabilities), |last| last.index)
    }
}

impl Sampler for NucleusSampler {
    fn sample(&mut self, logits: &mut [f32]) -> usize {
        let coin = self.rng.next_f32();
        self.sample_with_coin(logits, coin)
    }
}

/// Applies temperature scaling and softmax before delegating to a probability sampler.
#[derive(Debug, Clone)]
pub struct TemperatureSampler<S> {
    temperature: f32,
    inner: S,
}

impl<S: Sampler> TemperatureSampler<S> {
    pub fn new(temperature: f32, inner: S) -> Self {
        debug_assert!(temperature > 0.0, "Temperature must be positive, got {temperature}");
        Self { temperature, inner }
    }
}

impl<S: Sampler> Sampler for TemperatureSampler<S> {
    fn sample(&mut self, logits: &mut [f32]) -> usize {
        let temperature = self.temperature;
        logits.iter_mut().for_each(|logit| *logit /= temperature);
        softmax_in_place(logits);

        self.inner.sample(logits)
    }
}

/// Builds the sampler for the given temperature and top-p.
///
/// - If temperature is 0, returns the argmax (greedy).
/// - Otherwise applies temperature scaling and softmax, then top-p when `0 < topp < 1`,
///   plain multinomial sampling when not.
pub fn select_sampler(temperature: f32, topp: f32, seed: u64) -> Box<dyn Sampler> {
    if temperature == 0.0 {
        return Box::new(ArgmaxSampler);
    }

    let rng = XorShiftRng::new(seed);
    if topp <= 0.0 || topp >= 1.0 {
        Box::new(TemperatureSampler::new(temperature, CategoricalSampler::new(rng)))
    } else {
        Box::new(TemperatureSampler::new(temperature, NucleusSampler::new(topp, rng)))
    }
}
