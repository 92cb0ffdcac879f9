#[cfg(test)]
#[path = "../tests/unit/tensor_test.rs"]
mod tensor_test;

use crate::gguf::GgmlType;
use crate::simd;
use half::f16;
use rayon::prelude::*;
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// Elements per quantization block.
pub const QK: usize = 32;

const SCALE_BYTES: usize = 2;
const Q4_0_BLOCK_BYTES: usize = SCALE_BYTES + QK / 2;
const Q8_0_BLOCK_BYTES: usize = SCALE_BYTES + QK;

/// Register width used by the vectorized dot product.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LaneWidth {
    Lanes128,
    #[default]
    Lanes256,
}

/// Selects the dot-product implementation used by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DotKernel {
    Scalar,
    Vector(LaneWidth),
}

impl Default for DotKernel {
    fn default() -> Self {
        DotKernel::Vector(LaneWidth::default())
    }
}

impl FromStr for DotKernel {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "scalar" => Ok(DotKernel::Scalar),
            "simd128" => Ok(DotKernel::Vector(LaneWidth::Lanes128)),
            "simd256" => Ok(DotKernel::Vector(LaneWidth::Lanes256)),
            other => anyhow::bail!("Unknown dot kernel: '{other}', expected scalar, simd128 or simd256"),
        }
    }
}

/// A logical float vector stored either densely or in 32-element quantized blocks.
///
/// Quantized variants borrow their blocks from the model mapping and are read-only.
#[derive(Clone)]
pub enum QuantizedTensor<'a> {
    F32(Cow<'a, [f32]>),
    Q4_0(&'a [u8]),
    Q8_0(&'a [u8]),
}

impl fmt::Debug for QuantizedTensor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            QuantizedTensor::F32(Cow::Owned(_)) => "F32 (owned)",
            QuantizedTensor::F32(Cow::Borrowed(_)) => "F32 (mapped)",
            QuantizedTensor::Q4_0(_) => "Q4_0",
            QuantizedTensor::Q8_0(_) => "Q8_0",
        };
        write!(f, "QuantizedTensor {{ type: {kind}, size: {} }}", self.size())
    }
}

impl<'a> QuantizedTensor<'a> {
    pub fn dense(values: Vec<f32>) -> Self {
        QuantizedTensor::F32(Cow::Owned(values))
    }

    pub fn zeros(size: usize) -> Self {
        Self::dense(vec![0.0; size])
    }

    pub fn ggml_type(&self) -> GgmlType {
        match self {
            QuantizedTensor::F32(_) => GgmlType::F32,
            QuantizedTensor::Q4_0(_) => GgmlType::Q4_0,
            QuantizedTensor::Q8_0(_) => GgmlType::Q8_0,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            QuantizedTensor::F32(values) => values.len(),
            QuantizedTensor::Q4_0(blocks) => blocks.len() / Q4_0_BLOCK_BYTES * QK,
            QuantizedTensor::Q8_0(blocks) => blocks.len() / Q8_0_BLOCK_BYTES * QK,
        }
    }

    pub fn get_float(&self, index: usize) -> f32 {
        debug_assert!(index < self.size());

        match self {
            QuantizedTensor::F32(values) => values[index],
            QuantizedTensor::Q4_0(blocks) => {
                let block = &blocks[index / QK * Q4_0_BLOCK_BYTES..];
                let within = index % QK;
                let packed = block[SCALE_BYTES + within % (QK / 2)];
                let nibble = if within < QK / 2 { packed & 0x0F } else { packed >> 4 };
                (nibble as i32 - 8) as f32 * block_scale(block)
            }
            QuantizedTensor::Q8_0(blocks) => {
                let block = &blocks[index / QK * Q8_0_BLOCK_BYTES..];
                (block[SCALE_BYTES + index % QK] as i8) as f32 * block_scale(block)
            }
        }
    }

    /// Writes one element; only owned dense tensors are mutable.
    pub fn set_float(&mut self, index: usize, value: f32) -> anyhow::Result<()> {
        match self {
            QuantizedTensor::F32(Cow::Owned(values)) => {
                let size = values.len();
                let slot = values
                    .get_mut(index)
                    .ok_or_else(|| anyhow::anyhow!("Index {index} is out of bounds for tensor of size {size}"))?;
                *slot = value;
                Ok(())
            }
            other => anyhow::bail!("Cannot write into a read-only {other:?}"),
        }
    }

    /// Dot product of `len` elements starting at `this_offset` with `that[that_offset..]`.
    pub fn dot(&self, this_offset: usize, that: &[f32], that_offset: usize, len: usize, kernel: DotKernel) -> f32 {
        match kernel {
            DotKernel::Scalar => self.scalar_dot(this_offset, that, that_offset, len),
            DotKernel::Vector(width) => self.vector_dot(width, this_offset, that, that_offset, len),
        }
    }

    /// Reference dot product, one element at a time.
    pub fn scalar_dot(&self, this_offset: usize, that: &[f32], that_offset: usize, len: usize) -> f32 {
        debug_assert!(this_offset + len <= self.size());
        debug_assert!(that_offset + len <= that.len());

        match self {
            QuantizedTensor::F32(values) => values[this_offset..this_offset + len]
                .iter()
                .zip(&that[that_offset..that_offset + len])
                .map(|(a, b)| a * b)
                .sum(),
            _ => (0..len).map(|j| self.get_float(this_offset + j) * that[that_offset + j]).sum(),
        }
    }

    /// Dot product over whole blocks with the SIMD block kernel for `width`, scalar at unaligned edges.
    pub fn vector_dot(
        &self,
        width: LaneWidth,
        this_offset: usize,
        that: &[f32],
        that_offset: usize,
        len: usize,
    ) -> f32 {
        debug_assert!(this_offset + len <= self.size());
        debug_assert!(that_offset + len <= that.len());

        let (blocks, block_bytes, block_dot) = match self {
            QuantizedTensor::F32(values) => {
                let this = &values[this_offset..this_offset + len];
                return simd::dense_dot(this, &that[that_offset..that_offset + len], width);
            }
            QuantizedTensor::Q4_0(blocks) => (*blocks, Q4_0_BLOCK_BYTES, simd::q4_0_kernel(width)),
            QuantizedTensor::Q8_0(blocks) => (*blocks, Q8_0_BLOCK_BYTES, simd::q8_0_kernel(width)),
        };

        let prefix = len.min(this_offset.wrapping_neg() & (QK - 1));
        let mut result = if prefix > 0 { self.scalar_dot(this_offset, that, that_offset, prefix) } else { 0.0 };

        let mut j = prefix;
        let upper = j + (len - j) / QK * QK;
        let mut acc = 0.0f32;

        while j < upper {
            let block = &blocks[(this_offset + j) / QK * block_bytes..];
            let block_sum = block_dot(&block[SCALE_BYTES..], &that[that_offset + j..that_offset + j + QK]);
            acc = block_sum.mul_add(block_scale(block), acc);
            j += QK;
        }
        result += acc;

        if j < len {
            result += self.scalar_dot(this_offset + j, that, that_offset + j, len - j);
        }

        result
    }

    /// Decodes `out.len()` elements starting at `offset`.
    pub fn copy_to(&self, offset: usize, out: &mut [f32]) {
        debug_assert!(offset + out.len() <= self.size());

        match self {
            QuantizedTensor::F32(values) => out.copy_from_slice(&values[offset..offset + out.len()]),
            _ => out.iter_mut().enumerate().for_each(|(i, value)| *value = self.get_float(offset + i)),
        }
    }
}

#[inline]
fn block_scale(block: &[u8]) -> f32 {
    f16::from_le_bytes([block[0], block[1]]).to_f32()
}

/// Computes `output[i] = weights[i * cols..][..cols] · input` for every row, in parallel.
pub fn matmul(
    weights: &QuantizedTensor,
    input: &[f32],
    output: &mut [f32],
    rows: usize,
    cols: usize,
    kernel: DotKernel,
) {
    assert!(output.len() >= rows, "Output slice length must be at least rows: {} >= {}", output.len(), rows);
    debug_assert!(input.len() >= cols);
    debug_assert!(weights.size() >= rows * cols);

    output.par_iter_mut().enumerate().take(rows).for_each(|(row, out)| {
        *out = weights.dot(row * cols, input, 0, cols, kernel);
    });
}

/// Converts logits into probabilities.
pub fn softmax_in_place(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }

    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));

    let mut sum = 0.0;
    for val in x.iter_mut() {
        *val = (*val - max_val).exp();
        sum += *val;
    }

    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        x.iter_mut().for_each(|val| *val *= inv_sum);
    }
}

/// `out += a * x`
pub fn saxpy_in_place(out: &mut [f32], x: &[f32], a: f32) {
    debug_assert_eq!(out.len(), x.len());
    out.iter_mut().zip(x).for_each(|(o, &v)| *o = a.mul_add(v, *o));
}

pub fn add_in_place(out: &mut [f32], x: &[f32]) {
    debug_assert_eq!(out.len(), x.len());
    out.iter_mut().zip(x).for_each(|(o, &v)| *o += v);
}

pub fn multiply_in_place(out: &mut [f32], x: &[f32]) {
    debug_assert_eq!(out.len(), x.len());
    out.iter_mut().zip(x).for_each(|(o, &v)| *o *= v);
}

pub fn map_in_place<F: Fn(f32) -> f32>(x: &mut [f32], f: F) {
    x.iter_mut().for_each(|v| *v = f(*v));
}

/// Index of the largest value, the lowest index winning ties.
pub fn argmax(x: &[f32]) -> usize {
    let mut best = 0;
    for (i, &value) in x.iter().enumerate().skip(1) {
        if value > x[best] {
            best = i;
        }
    }
    best
}

pub fn sum_of_squares(x: &[f32]) -> f32 {
    x.iter().map(|&v| v * v).sum()
}
