//! Per-block dot products for quantized tensors.
//!
//! Kernels are picked at runtime from the requested [`LaneWidth`] and the CPU features:
//! - x86_64: AVX2 + FMA for 256-bit lanes, SSE4.1 for 128-bit lanes
//! - aarch64: NEON
//! - anything else: portable lane loops over decoded blocks

#[cfg(test)]
#[path = "../tests/unit/simd_test.rs"]
mod simd_test;

use crate::tensor::{LaneWidth, QK};

/// Unscaled dot product of one block's quantized values with `QK` activations.
pub(crate) type BlockDot = fn(&[u8], &[f32]) -> f32;

#[allow(unreachable_code)]
pub(crate) fn q8_0_kernel(width: LaneWidth) -> BlockDot {
    #[cfg(target_arch = "x86_64")]
    {
        if width == LaneWidth::Lanes256 && x86::has_avx2() {
            return x86::q8_0_avx2;
        }
        if is_x86_feature_detected!("sse4.1") {
            return x86::q8_0_sse41;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        return arm::q8_0_neon;
    }

    match width {
        LaneWidth::Lanes128 => q8_0_portable::<4>,
        LaneWidth::Lanes256 => q8_0_portable::<8>,
    }
}

#[allow(unreachable_code)]
pub(crate) fn q4_0_kernel(width: LaneWidth) -> BlockDot {
    #[cfg(target_arch = "x86_64")]
    {
        if width == LaneWidth::Lanes256 && x86::has_avx2() {
            return x86::q4_0_avx2;
        }
        if is_x86_feature_detected!("sse4.1") {
            return x86::q4_0_sse41;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        return arm::q4_0_neon;
    }

    match width {
        LaneWidth::Lanes128 => q4_0_portable::<4>,
        LaneWidth::Lanes256 => q4_0_portable::<8>,
    }
}

/// Dense dot product accumulated in `width` lanes.
pub(crate) fn dense_dot(a: &[f32], b: &[f32], width: LaneWidth) -> f32 {
    match width {
        LaneWidth::Lanes128 => lane_dot::<4>(a, b),
        LaneWidth::Lanes256 => lane_dot::<8>(a, b),
    }
}

fn lane_dot<const LANES: usize>(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let mut acc = [0.0f32; LANES];
    let a_chunks = a.chunks_exact(LANES);
    let b_chunks = b.chunks_exact(LANES);
    let tail: f32 = a_chunks.remainder().iter().zip(b_chunks.remainder()).map(|(x, y)| x * y).sum();

    for (x, y) in a_chunks.zip(b_chunks) {
        for lane in 0..LANES {
            acc[lane] = x[lane].mul_add(y[lane], acc[lane]);
        }
    }

    acc.iter().sum::<f32>() + tail
}

fn q8_0_portable<const LANES: usize>(quants: &[u8], input: &[f32]) -> f32 {
    let weights: [f32; QK] = std::array::from_fn(|i| (quants[i] as i8) as f32);
    lane_dot::<LANES>(&weights, &input[..QK])
}

fn q4_0_portable<const LANES: usize>(packed: &[u8], input: &[f32]) -> f32 {
    let weights: [f32; QK] = std::array::from_fn(|i| {
        let byte = packed[i % (QK / 2)];
        let nibble = if i < QK / 2 { byte & 0x0F } else { byte >> 4 };
        nibble as f32 - 8.0
    });
    lane_dot::<LANES>(&weights, &input[..QK])
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::QK;
    use std::arch::x86_64::*;

    pub(super) fn has_avx2() -> bool {
        is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
    }

    // The safe wrappers are only handed out after feature detection; slicing bounds the loads.

    pub(super) fn q8_0_avx2(quants: &[u8], input: &[f32]) -> f32 {
        // SAFETY: avx2 and fma were detected, both slices hold a whole block.
        unsafe { q8_0_avx2_impl(&quants[..QK], &input[..QK]) }
    }

    pub(super) fn q4_0_avx2(packed: &[u8], input: &[f32]) -> f32 {
        // SAFETY: avx2 and fma were detected, both slices hold a whole block.
        unsafe { q4_0_avx2_impl(&packed[..QK / 2], &input[..QK]) }
    }

    pub(super) fn q8_0_sse41(quants: &[u8], input: &[f32]) -> f32 {
        // SAFETY: sse4.1 was detected, both slices hold a whole block.
        unsafe { q8_0_sse41_impl(&quants[..QK], &input[..QK]) }
    }

    pub(super) fn q4_0_sse41(packed: &[u8], input: &[f32]) -> f32 {
        // SAFETY: sse4.1 was detected, both slices hold a whole block.
        unsafe { q4_0_sse41_impl(&packed[..QK / 2], &input[..QK]) }
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn q8_0_avx2_impl(quants: &[u8], input: &[f32]) -> f32 {
        unsafe {
            let mut acc = _mm256_setzero_ps();
            for base in [0, 16] {
                let bytes = _mm_loadu_si128(quants.as_ptr().add(base) as *const __m128i);
                acc = fmadd_16_avx2(acc, bytes, input.as_ptr().add(base));
            }
            sum_256(acc)
        }
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn q4_0_avx2_impl(packed: &[u8], input: &[f32]) -> f32 {
        unsafe {
            let (low, high) = unpack_nibbles(_mm_loadu_si128(packed.as_ptr() as *const __m128i));
            let acc = fmadd_16_avx2(_mm256_setzero_ps(), low, input.as_ptr());
            sum_256(fmadd_16_avx2(acc, high, input.as_ptr().add(QK / 2)))
        }
    }

    /// `acc += i8x16(bytes) * input[..16]`
    #[target_feature(enable = "avx2,fma")]
    unsafe fn fmadd_16_avx2(acc: __m256, bytes: __m128i, input: *const f32) -> __m256 {
        unsafe {
            let first = _mm256_cvtepi32_ps(_mm256_cvtepi8_epi32(bytes));
            let second = _mm256_cvtepi32_ps(_mm256_cvtepi8_epi32(_mm_srli_si128(bytes, 8)));
            let acc = _mm256_fmadd_ps(first, _mm256_loadu_ps(input), acc);
            _mm256_fmadd_ps(second, _mm256_loadu_ps(input.add(8)), acc)
        }
    }

    #[target_feature(enable = "avx")]
    unsafe fn sum_256(v: __m256) -> f32 {
        let mut lanes = [0.0f32; 8];
        unsafe { _mm256_storeu_ps(lanes.as_mut_ptr(), v) };
        lanes.iter().sum()
    }

    #[target_feature(enable = "sse4.1")]
    unsafe fn q8_0_sse41_impl(quants: &[u8], input: &[f32]) -> f32 {
        unsafe {
            let mut acc = _mm_setzero_ps();
            for base in [0, 16] {
                let bytes = _mm_loadu_si128(quants.as_ptr().add(base) as *const __m128i);
                acc = muladd_16_sse41(acc, bytes, input.as_ptr().add(base));
            }
            sum_128(acc)
        }
    }

    #[target_feature(enable = "sse4.1")]
    unsafe fn q4_0_sse41_impl(packed: &[u8], input: &[f32]) -> f32 {
        unsafe {
            let (low, high) = unpack_nibbles(_mm_loadu_si128(packed.as_ptr() as *const __m128i));
            let acc = muladd_16_sse41(_mm_setzero_ps(), low, input.as_ptr());
            sum_128(muladd_16_sse41(acc, high, input.as_ptr().add(QK / 2)))
        }
    }

    /// `acc += i8x16(bytes) * input[..16]`
    #[target_feature(enable = "sse4.1")]
    unsafe fn muladd_16_sse41(mut acc: __m128, bytes: __m128i, input: *const f32) -> __m128 {
        unsafe {
            let groups = [bytes, _mm_srli_si128(bytes, 4), _mm_srli_si128(bytes, 8), _mm_srli_si128(bytes, 12)];
            for (k, group) in groups.into_iter().enumerate() {
                let weights = _mm_cvtepi32_ps(_mm_cvtepi8_epi32(group));
                acc = _mm_add_ps(acc, _mm_mul_ps(weights, _mm_loadu_ps(input.add(k * 4))));
            }
            acc
        }
    }

    #[target_feature(enable = "sse2")]
    unsafe fn sum_128(v: __m128) -> f32 {
        let mut lanes = [0.0f32; 4];
        unsafe { _mm_storeu_ps(lanes.as_mut_ptr(), v) };
        lanes.iter().sum()
    }

    /// Splits 16 packed bytes into signed low and high nibbles.
    #[target_feature(enable = "sse2")]
    unsafe fn unpack_nibbles(packed: __m128i) -> (__m128i, __m128i) {
        let mask = _mm_set1_epi8(0x0F);
        let bias = _mm_set1_epi8(8);
        let low = _mm_sub_epi8(_mm_and_si128(packed, mask), bias);
        let high = _mm_sub_epi8(_mm_and_si128(_mm_srli_epi16(packed, 4), mask), bias);
        (low, high)
    }
}

#[cfg(target_arch = "aarch64")]
mod arm {
    use super::QK;
    use std::arch::aarch64::*;

    pub(super) fn q8_0_neon(quants: &[u8], input: &[f32]) -> f32 {
        // SAFETY: neon is part of the aarch64 baseline, both slices hold a whole block.
        unsafe { q8_0_impl(&quants[..QK], &input[..QK]) }
    }

    pub(super) fn q4_0_neon(packed: &[u8], input: &[f32]) -> f32 {
        // SAFETY: neon is part of the aarch64 baseline, both slices hold a whole block.
        unsafe { q4_0_impl(&packed[..QK / 2], &input[..QK]) }
    }

    #[target_feature(enable = "neon")]
    unsafe fn q8_0_impl(quants: &[u8], input: &[f32]) -> f32 {
        unsafe {
            let mut acc = vdupq_n_f32(0.0);
            for base in [0, 16] {
                let bytes = vld1q_s8(quants.as_ptr().add(base) as *const i8);
                acc = fma_16(acc, bytes, input.as_ptr().add(base));
            }
            vaddvq_f32(acc)
        }
    }

    #[target_feature(enable = "neon")]
    unsafe fn q4_0_impl(packed: &[u8], input: &[f32]) -> f32 {
        unsafe {
            let bytes = vld1q_u8(packed.as_ptr());
            let bias = vdupq_n_s8(8);
            let low = vsubq_s8(vreinterpretq_s8_u8(vandq_u8(bytes, vdupq_n_u8(0x0F))), bias);
            let high = vsubq_s8(vreinterpretq_s8_u8(vshrq_n_u8(bytes, 4)), bias);

            let acc = fma_16(vdupq_n_f32(0.0), low, input.as_ptr());
            vaddvq_f32(fma_16(acc, high, input.as_ptr().add(QK / 2)))
        }
    }

    /// `acc += i8x16(bytes) * input[..16]`
    #[target_feature(enable = "neon")]
    unsafe fn fma_16(mut acc: float32x4_t, bytes: int8x16_t, input: *const f32) -> float32x4_t {
        unsafe {
            for (k, half) in [vmovl_s8(vget_low_s8(bytes)), vmovl_high_s8(bytes)].into_iter().enumerate() {
                let low = vcvtq_f32_s32(vmovl_s16(vget_low_s16(half)));
                let high = vcvtq_f32_s32(vmovl_high_s16(half));
                acc = vfmaq_f32(acc, low, vld1q_f32(input.add(k * 8)));
                acc = vfmaq_f32(acc, high, vld1q_f32(input.add(k * 8 + 4)));
            }
            acc
        }
    }
}
