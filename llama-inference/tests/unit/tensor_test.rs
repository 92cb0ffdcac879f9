use super::*;
use half::f16;

fn q8_0_block(scale: f32, quants: &[i8; QK]) -> Vec<u8> {
    let mut block = f16::from_f32(scale).to_le_bytes().to_vec();
    block.extend(quants.iter().map(|&q| q as u8));
    block
}

fn q4_0_block(scale: f32, nibbles: &[u8; QK]) -> Vec<u8> {
    let mut block = f16::from_f32(scale).to_le_bytes().to_vec();
    block.extend((0..QK / 2).map(|i| nibbles[i] | (nibbles[i + QK / 2] << 4)));
    block
}

/// Deterministic pseudo-random Q8_0 blocks.
fn q8_0_blocks(count: usize) -> Vec<u8> {
    (0..count)
        .flat_map(|b| {
            let quants: [i8; QK] = std::array::from_fn(|i| ((b * 31 + i * 7) % 255) as i8);
            q8_0_block(0.01 * (b + 1) as f32, &quants)
        })
        .collect()
}

fn q4_0_blocks(count: usize) -> Vec<u8> {
    (0..count)
        .flat_map(|b| {
            let nibbles: [u8; QK] = std::array::from_fn(|i| ((b * 5 + i * 3) % 16) as u8);
            q4_0_block(0.5 / (b + 1) as f32, &nibbles)
        })
        .collect()
}

fn input(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i * 13 % 17) as f32 - 8.0) * 0.125).collect()
}

fn assert_close(actual: f32, expected: f32) {
    let tolerance = 1e-2 + 1e-3 * expected.abs();
    assert!((actual - expected).abs() <= tolerance, "{actual} != {expected}");
}

#[test]
fn test_q8_0_decodes_signed_quants() {
    let mut quants = [0i8; QK];
    quants[0] = -128;
    quants[1] = 127;
    quants[31] = -3;
    let blocks = q8_0_block(0.5, &quants);
    let tensor = QuantizedTensor::Q8_0(&blocks);

    assert_eq!(tensor.size(), QK);
    assert_eq!(tensor.get_float(0), -64.0);
    assert_eq!(tensor.get_float(1), 63.5);
    assert_eq!(tensor.get_float(2), 0.0);
    assert_eq!(tensor.get_float(31), -1.5);
}

#[test]
fn test_q4_0_places_high_nibbles_in_second_half() {
    let nibbles: [u8; QK] = std::array::from_fn(|i| i as u8 % 16);
    let blocks = q4_0_block(2.0, &nibbles);
    let tensor = QuantizedTensor::Q4_0(&blocks);

    assert_eq!(blocks.len(), 18);
    assert_eq!(tensor.size(), QK);
    assert_eq!(tensor.get_float(0), -16.0);
    assert_eq!(tensor.get_float(8), 0.0);
    assert_eq!(tensor.get_float(15), 14.0);
    // element 16 is the high nibble of byte 0
    assert_eq!(tensor.get_float(16), -16.0);
    assert_eq!(tensor.get_float(31), 14.0);
}

#[test]
fn test_copy_to_decodes_a_range() {
    let blocks = q8_0_blocks(2);
    let tensor = QuantizedTensor::Q8_0(&blocks);

    let mut out = vec![0.0; 10];
    tensor.copy_to(27, &mut out);

    for (i, &value) in out.iter().enumerate() {
        assert_eq!(value, tensor.get_float(27 + i));
    }
}

#[test]
fn test_vector_dot_matches_scalar_for_q8_0() {
    let tensor_blocks = q8_0_blocks(6);
    let tensor = QuantizedTensor::Q8_0(&tensor_blocks);
    let that = input(200);

    for (this_offset, that_offset, len) in [(0, 0, 192), (5, 3, 150), (32, 0, 64), (31, 1, 1), (7, 9, 20), (40, 0, 0)] {
        let expected = tensor.scalar_dot(this_offset, &that, that_offset, len);

        assert_close(tensor.vector_dot(LaneWidth::Lanes128, this_offset, &that, that_offset, len), expected);
        assert_close(tensor.vector_dot(LaneWidth::Lanes256, this_offset, &that, that_offset, len), expected);
    }
}

#[test]
fn test_vector_dot_matches_scalar_for_q4_0() {
    let tensor_blocks = q4_0_blocks(4);
    let tensor = QuantizedTensor::Q4_0(&tensor_blocks);
    let that = input(128);

    for (this_offset, that_offset, len) in [(0, 0, 128), (17, 0, 100), (64, 64, 64), (3, 2, 29)] {
        let expected = tensor.scalar_dot(this_offset, &that, that_offset, len);

        for kernel in [DotKernel::Scalar, DotKernel::Vector(LaneWidth::Lanes128), DotKernel::default()] {
            assert_close(tensor.dot(this_offset, &that, that_offset, len, kernel), expected);
        }
    }
}

#[test]
fn test_single_block_length_at_unaligned_offset() {
    let tensor_blocks = q8_0_blocks(3);
    let q8_0 = QuantizedTensor::Q8_0(&tensor_blocks);
    let tensor_blocks = q4_0_blocks(3);
    let q4_0 = QuantizedTensor::Q4_0(&tensor_blocks);
    let that = input(64);

    for tensor in [&q8_0, &q4_0] {
        // spans two blocks without covering either one
        let expected = tensor.scalar_dot(5, &that, 3, QK);
        for kernel in [DotKernel::Vector(LaneWidth::Lanes128), DotKernel::Vector(LaneWidth::Lanes256)] {
            assert_close(tensor.dot(5, &that, 3, QK, kernel), expected);
        }
    }
}

#[test]
fn test_dense_dot_handles_remainders() {
    let tensor = QuantizedTensor::dense((0..19).map(|i| i as f32).collect());
    let that = vec![1.0; 19];

    assert_eq!(tensor.scalar_dot(0, &that, 0, 19), 171.0);
    assert_eq!(tensor.vector_dot(LaneWidth::Lanes256, 0, &that, 0, 19), 171.0);
    assert_eq!(tensor.vector_dot(LaneWidth::Lanes128, 2, &that, 1, 5), 20.0);
}

#[test]
fn test_set_float_only_writes_owned_dense_tensors() -> anyhow::Result<()> {
    let mut dense = QuantizedTensor::zeros(4);
    dense.set_float(2, 1.5)?;
    assert_eq!(dense.get_float(2), 1.5);
    assert!(dense.set_float(4, 1.0).is_err());

    let values = [1.0f32, 2.0];
    let mut borrowed = QuantizedTensor::F32(Cow::Borrowed(&values));
    assert!(borrowed.set_float(0, 3.0).is_err());

    let blocks = q8_0_blocks(1);
    let mut quantized = QuantizedTensor::Q8_0(&blocks);
    assert!(quantized.set_float(0, 3.0).is_err());
    Ok(())
}

#[test]
fn test_matmul_over_rows() {
    // 3x4 matrix, row r holds r + 1
    let weights = QuantizedTensor::dense((0..12).map(|i| (i / 4 + 1) as f32).collect());
    let input = [1.0, 2.0, 3.0, 4.0];
    let mut output = [0.0; 3];

    for kernel in [DotKernel::Scalar, DotKernel::default()] {
        matmul(&weights, &input, &mut output, 3, 4, kernel);
        assert_eq!(output, [10.0, 20.0, 30.0]);
    }
}

#[test]
fn test_dot_kernel_from_str() -> anyhow::Result<()> {
    assert_eq!("scalar".parse::<DotKernel>()?, DotKernel::Scalar);
    assert_eq!("simd128".parse::<DotKernel>()?, DotKernel::Vector(LaneWidth::Lanes128));
    assert_eq!("simd256".parse::<DotKernel>()?, DotKernel::Vector(LaneWidth::Lanes256));
    assert_eq!(DotKernel::default(), DotKernel::Vector(LaneWidth::Lanes256));
    assert!("avx".parse::<DotKernel>().is_err());
    Ok(())
}

#[test]
fn test_softmax_in_place() {
    let mut x = [1.0, 2.0, 3.0];
    softmax_in_place(&mut x);

    assert_close(x.iter().sum(), 1.0);
    assert!(x[0] < x[1] && x[1] < x[2]);
    assert_close(x[2] / x[1], std::f32::consts::E);

    let mut empty: [f32; 0] = [];
    softmax_in_place(&mut empty);
}

#[test]
fn test_softmax_ignores_constant_shift() {
    let logits = [0.5, -1.25, 2.0, 0.0, 1.5];
    let mut expected = logits;
    softmax_in_place(&mut expected);

    for shift in [-100.0, -3.5, 7.0, 1000.0] {
        let mut shifted = logits.map(|v| v + shift);
        softmax_in_place(&mut shifted);

        for (a, b) in shifted.iter().zip(&expected) {
            assert!((a - b).abs() <= 1e-5, "shift {shift}: {a} != {b}");
        }
    }
}

#[test]
fn test_argmax_ignores_positive_scaling() {
    let logits = [0.5, -1.25, 2.0, 0.0, 2.0, 1.5];
    assert_eq!(argmax(&logits), 2);

    for scale in [1e-3, 0.5, 3.0, 1e6] {
        assert_eq!(argmax(&logits.map(|v| v * scale)), 2, "scale {scale}");
    }
}

#[test]
fn test_argmax_prefers_lowest_index_on_ties() {
    assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]), 1);
    assert_eq!(argmax(&[0.5; 4]), 0);
    assert_eq!(argmax(&[-1.0, -0.5]), 1);
}

#[test]
fn test_in_place_helpers() {
    let mut out = [1.0, 2.0];
    saxpy_in_place(&mut out, &[3.0, 4.0], 2.0);
    assert_eq!(out, [7.0, 10.0]);

    add_in_place(&mut out, &[1.0, 1.0]);
    assert_eq!(out, [8.0, 11.0]);

    multiply_in_place(&mut out, &[0.5, 2.0]);
    assert_eq!(out, [4.0, 22.0]);

    map_in_place(&mut out, |v| v - 1.0);
    assert_eq!(out, [3.0, 21.0]);

    assert_eq!(sum_of_squares(&out), 450.0);
}
