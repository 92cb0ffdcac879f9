use super::*;

#[path = "../common/mod.rs"]
mod common;

use common::{GGML_F32, GGML_Q4_0, GGML_Q8_0, GgufBuilder, Value, f32_bytes, q8_0_constant};

fn error_chain(result: Result<GgufFile>) -> String {
    match result {
        Ok(_) => panic!("expected a parse error"),
        Err(err) => format!("{err:#}"),
    }
}

#[test]
fn test_reads_every_metadata_type() -> Result<()> {
    let bytes = GgufBuilder::default()
        .metadata("test.u8", Value::U8(7))
        .metadata("test.i8", Value::I8(-7))
        .metadata("test.u16", Value::U16(700))
        .metadata("test.i16", Value::I16(-700))
        .metadata("test.u32", Value::U32(70_000))
        .metadata("test.i32", Value::I32(-70_000))
        .metadata("test.f32", Value::F32(0.5))
        .metadata("test.bool", Value::Bool(true))
        .metadata("test.string", Value::Str("hello".to_string()))
        .metadata("test.u64", Value::U64(1 << 40))
        .metadata("test.i64", Value::I64(-(1 << 40)))
        .metadata("test.f64", Value::F64(0.25))
        .metadata(
            "test.nested",
            Value::Array(9, vec![Value::Array(4, vec![Value::U32(1), Value::U32(2)]), Value::Array(4, vec![])]),
        )
        .build();

    let file = GgufFile::from_bytes(&bytes)?;

    assert_eq!(file.version(), 3);
    assert_eq!(file.alignment(), DEFAULT_ALIGNMENT);
    assert_eq!(file.metadata().len(), 13);
    assert_eq!(file.get("test.u8"), Some(&MetadataValue::UInt8(7)));
    assert_eq!(file.get("test.i8"), Some(&MetadataValue::Int8(-7)));
    assert_eq!(file.get("test.u16"), Some(&MetadataValue::UInt16(700)));
    assert_eq!(file.get("test.i16"), Some(&MetadataValue::Int16(-700)));
    assert_eq!(file.get_u64("test.u32")?, 70_000);
    assert_eq!(file.get("test.i32").and_then(MetadataValue::as_i64), Some(-70_000));
    assert_eq!(file.get_f32("test.f32")?, 0.5);
    assert_eq!(file.get("test.bool"), Some(&MetadataValue::Bool(true)));
    assert_eq!(file.get_str("test.string")?, "hello");
    assert_eq!(file.get_usize("test.u64")?, 1 << 40);
    assert_eq!(file.get("test.i64"), Some(&MetadataValue::Int64(-(1 << 40))));
    assert_eq!(file.get("test.f64").and_then(MetadataValue::as_f32), Some(0.25));

    let nested = file.get("test.nested").and_then(MetadataValue::as_array).expect("array");
    assert_eq!(nested.len(), 2);
    assert_eq!(
        nested[0],
        MetadataValue::Array(MetadataValueType::UInt32, vec![MetadataValue::UInt32(1), MetadataValue::UInt32(2)])
    );
    assert_eq!(nested[1].as_array().map(<[MetadataValue]>::len), Some(0));
    assert_eq!(nested[1].value_type(), MetadataValueType::Array);

    Ok(())
}

#[test]
fn test_reads_version_2_files() -> Result<()> {
    let bytes = GgufBuilder::default().version(2).metadata("general.name", Value::Str("v2".to_string())).build();

    let file = GgufFile::from_bytes(&bytes)?;

    assert_eq!(file.version(), 2);
    assert_eq!(file.get_str("general.name")?, "v2");
    Ok(())
}

#[test]
fn test_metadata_display_summarizes_arrays() {
    let array = MetadataValue::Array(MetadataValueType::String, vec![MetadataValue::String("a".to_string()); 3]);

    assert_eq!(array.to_string(), "[String; 3]");
    assert_eq!(MetadataValue::String("llama".to_string()).to_string(), "\"llama\"");
    assert_eq!(MetadataValue::UInt32(5).to_string(), "5");
}

#[test]
fn test_reads_tensor_directory() -> Result<()> {
    let bytes = GgufBuilder::default()
        .metadata("general.architecture", Value::Str("llama".to_string()))
        .tensor("norm.weight", &[4], GGML_F32, f32_bytes(&[1.0, 2.0, 3.0, 4.0]))
        .tensor("blk.0.attn_q.weight", &[32, 2], GGML_Q8_0, q8_0_constant(64, 3))
        .build();

    let file = GgufFile::from_bytes(&bytes)?;

    assert_eq!(file.tensor_infos().len(), 2);
    assert_eq!(file.tensor_data_offset() % DEFAULT_ALIGNMENT, 0);

    let norm = file.tensor_info("norm.weight").expect("norm");
    assert_eq!(norm.dimensions, vec![4]);
    assert_eq!(norm.ggml_type, GgmlType::F32);
    assert_eq!(norm.offset, 0);
    assert_eq!(file.dense_tensor("norm.weight")?.as_ref(), &[1.0, 2.0, 3.0, 4.0]);

    let q = file.tensor_info("blk.0.attn_q.weight").expect("q");
    assert_eq!(q.element_count(), 64);
    assert_eq!(q.byte_size()?, 68);
    assert_eq!(q.offset, 32);

    let tensor = file.tensor("blk.0.attn_q.weight")?;
    assert_eq!(tensor.ggml_type(), GgmlType::Q8_0);
    assert_eq!(tensor.size(), 64);
    assert_eq!(tensor.get_float(63), 3.0);

    assert!(file.contains_tensor("norm.weight"));
    assert!(!file.contains_tensor("output.weight"));
    assert!(file.tensor("output.weight").is_err());
    Ok(())
}

#[test]
fn test_dense_tensor_rejects_quantized_data() -> Result<()> {
    let bytes = GgufBuilder::default().tensor("w", &[32], GGML_Q8_0, q8_0_constant(32, 1)).build();

    let file = GgufFile::from_bytes(&bytes)?;

    assert!(file.tensor("w").is_ok());
    assert!(file.dense_tensor("w").is_err());
    Ok(())
}

#[test]
fn test_honors_custom_alignment() -> Result<()> {
    let bytes = GgufBuilder::default()
        .alignment(64)
        .tensor("a", &[3], GGML_F32, f32_bytes(&[1.0, 2.0, 3.0]))
        .tensor("b", &[2], GGML_F32, f32_bytes(&[4.0, 5.0]))
        .build();

    let file = GgufFile::from_bytes(&bytes)?;

    assert_eq!(file.alignment(), 64);
    assert_eq!(file.tensor_data_offset() % 64, 0);
    assert_eq!(file.tensor_info("b").map(|info| info.offset), Some(64));
    assert_eq!(file.dense_tensor("b")?.as_ref(), &[4.0, 5.0]);
    Ok(())
}

#[test]
fn test_opens_file_from_disk() -> Result<()> {
    let temp = GgufBuilder::default()
        .metadata("general.name", Value::Str("disk".to_string()))
        .tensor("w", &[2], GGML_F32, f32_bytes(&[0.5, -0.5]))
        .write_temp();

    let file = GgufFile::open(temp.path())?;

    assert_eq!(file.get_str("general.name")?, "disk");
    assert_eq!(file.dense_tensor("w")?.as_ref(), &[0.5, -0.5]);
    assert!(matches!(file.dense_tensor("w")?, Cow::Borrowed(_)));
    Ok(())
}

#[test]
fn test_rejects_bad_magic() {
    let mut bytes = GgufBuilder::default().build();
    bytes[0] = b'X';

    assert!(error_chain(GgufFile::from_bytes(&bytes)).contains("Invalid magic number"));
}

#[test]
fn test_rejects_unsupported_version() {
    let bytes = GgufBuilder::default().version(4).build();

    assert!(error_chain(GgufFile::from_bytes(&bytes)).contains("Unsupported GGUF version: 4"));
}

#[test]
fn test_rejects_invalid_keys() {
    for key in ["General.name", "general..name", "general.name-x", ".general"] {
        let bytes = GgufBuilder::default().metadata(key, Value::U8(1)).build();

        assert!(error_chain(GgufFile::from_bytes(&bytes)).contains("Invalid metadata key"), "key: {key}");
    }
}

#[test]
fn test_rejects_duplicate_keys() {
    let bytes =
        GgufBuilder::default().metadata("general.name", Value::U8(1)).metadata("general.name", Value::U8(2)).build();

    assert!(error_chain(GgufFile::from_bytes(&bytes)).contains("Duplicate metadata key"));
}

#[test]
fn test_rejects_unknown_value_type() {
    let bytes = GgufBuilder::default().raw_metadata("general.name", 13, vec![0; 8]).build();

    assert!(error_chain(GgufFile::from_bytes(&bytes)).contains("Unknown metadata value type: 13"));
}

#[test]
fn test_rejects_invalid_bool() {
    let bytes = GgufBuilder::default().raw_metadata("general.flag", 7, vec![2]).build();

    assert!(error_chain(GgufFile::from_bytes(&bytes)).contains("Invalid bool value: 2"));
}

#[test]
fn test_rejects_non_power_of_two_alignment() {
    let bytes = GgufBuilder::default().metadata(ALIGNMENT_KEY, Value::U32(24)).build();

    assert!(error_chain(GgufFile::from_bytes(&bytes)).contains("Alignment must be a power of two"));
}

#[test]
fn test_rejects_misaligned_tensor_offset() {
    let bytes = GgufBuilder::default().tensor_at("w", &[4], GGML_F32, f32_bytes(&[0.0; 4]), 8).build();

    assert!(error_chain(GgufFile::from_bytes(&bytes)).contains("is not a multiple of the alignment"));
}

#[test]
fn test_rejects_tensor_outside_data_region() {
    let bytes = GgufBuilder::default().tensor_at("w", &[4], GGML_F32, f32_bytes(&[0.0; 4]), 64).build();

    assert!(error_chain(GgufFile::from_bytes(&bytes)).contains("exceeds the data region"));
}

#[test]
fn test_rejects_bad_tensor_shapes() {
    let too_many = GgufBuilder::default().tensor("w", &[1, 1, 1, 1, 1], GGML_F32, f32_bytes(&[0.0])).build();
    assert!(error_chain(GgufFile::from_bytes(&too_many)).contains("dimensions"));

    let long_name = "x".repeat(65);
    let too_long = GgufBuilder::default().tensor(&long_name, &[1], GGML_F32, f32_bytes(&[0.0])).build();
    assert!(error_chain(GgufFile::from_bytes(&too_long)).contains("longer than 64 bytes"));

    let partial_block = GgufBuilder::default().tensor("w", &[16], GGML_Q4_0, vec![0; 18]).build();
    assert!(error_chain(GgufFile::from_bytes(&partial_block)).contains("whole Q4_0 blocks"));
}

#[test]
fn test_rejects_unknown_tensor_type() {
    let bytes = GgufBuilder::default().tensor("w", &[1], 5, vec![0; 4]).build();

    assert!(error_chain(GgufFile::from_bytes(&bytes)).contains("unknown type"));
}

#[test]
fn test_rejects_truncated_file() {
    let bytes = GgufBuilder::default().metadata("general.name", Value::Str("truncated".to_string())).build();

    assert!(GgufFile::from_bytes(&bytes[..bytes.len() - 3]).is_err());
}

#[test]
fn test_rejects_tensor_count_larger_than_file() {
    for tensor_count in [1u64 << 60, 1 << 40, 2] {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&tensor_count.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        // room for a single directory entry
        bytes.extend_from_slice(&[0; 40]);

        let error = error_chain(GgufFile::from_bytes(&bytes));
        assert!(error.contains(&format!("Tensor count {tensor_count} exceeds")), "{error}");
    }
}

#[test]
fn test_ggml_type_sizes() -> Result<()> {
    assert_eq!(GgmlType::from_id(8)?, GgmlType::Q8_0);
    assert_eq!(GgmlType::Q4_0.id(), 2);
    assert_eq!(GgmlType::Q4_0.byte_size_for(64)?, 36);
    assert_eq!(GgmlType::Q8_0.byte_size_for(32)?, 34);
    assert_eq!(GgmlType::F16.byte_size_for(3)?, 6);
    assert_eq!(GgmlType::Q4_K.byte_size_for(256)?, 144);
    assert!(GgmlType::Q8_0.byte_size_for(33).is_err());
    assert!(GgmlType::from_id(4).is_err());
    Ok(())
}
