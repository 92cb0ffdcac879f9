#[cfg(test)]
#[path = "../tests/unit/gguf_test.rs"]
mod gguf_test;

use crate::tensor::QuantizedTensor;
use crate::utils::{MemoryMapper, f32_slice};
use anyhow::{Context, Result};
use log::debug;
use memmap2::Mmap;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::path::Path;

/// "GGUF" read as a little-endian u32.
pub const GGUF_MAGIC: u32 = 0x4655_4747;
pub const DEFAULT_ALIGNMENT: usize = 32;
pub const ALIGNMENT_KEY: &str = "general.alignment";

const SUPPORTED_VERSIONS: [u32; 2] = [2, 3];
const MAX_KEY_LEN: usize = 1 << 16;
const MAX_TENSOR_NAME_LEN: usize = 64;
const MAX_DIMENSIONS: usize = 4;
/// Smallest directory entry: name length, dimension count, one dimension, type and offset.
const MIN_TENSOR_INFO_BYTES: usize = 8 + 4 + 8 + 4 + 8;

/// Tag preceding every metadata value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataValueType {
    UInt8 = 0,
    Int8 = 1,
    UInt16 = 2,
    Int16 = 3,
    UInt32 = 4,
    Int32 = 5,
    Float32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    UInt64 = 10,
    Int64 = 11,
    Float64 = 12,
}

impl TryFrom<u32> for MetadataValueType {
    type Error = anyhow::Error;

    fn try_from(tag: u32) -> Result<Self> {
        Ok(match tag {
            0 => Self::UInt8,
            1 => Self::Int8,
            2 => Self::UInt16,
            3 => Self::Int16,
            4 => Self::UInt32,
            5 => Self::Int32,
            6 => Self::Float32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::UInt64,
            11 => Self::Int64,
            12 => Self::Float64,
            _ => anyhow::bail!("Unknown metadata value type: {tag}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    UInt8(u8),
    Int8(i8),
    UInt16(u16),
    Int16(i16),
    UInt32(u32),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    Array(MetadataValueType, Vec<MetadataValue>),
    UInt64(u64),
    Int64(i64),
    Float64(f64),
}

impl MetadataValue {
    pub fn value_type(&self) -> MetadataValueType {
        match self {
            Self::UInt8(_) => MetadataValueType::UInt8,
            Self::Int8(_) => MetadataValueType::Int8,
            Self::UInt16(_) => MetadataValueType::UInt16,
            Self::Int16(_) => MetadataValueType::Int16,
            Self::UInt32(_) => MetadataValueType::UInt32,
            Self::Int32(_) => MetadataValueType::Int32,
            Self::Float32(_) => MetadataValueType::Float32,
            Self::Bool(_) => MetadataValueType::Bool,
            Self::String(_) => MetadataValueType::String,
            Self::Array(..) => MetadataValueType::Array,
            Self::UInt64(_) => MetadataValueType::UInt64,
            Self::Int64(_) => MetadataValueType::Int64,
            Self::Float64(_) => MetadataValueType::Float64,
        }
    }

    /// Any non-negative integer, whatever its stored width.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::UInt8(v) => Some(v as u64),
            Self::UInt16(v) => Some(v as u64),
            Self::UInt32(v) => Some(v as u64),
            Self::UInt64(v) => Some(v),
            Self::Int8(v) => u64::try_from(v).ok(),
            Self::Int16(v) => u64::try_from(v).ok(),
            Self::Int32(v) => u64::try_from(v).ok(),
            Self::Int64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Int8(v) => Some(v as i64),
            Self::Int16(v) => Some(v as i64),
            Self::Int32(v) => Some(v as i64),
            Self::Int64(v) => Some(v),
            _ => self.as_u64().and_then(|v| i64::try_from(v).ok()),
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::Float32(v) => Some(v),
            Self::Float64(v) => Some(v as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[MetadataValue]> {
        match self {
            Self::Array(_, values) => Some(values.as_slice()),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UInt8(v) => write!(f, "{v}"),
            Self::Int8(v) => write!(f, "{v}"),
            Self::UInt16(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Array(element_type, values) => write!(f, "[{element_type:?}; {}]", values.len()),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
        }
    }
}

/// Tensor element encodings known to the ggml family of formats.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2_K,
    Q3_K,
    Q4_K,
    Q5_K,
    Q6_K,
    Q8_K,
    I8,
    I16,
    I32,
    I64,
    F64,
    BF16,
}

const QK_K: usize = 256;

impl GgmlType {
    pub fn from_id(id: u32) -> Result<Self> {
        Ok(match id {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            6 => Self::Q5_0,
            7 => Self::Q5_1,
            8 => Self::Q8_0,
            9 => Self::Q8_1,
            10 => Self::Q2_K,
            11 => Self::Q3_K,
            12 => Self::Q4_K,
            13 => Self::Q5_K,
            14 => Self::Q6_K,
            15 => Self::Q8_K,
            24 => Self::I8,
            25 => Self::I16,
            26 => Self::I32,
            27 => Self::I64,
            28 => Self::F64,
            30 => Self::BF16,
            _ => anyhow::bail!("Unsupported ggml type id: {id}"),
        })
    }

    pub fn id(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q5_0 => 6,
            Self::Q5_1 => 7,
            Self::Q8_0 => 8,
            Self::Q8_1 => 9,
            Self::Q2_K => 10,
            Self::Q3_K => 11,
            Self::Q4_K => 12,
            Self::Q5_K => 13,
            Self::Q6_K => 14,
            Self::Q8_K => 15,
            Self::I8 => 24,
            Self::I16 => 25,
            Self::I32 => 26,
            Self::I64 => 27,
            Self::F64 => 28,
            Self::BF16 => 30,
        }
    }

    /// Bytes occupied by one block.
    pub fn type_size(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::BF16 | Self::I16 => 2,
            Self::I8 => 1,
            Self::I64 | Self::F64 => 8,
            Self::Q4_0 => 2 + 16,
            Self::Q4_1 => 2 * 2 + 16,
            Self::Q5_0 => 2 + 4 + 16,
            Self::Q5_1 => 2 * 2 + 4 + 16,
            Self::Q8_0 => 2 + 32,
            Self::Q8_1 => 2 * 2 + 32,
            Self::Q2_K => QK_K / 16 + QK_K / 4 + 2 * 2,
            Self::Q3_K => QK_K / 8 + QK_K / 4 + 12 + 2,
            Self::Q4_K => 2 * 2 + 12 + QK_K / 2,
            Self::Q5_K => 2 * 2 + 12 + QK_K / 8 + QK_K / 2,
            Self::Q6_K => QK_K / 2 + QK_K / 4 + QK_K / 16 + 2,
            Self::Q8_K => 4 + QK_K + QK_K / 16 * 2,
        }
    }

    /// Elements per block.
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 | Self::BF16 | Self::F64 | Self::I8 | Self::I16 | Self::I32 | Self::I64 => 1,
            Self::Q4_0 | Self::Q4_1 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 | Self::Q8_1 => 32,
            Self::Q2_K | Self::Q3_K | Self::Q4_K | Self::Q5_K | Self::Q6_K | Self::Q8_K => QK_K,
        }
    }

    pub fn byte_size_for(self, elements: usize) -> Result<usize> {
        let block_size = self.block_size();
        if elements % block_size != 0 {
            anyhow::bail!("{elements} elements do not fill whole {self:?} blocks of {block_size}");
        }

        (elements / block_size)
            .checked_mul(self.type_size())
            .with_context(|| format!("Byte size of {elements} {self:?} elements overflows"))
    }
}

/// One entry of the tensor directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub dimensions: Vec<usize>,
    pub ggml_type: GgmlType,
    /// Offset relative to the start of the tensor data region.
    pub offset: usize,
}

impl TensorInfo {
    pub fn element_count(&self) -> usize {
        self.dimensions.iter().product()
    }

    pub fn byte_size(&self) -> Result<usize> {
        self.ggml_type
            .byte_size_for(self.element_count())
            .with_context(|| format!("Invalid size of tensor '{}'", self.name))
    }
}

/// A parsed GGUF file backed by a read-only memory mapping.
///
/// Tensor views returned by [`GgufFile::tensor`] borrow the mapping, so the file must outlive
/// every model built from it.
pub struct GgufFile {
    version: u32,
    alignment: usize,
    metadata: BTreeMap<String, MetadataValue>,
    tensor_infos: Vec<TensorInfo>,
    tensor_index: HashMap<String, usize>,
    data_offset: usize,
    mmap: Mmap,
}

impl fmt::Debug for GgufFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GgufFile")
            .field("version", &self.version)
            .field("alignment", &self.alignment)
            .field("metadata", &format!("{} entries", self.metadata.len()))
            .field("tensors", &format!("{} entries", self.tensor_infos.len()))
            .field("data_offset", &self.data_offset)
            .field("file_size", &self.mmap.len())
            .finish()
    }
}

impl GgufFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open model file: {}", path.display()))?;
        let mapper = MemoryMapper::new(file)?;

        Self::parse(mapper).with_context(|| format!("Failed to parse GGUF file: {}", path.display()))
    }

    /// Parses a GGUF image held in memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::parse(MemoryMapper::from_bytes(bytes)?)
    }

    fn parse(mut mapper: MemoryMapper) -> Result<Self> {
        let magic = mapper.read_u32().context("Failed to read magic")?;
        if magic != GGUF_MAGIC {
            anyhow::bail!("Invalid magic number: expected {GGUF_MAGIC:#x}, got {magic:#x}");
        }

        let version = mapper.read_u32().context("Failed to read version")?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            anyhow::bail!("Unsupported GGUF version: {version}");
        }

        let tensor_count = mapper.read_len().context("Failed to read tensor count")?;
        let metadata_count = mapper.read_len().context("Failed to read metadata count")?;

        let mut metadata = BTreeMap::new();
        for idx in 0..metadata_count {
            let key = read_key(&mut mapper).with_context(|| format!("Failed to read metadata key #{idx}"))?;
            let value_type = MetadataValueType::try_from(mapper.read_u32()?)
                .with_context(|| format!("Invalid value type of metadata '{key}'"))?;
            let value = read_value(&mut mapper, value_type)
                .with_context(|| format!("Failed to read value of metadata '{key}'"))?;

            if metadata.contains_key(&key) {
                anyhow::bail!("Duplicate metadata key: '{key}'");
            }
            metadata.insert(key, value);
        }

        let alignment = match metadata.get(ALIGNMENT_KEY) {
            Some(value) => value
                .as_u64()
                .and_then(|v| usize::try_from(v).ok())
                .with_context(|| format!("'{ALIGNMENT_KEY}' must be an unsigned integer, got {value}"))?,
            None => DEFAULT_ALIGNMENT,
        };
        if !alignment.is_power_of_two() {
            anyhow::bail!("Alignment must be a power of two, got {alignment}");
        }

        let remaining = mapper.len() - mapper.offset();
        if tensor_count > remaining / MIN_TENSOR_INFO_BYTES {
            anyhow::bail!("Tensor count {tensor_count} exceeds what {remaining} remaining bytes can describe");
        }

        let mut tensor_infos = Vec::with_capacity(tensor_count);
        let mut tensor_index = HashMap::with_capacity(tensor_count);
        for idx in 0..tensor_count {
            let info = read_tensor_info(&mut mapper, alignment)
                .with_context(|| format!("Failed to read tensor info #{idx}"))?;

            if tensor_index.insert(info.name.clone(), idx).is_some() {
                anyhow::bail!("Duplicate tensor name: '{}'", info.name);
            }
            tensor_infos.push(info);
        }

        mapper.align_to(alignment).context("Tensor data region is missing")?;
        let data_offset = mapper.offset();
        let data_len = mapper.len() - data_offset;

        for info in &tensor_infos {
            let end = info.offset.checked_add(info.byte_size()?);
            if end.is_none_or(|end| end > data_len) {
                anyhow::bail!(
                    "Tensor '{}' at offset {} exceeds the data region of {} bytes",
                    info.name,
                    info.offset,
                    data_len
                );
            }
        }

        debug!(
            "GGUF v{version}: {} metadata entries, {} tensors, alignment {alignment}, data at {data_offset}",
            metadata.len(),
            tensor_infos.len()
        );

        Ok(Self { version, alignment, metadata, tensor_infos, tensor_index, data_offset, mmap: mapper.into_mmap() })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Absolute file offset of the tensor data region.
    pub fn tensor_data_offset(&self) -> usize {
        self.data_offset
    }

    pub fn metadata(&self) -> &BTreeMap<String, MetadataValue> {
        &self.metadata
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Result<u64> {
        self.require(key)?.as_u64().with_context(|| format!("Metadata '{key}' is not an unsigned integer"))
    }

    pub fn get_usize(&self, key: &str) -> Result<usize> {
        let value = self.get_u64(key)?;
        usize::try_from(value).with_context(|| format!("Metadata '{key}' does not fit into usize"))
    }

    pub fn get_f32(&self, key: &str) -> Result<f32> {
        self.require(key)?.as_f32().with_context(|| format!("Metadata '{key}' is not a float"))
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        self.require(key)?.as_str().with_context(|| format!("Metadata '{key}' is not a string"))
    }

    pub fn get_string_array(&self, key: &str) -> Result<Vec<&str>> {
        let values = self.require(key)?.as_array().with_context(|| format!("Metadata '{key}' is not an array"))?;

        values
            .iter()
            .map(|value| value.as_str().with_context(|| format!("Metadata '{key}' contains a non-string element")))
            .collect()
    }

    fn require(&self, key: &str) -> Result<&MetadataValue> {
        self.metadata.get(key).with_context(|| format!("Missing metadata '{key}'"))
    }

    pub fn tensor_infos(&self) -> &[TensorInfo] {
        &self.tensor_infos
    }

    pub fn tensor_info(&self, name: &str) -> Option<&TensorInfo> {
        self.tensor_index.get(name).map(|&idx| &self.tensor_infos[idx])
    }

    pub fn contains_tensor(&self, name: &str) -> bool {
        self.tensor_index.contains_key(name)
    }

    /// Raw bytes of a tensor inside the mapping.
    pub fn tensor_bytes(&self, name: &str) -> Result<&[u8]> {
        let info = self.tensor_info(name).with_context(|| format!("Missing tensor '{name}'"))?;
        let start = self.data_offset + info.offset;

        Ok(&self.mmap[start..start + info.byte_size()?])
    }

    /// Builds a tensor view over the mapping; only F32, Q4_0 and Q8_0 tensors can be viewed.
    pub fn tensor(&self, name: &str) -> Result<QuantizedTensor<'_>> {
        let info = self.tensor_info(name).with_context(|| format!("Missing tensor '{name}'"))?;
        let bytes = self.tensor_bytes(name)?;

        Ok(match info.ggml_type {
            GgmlType::F32 => QuantizedTensor::F32(f32_slice(bytes)),
            GgmlType::Q4_0 => QuantizedTensor::Q4_0(bytes),
            GgmlType::Q8_0 => QuantizedTensor::Q8_0(bytes),
            other => anyhow::bail!("Tensor '{name}' has unsupported type {other:?}"),
        })
    }

    /// Reads a tensor that must be stored as dense F32, such as a norm weight.
    pub fn dense_tensor(&self, name: &str) -> Result<Cow<'_, [f32]>> {
        match self.tensor(name)? {
            QuantizedTensor::F32(values) => Ok(values),
            other => anyhow::bail!("Tensor '{name}' must be F32, got {:?}", other.ggml_type()),
        }
    }
}

fn read_key(mapper: &mut MemoryMapper) -> Result<String> {
    let key = mapper.read_string()?;

    if key.is_empty() || key.len() >= MAX_KEY_LEN {
        anyhow::bail!("Metadata key length {} is out of range", key.len());
    }
    let valid = key.split('.').all(|segment| {
        !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    });
    if !valid {
        anyhow::bail!("Invalid metadata key: '{key}'");
    }

    Ok(key)
}

fn read_value(mapper: &mut MemoryMapper, value_type: MetadataValueType) -> Result<MetadataValue> {
    Ok(match value_type {
        MetadataValueType::UInt8 => MetadataValue::UInt8(mapper.read_u8()?),
        MetadataValueType::Int8 => MetadataValue::Int8(mapper.read_u8()? as i8),
        MetadataValueType::UInt16 => MetadataValue::UInt16(mapper.read_u16()?),
        MetadataValueType::Int16 => MetadataValue::Int16(mapper.read_u16()? as i16),
        MetadataValueType::UInt32 => MetadataValue::UInt32(mapper.read_u32()?),
        MetadataValueType::Int32 => MetadataValue::Int32(mapper.read_u32()? as i32),
        MetadataValueType::Float32 => MetadataValue::Float32(mapper.read_f32()?),
        MetadataValueType::Bool => match mapper.read_u8()? {
            0 => MetadataValue::Bool(false),
            1 => MetadataValue::Bool(true),
            other => anyhow::bail!("Invalid bool value: {other}"),
        },
        MetadataValueType::String => MetadataValue::String(mapper.read_string()?),
        MetadataValueType::Array => {
            let element_type = MetadataValueType::try_from(mapper.read_u32()?)?;
            let len = mapper.read_len()?;
            // every element occupies at least one byte
            if len > mapper.len() - mapper.offset() {
                anyhow::bail!("Array of {len} elements exceeds the file size");
            }

            let values = (0..len).map(|_| read_value(mapper, element_type)).collect::<Result<Vec<_>>>()?;
            MetadataValue::Array(element_type, values)
        }
        MetadataValueType::UInt64 => MetadataValue::UInt64(mapper.read_u64()?),
        MetadataValueType::Int64 => MetadataValue::Int64(mapper.read_u64()? as i64),
        MetadataValueType::Float64 => MetadataValue::Float64(mapper.read_f64()?),
    })
}

fn read_tensor_info(mapper: &mut MemoryMapper, alignment: usize) -> Result<TensorInfo> {
    let name = mapper.read_string().context("Failed to read tensor name")?;
    if name.len() > MAX_TENSOR_NAME_LEN {
        anyhow::bail!("Tensor name '{name}' is longer than {MAX_TENSOR_NAME_LEN} bytes");
    }

    let n_dimensions = mapper.read_u32()? as usize;
    if !(1..=MAX_DIMENSIONS).contains(&n_dimensions) {
        anyhow::bail!("Tensor '{name}' has {n_dimensions} dimensions, expected 1..={MAX_DIMENSIONS}");
    }

    let dimensions = (0..n_dimensions).map(|_| mapper.read_len()).collect::<Result<Vec<_>>>()?;
    dimensions
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .with_context(|| format!("Element count of tensor '{name}' overflows"))?;

    let ggml_type = GgmlType::from_id(mapper.read_u32()?).with_context(|| format!("Tensor '{name}' has unknown type"))?;

    let offset = mapper.read_len()?;
    if offset % alignment != 0 {
        anyhow::bail!("Tensor '{name}' offset {offset} is not a multiple of the alignment {alignment}");
    }

    Ok(TensorInfo { name, dimensions, ggml_type, offset })
}
