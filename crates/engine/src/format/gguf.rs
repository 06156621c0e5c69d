//! GGUF model files
//!
//! Parses the header, the typed metadata key/value section and the tensor
//! descriptors. Metadata values are kept as JSON so callers can inspect them
//! without knowing the GGUF type tags.

use super::reader::ByteReader;
use super::FormatBackend;
use crate::kernel::{render_shard, WorkerContext};
use brainchat_common::{BrainChatError, Result};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// File magic
pub const MAGIC: &[u8; 4] = b"GGUF";

/// Default tensor data alignment when `general.alignment` is absent
pub const DEFAULT_ALIGNMENT: usize = 32;

/// Maximum tensor rank
pub const MAX_DIMS: u32 = 4;

/// Nesting limit for array values
const MAX_ARRAY_DEPTH: usize = 8;

/// Metadata value type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GgufValueType {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    F32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    U64 = 10,
    I64 = 11,
    F64 = 12,
}

impl GgufValueType {
    pub fn from_u32(tag: u32) -> Option<Self> {
        use GgufValueType::*;
        Some(match tag {
            0 => U8,
            1 => I8,
            2 => U16,
            3 => I16,
            4 => U32,
            5 => I32,
            6 => F32,
            7 => Bool,
            8 => String,
            9 => Array,
            10 => U64,
            11 => I64,
            12 => F64,
            _ => return None,
        })
    }

    /// Smallest encoded size of one value of this type
    fn min_size(&self) -> usize {
        use GgufValueType::*;
        match self {
            U8 | I8 | Bool => 1,
            U16 | I16 => 2,
            U32 | I32 | F32 => 4,
            U64 | I64 | F64 | String => 8,
            Array => 12,
        }
    }
}

/// Tensor descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufTensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub ggml_type: u32,

    /// Offset relative to the start of the data section
    pub offset: u64,
}

/// Parsed GGUF header
#[derive(Debug, Clone)]
pub struct GgufModel {
    pub version: u32,
    pub metadata: BTreeMap<String, Value>,
    pub tensors: Vec<GgufTensorInfo>,
    pub alignment: usize,

    /// Absolute offset of the tensor data section
    pub data_offset: usize,
}

impl GgufModel {
    /// Parse a mapped GGUF file
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);

        let magic = reader.read_bytes(MAGIC.len(), "magic")?;
        if magic != MAGIC {
            return Err(BrainChatError::load_failure(format!("bad GGUF magic {:02x?}", magic)));
        }

        let version = reader.read_u32("version")?;
        if !(2..=3).contains(&version) {
            return Err(BrainChatError::load_failure(format!(
                "unsupported GGUF version {}",
                version
            )));
        }

        let tensor_count = reader.read_u64("tensor count")?;
        let kv_count = reader.read_u64("metadata count")?;

        let kv_count = reader.check_count(kv_count, "metadata count", 13)?;
        let mut metadata = BTreeMap::new();
        for _ in 0..kv_count {
            let key = read_string(&mut reader, "metadata key")?;
            let tag = reader.read_u32("metadata value type")?;
            let value = read_value(&mut reader, tag, 0)?;
            if metadata.insert(key.clone(), value).is_some() {
                return Err(BrainChatError::load_failure(format!("duplicate metadata key {}", key)));
            }
        }

        let alignment = match metadata.get("general.alignment") {
            None => DEFAULT_ALIGNMENT,
            Some(value) => value
                .as_u64()
                .filter(|a| *a > 0 && a.is_power_of_two())
                .map(|a| a as usize)
                .ok_or_else(|| {
                    BrainChatError::load_failure(format!("invalid general.alignment {}", value))
                })?,
        };

        let tensor_count = reader.check_count(tensor_count, "tensor count", 24)?;
        let mut tensors = Vec::with_capacity(tensor_count);
        for _ in 0..tensor_count {
            tensors.push(read_tensor_info(&mut reader, alignment)?);
        }

        // Vocabulary-only files end right after the header
        if !tensors.is_empty() {
            reader.align_to(alignment)?;
        }
        let data_offset = reader.position();

        debug!(
            "GGUF v{}: {} metadata keys, {} tensors, data at {}",
            version,
            metadata.len(),
            tensors.len(),
            data_offset
        );

        Ok(Self {
            version,
            metadata,
            tensors,
            alignment,
            data_offset,
        })
    }

    /// Look up a metadata value
    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

fn read_string(reader: &mut ByteReader<'_>, what: &str) -> Result<String> {
    let len = reader.read_count(what, 1)?;
    reader.read_str(len, what)
}

fn read_value(reader: &mut ByteReader<'_>, tag: u32, depth: usize) -> Result<Value> {
    let ty = GgufValueType::from_u32(tag)
        .ok_or_else(|| BrainChatError::load_failure(format!("unknown metadata value type {}", tag)))?;

    let value = match ty {
        GgufValueType::U8 => Value::from(reader.read_u8("u8 value")?),
        GgufValueType::I8 => Value::from(reader.read_i8("i8 value")?),
        GgufValueType::U16 => Value::from(reader.read_u16("u16 value")?),
        GgufValueType::I16 => Value::from(reader.read_i16("i16 value")?),
        GgufValueType::U32 => Value::from(reader.read_u32("u32 value")?),
        GgufValueType::I32 => Value::from(reader.read_i32("i32 value")?),
        GgufValueType::U64 => Value::from(reader.read_u64("u64 value")?),
        GgufValueType::I64 => Value::from(reader.read_i64("i64 value")?),
        GgufValueType::F32 => float(f64::from(reader.read_f32("f32 value")?)),
        GgufValueType::F64 => float(reader.read_f64("f64 value")?),
        GgufValueType::Bool => match reader.read_u8("bool value")? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(BrainChatError::load_failure(format!("invalid bool value {}", other)));
            }
        },
        GgufValueType::String => Value::String(read_string(reader, "string value")?),
        GgufValueType::Array => {
            if depth >= MAX_ARRAY_DEPTH {
                return Err(BrainChatError::load_failure("metadata arrays nested too deeply"));
            }
            let item_tag = reader.read_u32("array item type")?;
            let item_type = GgufValueType::from_u32(item_tag).ok_or_else(|| {
                BrainChatError::load_failure(format!("unknown array item type {}", item_tag))
            })?;
            let len = reader.read_count("array length", item_type.min_size())?;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(read_value(reader, item_tag, depth + 1)?);
            }
            Value::Array(items)
        }
    };

    Ok(value)
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn read_tensor_info(reader: &mut ByteReader<'_>, alignment: usize) -> Result<GgufTensorInfo> {
    let name = read_string(reader, "tensor name")?;
    let n_dims = reader.read_u32("tensor rank")?;
    if n_dims > MAX_DIMS {
        return Err(BrainChatError::load_failure(format!(
            "tensor {} has rank {} (max {})",
            name, n_dims, MAX_DIMS
        )));
    }

    let mut dims = Vec::with_capacity(n_dims as usize);
    for _ in 0..n_dims {
        dims.push(reader.read_u64("tensor dimension")?);
    }

    let ggml_type = reader.read_u32("tensor type")?;
    let offset = reader.read_u64("tensor offset")?;
    if offset % alignment as u64 != 0 {
        return Err(BrainChatError::load_failure(format!(
            "tensor {} offset {} is not aligned to {}",
            name, offset, alignment
        )));
    }

    Ok(GgufTensorInfo {
        name,
        dims,
        ggml_type,
        offset,
    })
}

impl FormatBackend for GgufModel {
    fn architecture(&self) -> &str {
        self.metadata("general.architecture")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }

    fn context_length(&self) -> Option<usize> {
        let key = format!("{}.context_length", self.architecture());
        self.metadata(&key)
            .and_then(Value::as_u64)
            .map(|len| len as usize)
    }

    fn generate(&self, tokens: &[&str], worker: &WorkerContext<'_>) -> Result<String> {
        if let Some(limit) = self.context_length() {
            if tokens.len() > limit {
                return Err(BrainChatError::invalid_input(format!(
                    "{} tokens exceed the model context length {}",
                    tokens.len(),
                    limit
                )));
            }
        }
        render_shard(tokens, worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, GgufBuilder};
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_parse_fixture() {
        let model = GgufModel::parse(&fixtures::gguf_bytes()).unwrap();

        assert_eq!(model.version, 3);
        assert_eq!(model.architecture(), "llama");
        assert_eq!(model.context_length(), Some(2048));
        assert_eq!(model.tensors.len(), 1);
        assert_eq!(model.tensors[0].name, "token_embd.weight");
        assert_eq!(model.tensors[0].dims, vec![4, 3]);
        assert_eq!(model.data_offset % DEFAULT_ALIGNMENT, 0);
    }

    #[test]
    fn test_metadata_value_types() {
        let bytes = GgufBuilder::new(2)
            .kv_str("general.name", "tiny")
            .kv_bool("general.quantized", true)
            .kv_f32("llama.rope.freq_base", 10000.0)
            .kv_str_array("tokenizer.ggml.tokens", &["a", "b"])
            .build();
        let model = GgufModel::parse(&bytes).unwrap();

        assert_eq!(model.metadata("general.name"), Some(&Value::from("tiny")));
        assert_eq!(model.metadata("general.quantized"), Some(&Value::Bool(true)));
        assert_eq!(
            model.metadata("llama.rope.freq_base").and_then(Value::as_f64),
            Some(10000.0)
        );
        assert_eq!(
            model.metadata("tokenizer.ggml.tokens"),
            Some(&serde_json::json!(["a", "b"]))
        );
        assert_eq!(model.architecture(), "unknown");
        assert_eq!(model.context_length(), None);
    }

    #[test]
    fn test_bad_magic_and_version() {
        let err = GgufModel::parse(b"GGML\x03\x00\x00\x00").unwrap_err();
        assert!(err.to_string().contains("magic"));

        let err = GgufModel::parse(&GgufBuilder::new(1).build()).unwrap_err();
        assert!(err.to_string().contains("version 1"));
    }

    #[test]
    fn test_unknown_value_type() {
        let mut bytes = GgufBuilder::new(3).build();
        // Patch the kv count and append an entry with tag 99
        bytes[16..24].copy_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(b"k");
        bytes.extend_from_slice(&99u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 8]);

        let err = GgufModel::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("unknown metadata value type 99"));
    }

    #[test]
    fn test_misaligned_tensor_offset() {
        let bytes = GgufBuilder::new(3)
            .tensor("w", &[2], 0, 7)
            .build();
        let err = GgufModel::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("not aligned"));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = fixtures::gguf_bytes();
        for cut in [3, 10, 30, bytes.len() / 2] {
            let err = GgufModel::parse(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, BrainChatError::LoadFailure(_)), "cut at {}", cut);
        }
    }

    #[test]
    fn test_generate_respects_context_length() {
        let bytes = GgufBuilder::new(3)
            .kv_str("general.architecture", "llama")
            .kv_u32("llama.context_length", 2)
            .build();
        let model = GgufModel::parse(&bytes).unwrap();
        let cancel = AtomicBool::new(false);
        let worker = WorkerContext::new(0, 1, &cancel);

        assert_eq!(model.generate(&["a", "b"], &worker).unwrap(), "a b");
        let err = model.generate(&["a", "b", "c"], &worker).unwrap_err();
        assert!(matches!(err, BrainChatError::InvalidInput(_)));
    }
}
