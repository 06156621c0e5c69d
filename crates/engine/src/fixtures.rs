//! Byte builders for small but valid model files
//!
//! Used by this crate's tests and, through the `fixtures` feature, by the
//! session tests and benchmarks.

use crate::format::ggml::MAGIC_GGJT;
use crate::format::gguf::{GgufValueType, DEFAULT_ALIGNMENT, MAGIC};

/// A GGJT v3 file with a three-entry vocabulary and no tensor data
pub fn ggml_bytes() -> Vec<u8> {
    let mut bytes = MAGIC_GGJT.to_le_bytes().to_vec();
    bytes.extend_from_slice(&3u32.to_le_bytes());

    // n_vocab, n_embd, n_mult, n_head, n_layer, n_rot, ftype
    for value in [3i32, 8, 4, 2, 1, 4, 0] {
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    for (text, score) in [("<unk>", 0.0f32), ("hello", -1.0), ("world", -2.0)] {
        bytes.extend_from_slice(&(text.len() as u32).to_le_bytes());
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(&score.to_le_bytes());
    }

    bytes
}

/// A GGUF v3 llama file with a 2048-token context and one f32 tensor
pub fn gguf_bytes() -> Vec<u8> {
    GgufBuilder::new(3)
        .kv_str("general.architecture", "llama")
        .kv_u32("llama.context_length", 2048)
        .tensor("token_embd.weight", &[4, 3], 0, 0)
        .data(&[0u8; 48])
        .build()
}

/// Incremental GGUF writer
#[derive(Debug, Clone)]
pub struct GgufBuilder {
    version: u32,
    kv: Vec<u8>,
    kv_count: u64,
    tensors: Vec<u8>,
    tensor_count: u64,
    data: Vec<u8>,
}

impl GgufBuilder {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            kv: Vec::new(),
            kv_count: 0,
            tensors: Vec::new(),
            tensor_count: 0,
            data: Vec::new(),
        }
    }

    fn key(mut self, key: &str, ty: GgufValueType) -> Self {
        put_string(&mut self.kv, key);
        self.kv.extend_from_slice(&(ty as u32).to_le_bytes());
        self.kv_count += 1;
        self
    }

    pub fn kv_str(mut self, key: &str, value: &str) -> Self {
        self = self.key(key, GgufValueType::String);
        put_string(&mut self.kv, value);
        self
    }

    pub fn kv_u32(mut self, key: &str, value: u32) -> Self {
        self = self.key(key, GgufValueType::U32);
        self.kv.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn kv_f32(mut self, key: &str, value: f32) -> Self {
        self = self.key(key, GgufValueType::F32);
        self.kv.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn kv_bool(mut self, key: &str, value: bool) -> Self {
        self = self.key(key, GgufValueType::Bool);
        self.kv.push(u8::from(value));
        self
    }

    pub fn kv_str_array(mut self, key: &str, values: &[&str]) -> Self {
        self = self.key(key, GgufValueType::Array);
        self.kv.extend_from_slice(&(GgufValueType::String as u32).to_le_bytes());
        self.kv.extend_from_slice(&(values.len() as u64).to_le_bytes());
        for value in values {
            put_string(&mut self.kv, value);
        }
        self
    }

    pub fn tensor(mut self, name: &str, dims: &[u64], ggml_type: u32, offset: u64) -> Self {
        put_string(&mut self.tensors, name);
        self.tensors.extend_from_slice(&(dims.len() as u32).to_le_bytes());
        for dim in dims {
            self.tensors.extend_from_slice(&dim.to_le_bytes());
        }
        self.tensors.extend_from_slice(&ggml_type.to_le_bytes());
        self.tensors.extend_from_slice(&offset.to_le_bytes());
        self.tensor_count += 1;
        self
    }

    /// Tensor data written after the aligned header
    pub fn data(mut self, data: &[u8]) -> Self {
        self.data.extend_from_slice(data);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.tensor_count.to_le_bytes());
        bytes.extend_from_slice(&self.kv_count.to_le_bytes());
        bytes.extend_from_slice(&self.kv);
        bytes.extend_from_slice(&self.tensors);

        if self.tensor_count > 0 {
            let padding = (DEFAULT_ALIGNMENT - bytes.len() % DEFAULT_ALIGNMENT) % DEFAULT_ALIGNMENT;
            bytes.resize(bytes.len() + padding, 0);
        }
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u64).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}
