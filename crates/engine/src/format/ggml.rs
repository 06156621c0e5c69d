//! Legacy GGML model files
//!
//! Layout: `u32` magic, a `u32` version for the versioned variants, seven
//! `i32` hyper-parameters, then `n_vocab` vocabulary entries. Tensor data
//! follows and is left in the mapping untouched.

use super::reader::ByteReader;
use super::FormatBackend;
use crate::kernel::{render_shard, WorkerContext};
use brainchat_common::{BrainChatError, Result};
use tracing::debug;

/// Magic of the original unversioned format
pub const MAGIC_GGML: u32 = 0x6767_6d6c;

/// Magic of the versioned format with vocabulary scores
pub const MAGIC_GGMF: u32 = 0x6767_6d66;

/// Magic of the mmap-friendly format with aligned tensors
pub const MAGIC_GGJT: u32 = 0x6767_6a74;

/// GGML container variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgmlVariant {
    Unversioned,
    Ggmf,
    Ggjt,
}

impl GgmlVariant {
    fn has_scores(&self) -> bool {
        !matches!(self, GgmlVariant::Unversioned)
    }
}

/// Hyper-parameters stored after the magic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgmlHyperParams {
    pub n_vocab: u32,
    pub n_embd: u32,
    pub n_mult: u32,
    pub n_head: u32,
    pub n_layer: u32,
    pub n_rot: u32,
    pub ftype: u32,
}

/// Parsed GGML header and vocabulary
#[derive(Debug, Clone)]
pub struct GgmlModel {
    pub variant: GgmlVariant,
    pub version: u32,
    pub hparams: GgmlHyperParams,
    pub vocab: Vec<String>,

    /// Offset of the first byte after the vocabulary
    pub tensor_offset: usize,
}

impl GgmlModel {
    /// Parse a mapped GGML file
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);

        let magic = reader.read_u32("magic")?;
        let (variant, version) = match magic {
            MAGIC_GGML => (GgmlVariant::Unversioned, 0),
            MAGIC_GGMF => (GgmlVariant::Ggmf, reader.read_u32("version")?),
            MAGIC_GGJT => (GgmlVariant::Ggjt, reader.read_u32("version")?),
            other => {
                return Err(BrainChatError::load_failure(format!(
                    "bad GGML magic 0x{:08x}",
                    other
                )));
            }
        };

        let supported = match variant {
            GgmlVariant::Unversioned => true,
            GgmlVariant::Ggmf => version == 1,
            GgmlVariant::Ggjt => (1..=3).contains(&version),
        };
        if !supported {
            return Err(BrainChatError::load_failure(format!(
                "unsupported {:?} version {}",
                variant, version
            )));
        }

        let hparams = Self::read_hparams(&mut reader)?;
        debug!("GGML {:?} v{} hparams: {:?}", variant, version, hparams);

        let min_entry = if variant.has_scores() { 8 } else { 4 };
        let n_vocab = reader.check_count(u64::from(hparams.n_vocab), "n_vocab", min_entry)?;
        let mut vocab = Vec::with_capacity(n_vocab);
        for _ in 0..n_vocab {
            let len = reader.read_u32("vocab entry length")? as usize;
            let text = reader.read_bytes(len, "vocab entry")?;
            // Byte-level vocabularies contain partial UTF-8 sequences
            vocab.push(String::from_utf8_lossy(text).into_owned());
            if variant.has_scores() {
                reader.read_f32("vocab score")?;
            }
        }

        Ok(Self {
            variant,
            version,
            hparams,
            vocab,
            tensor_offset: reader.position(),
        })
    }

    fn read_hparams(reader: &mut ByteReader<'_>) -> Result<GgmlHyperParams> {
        let mut field = |name: &str, positive: bool| -> Result<u32> {
            let value = reader.read_i32(name)?;
            if value < 0 || (positive && value == 0) {
                return Err(BrainChatError::load_failure(format!(
                    "invalid hyper-parameter {} = {}",
                    name, value
                )));
            }
            Ok(value as u32)
        };

        Ok(GgmlHyperParams {
            n_vocab: field("n_vocab", true)?,
            n_embd: field("n_embd", true)?,
            n_mult: field("n_mult", false)?,
            n_head: field("n_head", true)?,
            n_layer: field("n_layer", true)?,
            n_rot: field("n_rot", false)?,
            ftype: field("ftype", false)?,
        })
    }
}

impl FormatBackend for GgmlModel {
    fn architecture(&self) -> &str {
        // The legacy container only ever carried LLaMA-family weights
        "llama"
    }

    fn context_length(&self) -> Option<usize> {
        None
    }

    fn generate(&self, tokens: &[&str], worker: &WorkerContext<'_>) -> Result<String> {
        render_shard(tokens, worker)
    }
}
