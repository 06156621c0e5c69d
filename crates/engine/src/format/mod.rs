//! Model file formats
//!
//! The extension registry is closed: a path is dispatched on the text after
//! its last `.`, compared case-sensitively against [`REGISTRY`].

pub mod ggml;
pub mod gguf;
pub mod reader;

pub use ggml::GgmlModel;
pub use gguf::GgufModel;

use crate::kernel::WorkerContext;
use brainchat_common::{BrainChatError, Result};
use std::fmt;
use std::path::Path;

/// Supported model file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFormat {
    /// Legacy llama.cpp GGML family (`ggml`, `ggmf`, `ggjt`)
    Ggml,

    /// GGUF v2/v3
    Gguf,
}

/// Recognized extensions, one per format
pub const REGISTRY: &[(&str, ModelFormat)] = &[("ggml", ModelFormat::Ggml), ("gguf", ModelFormat::Gguf)];

impl ModelFormat {
    /// Look up an extension in the registry
    pub fn from_extension(extension: &str) -> Option<Self> {
        REGISTRY
            .iter()
            .find(|(ext, _)| *ext == extension)
            .map(|&(_, format)| format)
    }

    /// Determine the format of `path` from the text after its last `.`
    ///
    /// A path without any `.` is unsupported whatever its name; the whole
    /// path string is reported as its extension.
    pub fn detect(path: &Path) -> Result<Self> {
        let path = path.to_string_lossy();
        let extension = match path.rfind('.') {
            Some(idx) => &path[idx + 1..],
            None => return Err(BrainChatError::unsupported_format(path.into_owned())),
        };

        Self::from_extension(extension).ok_or_else(|| BrainChatError::unsupported_format(extension))
    }

    /// Canonical extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            ModelFormat::Ggml => "ggml",
            ModelFormat::Gguf => "gguf",
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Uniform surface of a parsed model, whatever its file format
pub trait FormatBackend: Send + Sync {
    /// Model architecture name
    fn architecture(&self) -> &str;

    /// Maximum number of tokens per request, when the file declares one
    fn context_length(&self) -> Option<usize>;

    /// Render this worker's fragment for `tokens`
    fn generate(&self, tokens: &[&str], worker: &WorkerContext<'_>) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_registered_extensions() {
        assert_eq!(ModelFormat::detect(Path::new("model.ggml")).unwrap(), ModelFormat::Ggml);
        assert_eq!(ModelFormat::detect(Path::new("/m/llama.q4.gguf")).unwrap(), ModelFormat::Gguf);
    }

    #[test]
    fn test_detect_is_case_sensitive() {
        let err = ModelFormat::detect(Path::new("model.GGUF")).unwrap_err();
        assert!(matches!(err, BrainChatError::UnsupportedFormat(ext) if ext == "GGUF"));
    }

    #[test]
    fn test_detect_rejects_unknown_and_missing_suffix() {
        for path in ["model.bin", "model.safetensors", "model", "model.", "dir.gguf/model", ".gguf.bak", "ggml", "gguf"] {
            let err = ModelFormat::detect(Path::new(path)).unwrap_err();
            assert!(
                matches!(err, BrainChatError::UnsupportedFormat(_)),
                "{} should be unsupported",
                path
            );
        }
    }

    #[test]
    fn test_hidden_file_with_registered_extension() {
        assert_eq!(ModelFormat::detect(Path::new(".gguf")).unwrap(), ModelFormat::Gguf);
    }
}
