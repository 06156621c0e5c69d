//! Loaded model handles
//!
//! A [`ModelHandle`] owns the memory map of a model file together with the
//! parsed form of its header. The payload is present exactly when the handle
//! is loaded; workers share the handle read-only.

use crate::format::{FormatBackend, GgmlModel, GgufModel, ModelFormat};
use crate::kernel::WorkerContext;
use brainchat_common::{BrainChatError, Result};
use memmap2::Mmap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Parsed model, one variant per supported format
#[derive(Debug)]
pub enum FormatModel {
    Ggml(GgmlModel),
    Gguf(GgufModel),
}

impl FormatModel {
    /// Format this variant was parsed from
    pub fn format(&self) -> ModelFormat {
        match self {
            FormatModel::Ggml(_) => ModelFormat::Ggml,
            FormatModel::Gguf(_) => ModelFormat::Gguf,
        }
    }

    fn backend(&self) -> &dyn FormatBackend {
        match self {
            FormatModel::Ggml(model) => model,
            FormatModel::Gguf(model) => model,
        }
    }
}

/// Memory-mapped weights plus their parsed header
pub struct ModelPayload {
    weights: Mmap,
    model: FormatModel,
}

impl ModelPayload {
    pub fn new(weights: Mmap, model: FormatModel) -> Self {
        Self { weights, model }
    }

    /// Raw mapped file contents
    pub fn weights(&self) -> &[u8] {
        &self.weights
    }

    pub fn model(&self) -> &FormatModel {
        &self.model
    }
}

impl fmt::Debug for ModelPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelPayload")
            .field("mapped_bytes", &self.weights.len())
            .field("model", &self.model)
            .finish()
    }
}

/// A model loaded from disk, tagged with its format
#[derive(Debug)]
pub struct ModelHandle {
    path: PathBuf,
    format: ModelFormat,
    payload: Option<ModelPayload>,
}

impl ModelHandle {
    /// Wrap a payload loaded from `path`
    ///
    /// The handle's format is the declared (extension) format; a payload of a
    /// different format is a load failure.
    pub fn new(path: impl Into<PathBuf>, format: ModelFormat, payload: ModelPayload) -> Result<Self> {
        if payload.model.format() != format {
            return Err(BrainChatError::load_failure(format!(
                "{} payload cannot back a {} handle",
                payload.model.format(),
                format
            )));
        }

        Ok(Self {
            path: path.into(),
            format,
            payload: Some(payload),
        })
    }

    /// Whether the payload is present
    pub fn is_loaded(&self) -> bool {
        self.payload.is_some()
    }

    pub fn format(&self) -> ModelFormat {
        self.format
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn payload(&self) -> Option<&ModelPayload> {
        self.payload.as_ref()
    }

    /// Mapped size in bytes (0 once unloaded)
    pub fn memory_usage_bytes(&self) -> usize {
        self.payload.as_ref().map_or(0, |p| p.weights.len())
    }

    /// Architecture declared by the model file
    pub fn architecture(&self) -> Option<&str> {
        self.payload.as_ref().map(|p| p.model.backend().architecture())
    }

    /// Maximum request length declared by the model file
    pub fn context_length(&self) -> Option<usize> {
        self.payload
            .as_ref()
            .and_then(|p| p.model.backend().context_length())
    }

    /// Drop the mapped weights; the handle reports unloaded afterwards
    pub fn unload(&mut self) {
        self.payload = None;
    }

    /// Run the format backend for one worker
    pub fn generate(&self, tokens: &[&str], worker: &WorkerContext<'_>) -> Result<String> {
        let payload = self.payload.as_ref().ok_or_else(|| {
            BrainChatError::invalid_input(format!("model {} is not loaded", self.path.display()))
        })?;
        payload.model.backend().generate(tokens, worker)
    }
}

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.architecture() {
            Some(arch) => write!(
                f,
                "{} ({} {}, {:.2} MB)",
                self.path.display(),
                self.format,
                arch,
                self.memory_usage_bytes() as f64 / (1024.0 * 1024.0)
            ),
            None => write!(f, "{} ({}, unloaded)", self.path.display(), self.format),
        }
    }
}
