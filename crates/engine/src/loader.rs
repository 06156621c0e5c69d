//! Format-polymorphic model loading
//!
//! The extension picks the sub-loader; the sub-loader maps the file and
//! parses its header. The `File` is closed before returning on every path,
//! only the map is kept.

use crate::format::{GgmlModel, GgufModel, ModelFormat, REGISTRY};
use crate::model::{FormatModel, ModelHandle, ModelPayload};
use brainchat_common::{BrainChatError, Result, METRICS};
use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

/// Entry point for loading model files
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelLoader;

impl ModelLoader {
    /// Load the model at `path`
    ///
    /// Fails with `UnsupportedFormat` before touching the file when the
    /// extension is not registered, with `Io` when the file cannot be read and
    /// with `LoadFailure` when its contents are invalid.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ModelHandle> {
        let path = path.as_ref();
        let result = ModelFormat::detect(path).and_then(|format| Self::load_format(path, format));

        match &result {
            Ok(handle) => {
                METRICS.models.loads_total.inc();
                METRICS
                    .models
                    .resident_bytes
                    .set(handle.memory_usage_bytes() as i64);
                info!("Model loaded: {}", handle);
            }
            Err(e) => {
                METRICS.models.load_failures_total.inc();
                warn!("Failed to load model {}: {}", path.display(), e);
            }
        }

        result
    }

    /// Extensions in the registry
    pub fn supported_extensions() -> impl Iterator<Item = &'static str> {
        REGISTRY.iter().map(|(ext, _)| *ext)
    }

    fn load_format(path: &Path, format: ModelFormat) -> Result<ModelHandle> {
        info!("Loading {} model from {}", format, path.display());

        let weights = map_file(path)?;
        let model = match format {
            ModelFormat::Ggml => FormatModel::Ggml(GgmlModel::parse(&weights)?),
            ModelFormat::Gguf => FormatModel::Gguf(GgufModel::parse(&weights)?),
        };

        let handle = ModelHandle::new(path, format, ModelPayload::new(weights, model))?;
        if !handle.is_loaded() {
            return Err(BrainChatError::load_failure(format!(
                "{} produced no payload",
                path.display()
            )));
        }

        Ok(handle)
    }
}

/// Memory-map `path` read-only
fn map_file(path: &Path) -> Result<Mmap> {
    let with_path = |e: io::Error| io::Error::new(e.kind(), format!("{}: {}", path.display(), e));

    let file = File::open(path).map_err(with_path)?;
    let metadata = file.metadata().map_err(with_path)?;
    if metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{}: is a directory", path.display()),
        )
        .into());
    }
    if metadata.len() == 0 {
        return Err(BrainChatError::load_failure(format!("{} is empty", path.display())));
    }

    // SAFETY: the map is read-only; a concurrent writer truncating the file
    // is outside what this process can guard against.
    let mmap = unsafe { Mmap::map(&file) }.map_err(with_path)?;
    debug!("Mapped {} bytes from {}", mmap.len(), path.display());

    Ok(mmap)
}
