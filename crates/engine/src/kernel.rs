//! The generate capability and the reference kernel
//!
//! A worker produces one fragment per request through [`FragmentGenerator`].
//! The default generator, [`ModelGenerator`], forwards to the loaded model,
//! whose format backends render their token shard with [`render_shard`].

use crate::model::ModelHandle;
use brainchat_common::{BrainChatError, Result};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-worker view of a request
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext<'a> {
    /// Index of this worker in `[0, worker_count)`
    pub worker_index: usize,

    /// Number of workers taking part in the request
    pub worker_count: usize,

    cancel: &'a AtomicBool,
}

impl<'a> WorkerContext<'a> {
    pub fn new(worker_index: usize, worker_count: usize, cancel: &'a AtomicBool) -> Self {
        Self {
            worker_index,
            worker_count,
            cancel,
        }
    }

    /// Whether the request deadline has passed
    ///
    /// Long-running generators should poll this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// Produces one worker's fragment of a reply
///
/// Called concurrently from every worker of a request with the same tokens
/// and model; implementations must not mutate shared state in the model.
pub trait FragmentGenerator: Send + Sync {
    fn generate(&self, tokens: &[&str], worker: &WorkerContext<'_>, model: &ModelHandle) -> Result<String>;
}

/// Generator that runs the loaded model's own backend
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelGenerator;

impl FragmentGenerator for ModelGenerator {
    fn generate(&self, tokens: &[&str], worker: &WorkerContext<'_>, model: &ModelHandle) -> Result<String> {
        model.generate(tokens, worker)
    }
}

/// Contiguous range of token indices owned by a worker
pub fn shard_bounds(token_count: usize, worker_index: usize, worker_count: usize) -> Range<usize> {
    let workers = worker_count.max(1);
    let start = worker_index * token_count / workers;
    let end = ((worker_index + 1) * token_count / workers).min(token_count);
    start.min(end)..end
}

/// Reference kernel: render this worker's shard of the input
///
/// Every token except the first of the request gets one leading space, so
/// concatenating all shards by worker index reproduces the input text.
pub fn render_shard(tokens: &[&str], worker: &WorkerContext<'_>) -> Result<String> {
    if worker.is_cancelled() {
        return Err(BrainChatError::timeout(format!(
            "worker {} cancelled before rendering",
            worker.worker_index
        )));
    }

    let range = shard_bounds(tokens.len(), worker.worker_index, worker.worker_count);
    let mut fragment = String::new();
    for idx in range {
        if idx > 0 {
            fragment.push(' ');
        }
        fragment.push_str(tokens[idx]);
    }
    Ok(fragment)
}
