//! BrainChat Engine
//!
//! Loads model files, tokenizes utterances and generates replies by fanning
//! each request out across a fixed pool of worker threads.

pub mod dispatcher;
pub mod format;
pub mod kernel;
pub mod loader;
pub mod model;
pub mod tokenizer;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use dispatcher::{Fragment, ResponseDispatcher};
pub use format::ModelFormat;
pub use kernel::{FragmentGenerator, ModelGenerator, WorkerContext};
pub use loader::ModelLoader;
pub use model::ModelHandle;
pub use tokenizer::tokenize;
