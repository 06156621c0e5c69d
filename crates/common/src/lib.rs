//! BrainChat common library
//!
//! This crate contains the error taxonomy, configuration and metrics shared
//! by the engine and the chat session.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{ChatConfig, EngineConfig, MergeOrder};
pub use error::{BrainChatError, Result};
pub use metrics::{MetricsRegistry, METRICS};
