//! Configuration structures for BrainChat
//!
//! Configuration is loaded from a YAML file (a JSON object is also accepted)
//! and can be overridden by environment variables. Every key is optional, so
//! an empty mapping `{}` yields the defaults.

use crate::error::{BrainChatError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `engine.worker_threads`
pub const ENV_WORKER_THREADS: &str = "BRAINCHAT_WORKER_THREADS";

/// Environment variable overriding `observability.log_level`
pub const ENV_LOG_LEVEL: &str = "BRAINCHAT_LOG_LEVEL";

/// Top-level configuration for a chat session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChatConfig {
    /// Response generation settings
    pub engine: EngineConfig,

    /// Interactive loop settings
    pub session: SessionConfig,

    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

/// Response dispatcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of worker threads (0 = host parallelism)
    pub worker_threads: usize,

    /// Order in which worker fragments are concatenated
    pub merge_order: MergeOrder,

    /// Per-request deadline in milliseconds (none = wait indefinitely)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

/// Fragment merge order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOrder {
    /// Fragments are appended as workers finish; varies between runs
    #[default]
    Completion,

    /// Fragments are appended by ascending worker index
    WorkerIndex,
}

/// Interactive loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Prompt written before each input line
    pub prompt: String,

    /// Prefix written before each reply
    pub reply_prefix: String,
}

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Write Prometheus text metrics here when the session ends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            merge_order: MergeOrder::default(),
            request_timeout_ms: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
            reply_prefix: default_reply_prefix(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_file: None,
        }
    }
}

/// Default value functions
fn default_worker_threads() -> usize {
    0 // Means use host parallelism
}

fn default_prompt() -> String {
    "You: ".to_string()
}

fn default_reply_prefix() -> String {
    "Brain: ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Get the request timeout as Duration
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

impl ChatConfig {
    /// Load configuration from a YAML or JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BrainChatError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config = Self::parse(&content).map_err(|e| {
            BrainChatError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load a session configuration: file, then environment, then validation
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory document
    pub fn parse(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        // An empty document is not a mapping to serde_yaml
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(threads) = lookup(ENV_WORKER_THREADS) {
            self.engine.worker_threads = threads.trim().parse().map_err(|_| {
                BrainChatError::config(format!("Invalid {}: {:?}", ENV_WORKER_THREADS, threads))
            })?;
        }

        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.observability.log_level = level;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.observability.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(BrainChatError::config(format!("Invalid log level: {}", other)));
            }
        }

        if self.engine.request_timeout_ms == Some(0) {
            return Err(BrainChatError::config("request_timeout_ms must be greater than zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = ChatConfig::parse("{}").unwrap();
        assert_eq!(config, ChatConfig::default());
        assert_eq!(config.engine.worker_threads, 0);
        assert_eq!(config.engine.merge_order, MergeOrder::Completion);
        assert_eq!(config.session.prompt, "You: ");
    }

    #[test]
    fn test_blank_document_uses_defaults() {
        assert_eq!(ChatConfig::parse("  \n").unwrap(), ChatConfig::default());
    }

    #[test]
    fn test_yaml_and_json_documents() {
        let yaml = "engine:\n  worker_threads: 3\n  merge_order: worker_index\n  request_timeout_ms: 250\n";
        let config = ChatConfig::parse(yaml).unwrap();
        assert_eq!(config.engine.worker_threads, 3);
        assert_eq!(config.engine.merge_order, MergeOrder::WorkerIndex);
        assert_eq!(config.engine.request_timeout(), Some(Duration::from_millis(250)));

        let json = r#"{"session": {"reply_prefix": "Bot: "}}"#;
        let config = ChatConfig::parse(json).unwrap();
        assert_eq!(config.session.reply_prefix, "Bot: ");
        assert_eq!(config.session.prompt, "You: ");
    }

    #[test]
    fn test_from_file_rejects_malformed_document() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ engine: [").unwrap();

        let err = ChatConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, BrainChatError::Config(_)));
    }

    #[test]
    fn test_from_file_missing_file() {
        let err = ChatConfig::from_file("/nonexistent/brainchat.yaml").unwrap_err();
        assert!(matches!(err, BrainChatError::Config(_)));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(ChatConfig::parse("{\"engin\": {}}").is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = ChatConfig::default();
        assert!(config.validate().is_ok());

        config.observability.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = ChatConfig::default();
        config.engine.request_timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> =
            [(ENV_WORKER_THREADS, "6"), (ENV_LOG_LEVEL, "debug")].into_iter().collect();

        let mut config = ChatConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.engine.worker_threads, 6);
        assert_eq!(config.observability.log_level, "debug");

        let err = config
            .apply_overrides(|key| (key == ENV_WORKER_THREADS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, BrainChatError::Config(_)));
    }
}
