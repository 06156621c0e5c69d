//! Chat session orchestration
//!
//! A session owns the loaded model and the response dispatcher for its whole
//! lifetime. Startup failures are returned from the constructors; failures
//! while answering a line are reported for that line and the loop goes on.

use brainchat_common::{BrainChatError, ChatConfig, Result, METRICS};
use brainchat_engine::{tokenize, FragmentGenerator, ModelGenerator, ModelHandle, ModelLoader, ResponseDispatcher};
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Input line that ends the session
pub const EXIT_COMMAND: &str = "exit";

/// Banner written when the loop starts
const BANNER: &str = "Starting chat session...";

/// Outcome of a finished session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Lines answered or attempted, excluding the exit command
    pub turns: usize,

    /// Lines whose reply failed
    pub failed_turns: usize,
}

/// A loaded model plus the worker pool that answers with it
#[derive(Debug)]
pub struct ChatSession {
    model: ModelHandle,
    dispatcher: ResponseDispatcher,
    config: ChatConfig,
}

impl ChatSession {
    /// Load the model, then the configuration, and build the worker pool
    pub fn start<M: AsRef<Path>, C: AsRef<Path>>(model_path: M, config_path: C) -> Result<Self> {
        let model = ModelLoader::load(model_path)?;
        let config = ChatConfig::load(config_path)?;
        Self::new(model, config)
    }

    /// Build a session around an already loaded model
    pub fn new(model: ModelHandle, config: ChatConfig) -> Result<Self> {
        Self::with_generator(model, config, Arc::new(ModelGenerator))
    }

    /// Build a session with a custom generate capability
    pub fn with_generator(
        model: ModelHandle,
        config: ChatConfig,
        generator: Arc<dyn FragmentGenerator>,
    ) -> Result<Self> {
        if !model.is_loaded() {
            return Err(BrainChatError::load_failure(format!(
                "model {} is not loaded",
                model.path().display()
            )));
        }

        let dispatcher = ResponseDispatcher::new(&config.engine, generator)?;
        info!(
            "Chat session ready: model={}, workers={}, merge_order={:?}",
            model,
            dispatcher.worker_count(),
            dispatcher.merge_order()
        );

        Ok(Self {
            model,
            dispatcher,
            config,
        })
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.dispatcher.worker_count()
    }

    /// Answer one utterance
    pub fn respond(&self, input: &str) -> Result<String> {
        let tokens = tokenize(input);
        debug!("Tokenized input into {} tokens", tokens.len());
        self.dispatcher.respond(&tokens, &self.model)
    }

    /// Replace the loaded model
    ///
    /// On failure the current model stays loaded.
    pub fn reload_model<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let model = ModelLoader::load(path)?;
        info!("Replacing model {} with {}", self.model, model);
        self.model = model;
        Ok(())
    }

    /// Run the read loop until `exit` or end of input
    pub fn run<R: BufRead, W: Write>(&self, mut input: R, mut output: W) -> Result<SessionSummary> {
        let mut summary = SessionSummary::default();
        let mut buf = Vec::new();

        writeln!(output, "{}", BANNER)?;
        loop {
            write!(output, "{}", self.config.session.prompt)?;
            output.flush()?;

            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                // Leave the prompt line terminated
                writeln!(output)?;
                info!("End of input, closing session");
                break;
            }

            let line = String::from_utf8_lossy(&buf);
            let utterance = trim_line_ending(&line);
            if utterance == EXIT_COMMAND {
                info!("Exit requested");
                break;
            }

            summary.turns += 1;
            match self.respond(utterance) {
                Ok(reply) => {
                    writeln!(output, "{}{}", self.config.session.reply_prefix, reply)?;
                }
                Err(e) => {
                    summary.failed_turns += 1;
                    warn!("Turn {} failed: {}", summary.turns, e);
                    writeln!(output, "Error: {}", e)?;
                }
            }
        }

        output.flush()?;
        info!(
            "Chat session finished: {} turns, {} failed",
            summary.turns, summary.failed_turns
        );
        Ok(summary)
    }

    /// End the session, writing metrics if configured
    pub fn shutdown(self) -> Result<()> {
        if let Some(path) = &self.config.observability.metrics_file {
            let text = METRICS
                .gather()
                .map_err(|e| BrainChatError::internal(format!("Failed to gather metrics: {}", e)))?;
            std::fs::write(path, text)?;
            info!("Metrics written to {}", path.display());
        }
        Ok(())
    }
}

fn trim_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}
