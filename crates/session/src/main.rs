//! BrainChat - Main Entry Point
//!
//! Loads a model and a configuration file, then answers stdin lines until
//! `exit` or end of input. Logs go to stderr so stdout carries only the
//! conversation.

use anyhow::Context;
use brainchat_common::ChatConfig;
use brainchat_engine::ModelLoader;
use brainchat_session::ChatSession;
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Local chat front-end over a GGML/GGUF model
#[derive(Parser, Debug)]
#[command(name = "brainchat", version)]
struct Cli {
    /// Model weights file (.ggml or .gguf)
    model_path: PathBuf,

    /// Configuration file (YAML or JSON)
    config_path: PathBuf,

    /// Override the number of worker threads (0 = host parallelism)
    #[arg(long)]
    threads: Option<usize>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = ChatConfig::load(&cli.config_path)?;
    if let Some(threads) = cli.threads {
        config.engine.worker_threads = threads;
    }

    init_tracing(&config.observability.log_level);
    info!("Starting BrainChat");

    let model = ModelLoader::load(&cli.model_path)?;
    let session = ChatSession::new(model, config)?;

    let summary = session
        .run(io::stdin().lock(), io::stdout().lock())
        .context("chat session aborted")?;
    session.shutdown()?;

    info!(
        "BrainChat shutdown complete after {} turns ({} failed)",
        summary.turns, summary.failed_turns
    );
    Ok(())
}

fn init_tracing(level: &str) {
    let default_filter = format!(
        "brainchat={level},brainchat_session={level},brainchat_engine={level},brainchat_common={level}",
        level = level
    );

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}
