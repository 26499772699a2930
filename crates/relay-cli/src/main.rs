use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use relay_gateway::config;
use relay_gateway::stream_parser::{self, StreamEvent, StreamParser};
use relay_gateway::{LogWatchEvent, LogWatcher};
use relay_types::config::RelayConfig;

#[derive(Parser)]
#[command(name = "relay", version, about = "Relay: agent stream coordination diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Frame agent output read from stdin into one JSON message per line
    Frame,
    /// Tail the agent's log directory and report detected errors
    WatchLogs {
        /// Log directory (defaults to the configured one)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Show current configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = config::load_config();
    let level = loaded
        .as_ref()
        .map(|cfg| cfg.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = loaded.unwrap_or_else(|e| {
        warn!("Using default configuration: {e:#}");
        RelayConfig::default()
    });

    match cli.command {
        Commands::Frame => frame(&cfg).await,
        Commands::WatchLogs { dir } => {
            let dir = dir.unwrap_or_else(|| config::log_dir(&cfg));
            watch_logs(dir, &cfg).await
        }
        Commands::Status => {
            println!("Relay v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config::config_path().display());
            println!("Log directory: {}", config::log_dir(&cfg).display());
            println!("Stream buffer cap: {} bytes", cfg.stream.max_buffer_bytes);
            println!("Permission timeout: {} ms", cfg.interactions.permission_timeout_ms);
            println!("Question timeout: {} ms", cfg.interactions.question_timeout_ms);
            println!("Log poll interval: {} ms", cfg.log_watch.poll_interval_ms);
            Ok(())
        }
    }
}

async fn frame(cfg: &RelayConfig) -> Result<()> {
    let parser = StreamParser::with_max_buffer(cfg.stream.max_buffer_bytes);
    let (tx, mut rx) = mpsc::channel(64);
    let reader = tokio::spawn(stream_parser::pump(tokio::io::stdin(), parser, tx));

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Message(message) => {
                let line = serde_json::to_string(&message).context("Failed to encode message")?;
                println!("{line}");
            }
            StreamEvent::Error(e) => warn!("{e}"),
        }
    }

    reader.await.context("Stream reader task failed")?
}

async fn watch_logs(dir: PathBuf, cfg: &RelayConfig) -> Result<()> {
    let mut watcher = LogWatcher::from_config(&dir, &cfg.log_watch);
    let mut events = watcher.subscribe();
    watcher.start().await?;
    eprintln!("Watching {} (Ctrl-C to stop)", dir.display());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(LogWatchEvent::Error(error)) => {
                    println!("[{}] {}", error.kind, error.user_message());
                    if let Some(session) = &error.session_id {
                        println!("    session: {session}");
                    }
                }
                Ok(LogWatchEvent::LogLine(line)) => debug!(%line, "Error line"),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {n} log events"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    watcher.stop();
    Ok(())
}
