//! cascade: event-driven automation over a persistent message stream.

mod commands;
mod echo;
mod httpserver;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cascade_bus::KeyFile;

#[derive(Parser)]
#[command(name = "cascade", about = "Event-driven automation orchestrator", version)]
struct Cli {
    /// Keyfile identifying the broker URL and account.
    #[arg(long, global = true, default_value = "cascade.key", env = "CASCADE_KEYFILE")]
    keyfile: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration server: consume sequences and dispatch calls.
    Start {
        /// Rule file or directory of rule files.
        #[arg(long, default_value = ".")]
        rules: PathBuf,
    },

    /// Serve the console HTTP API.
    Console {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:8916")]
        address: String,
    },

    /// Run a worker for an app.
    Worker {
        /// App whose requests this worker handles.
        #[arg(long, default_value = "echo")]
        app: String,
    },

    /// Re-run a stored sequence under a fresh replay id.
    Replay {
        /// Sequence to replay.
        #[arg(long)]
        sequence_id: String,

        /// Rule file or directory of rule files.
        #[arg(long, default_value = ".")]
        rules: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let keyfile = KeyFile::load(&cli.keyfile)?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match cli.command {
        Command::Start { rules } => commands::start(&keyfile, &rules, cancel).await,
        Command::Console { address } => commands::console(&keyfile, &address, cancel).await,
        Command::Worker { app } => commands::worker(&keyfile, &app, cancel).await,
        Command::Replay { sequence_id, rules } => {
            commands::replay(&keyfile, &sequence_id, &rules, cancel).await
        }
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });
}
