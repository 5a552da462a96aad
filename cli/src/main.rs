// callmatch: rendezvous server CLI
//
// Runs the matchmaking/signaling coordinator behind a WebSocket server,
// replays the built-in call scenarios, and edits the local config.

mod config;
mod demo;
mod server;

use anyhow::{Context, Result};
use callmatch_core::{Directory, Rendezvous, SledDirectory};
use clap::{Parser, Subcommand};
use colored::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "callmatch")]
#[command(about = "callmatch: random one-to-one call rendezvous", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the rendezvous server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Shared peer directory (sled database path)
        #[arg(short, long)]
        directory: Option<PathBuf>,
        /// Write logs to this directory instead of stderr
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Run the built-in call scenarios in-process
    Demo,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Log to stderr, or to `<log_dir>/callmatch.log` through a background
/// writer. The guard must live as long as the process.
fn init_tracing(log_dir: Option<&PathBuf>, default: &str) -> Result<Option<WorkerGuard>> {
    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, "callmatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(default))
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(default))
                .init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            directory,
            log_dir,
        } => cmd_serve(port, directory, log_dir).await,
        Commands::Demo => {
            let _guard = init_tracing(None, "warn")?;
            demo::run().await
        }
        Commands::Config { action } => {
            let _guard = init_tracing(None, "warn")?;
            cmd_config(action)
        }
    }
}

async fn cmd_serve(
    port: Option<u16>,
    directory: Option<PathBuf>,
    log_dir: Option<PathBuf>,
) -> Result<()> {
    let config = config::Config::load()?;
    let log_dir = log_dir.or_else(|| config.log_dir.as_ref().map(PathBuf::from));
    let _guard = init_tracing(log_dir.as_ref(), "callmatch=info,callmatch_core=info")?;

    config
        .rendezvous
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid rendezvous config: {}", e))?;

    let rendezvous = Arc::new(Rendezvous::new(config.rendezvous.clone()));
    rendezvous.spawn_maintenance();

    let directory = directory.or_else(|| config.directory_path.as_ref().map(PathBuf::from));
    if let Some(path) = &directory {
        let store = SledDirectory::open(path, config.node_name.clone())
            .with_context(|| format!("Failed to open directory {}", path.display()))?;
        let store: Arc<dyn Directory> = Arc::new(store);
        let ingested = rendezvous
            .attach_directory(store)
            .context("Failed to read directory")?;
        println!(
            "  {} Directory {} ({} peers announced elsewhere)",
            "✓".green(),
            path.display().to_string().bright_cyan(),
            ingested
        );
    }

    let port = port.unwrap_or(config.listen_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let ctx = Arc::new(server::ServerContext {
        rendezvous: rendezvous.clone(),
        node_name: config.node_name.clone(),
        start_time: Instant::now(),
    });

    println!("{}", "callmatch rendezvous".bold());
    println!("  {} Listening on {}", "✓".green(), addr.to_string().bright_cyan());
    println!("  WebSocket: {}", format!("ws://{}/ws?peer_id=<id>", addr).bright_green());
    println!("  Status:    {}", format!("http://{}/api/status", addr).bright_green());
    println!();

    tokio::select! {
        _ = server::serve(addr, ctx) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            println!();
            println!("{}", "Shutting down...".yellow());
        }
    }

    rendezvous.shutdown().await;
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                let value = if value.is_empty() {
                    "(none)".dimmed().to_string()
                } else {
                    value
                };
                println!("  {:<26} {}", key.bright_cyan(), value);
            }
            println!();
            println!(
                "  File: {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
        }
    }

    Ok(())
}
