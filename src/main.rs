//! pebblekv - A Small In-Memory Key-Value Server
//!
//! This is the main entry point for the pebblekv server.
//! It parses the command line, sets up logging, binds the TCP listener and
//! hands every accepted connection to its own task.

use anyhow::{bail, Context};
use pebblekv::commands::CommandHandler;
use pebblekv::connection::{handle_connection, ConnectionStats};
use pebblekv::storage::StorageEngine;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: pebblekv::DEFAULT_HOST.to_string(),
            port: pebblekv::DEFAULT_PORT,
        }
    }
}

/// What the command line asked for
#[derive(Debug, PartialEq, Eq)]
enum Invocation {
    Serve(Config),
    Help,
    Version,
}

impl Config {
    /// Parse configuration from command-line arguments (without the program name)
    fn from_args<I>(args: I) -> anyhow::Result<Invocation>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Config::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--host" | "-h" => {
                    config.host = match args.next() {
                        Some(host) => host,
                        None => bail!("--host requires a value"),
                    };
                }
                "--port" | "-p" => {
                    let value = match args.next() {
                        Some(value) => value,
                        None => bail!("--port requires a value"),
                    };
                    config.port = value
                        .parse()
                        .with_context(|| format!("invalid port number: {value}"))?;
                }
                "--help" => return Ok(Invocation::Help),
                "--version" | "-v" => return Ok(Invocation::Version),
                other => bail!("unknown argument: {other} (see --help)"),
            }
        }

        Ok(Invocation::Serve(config))
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn print_help() {
    println!(
        r#"
pebblekv - A Small In-Memory Key-Value Server

USAGE:
    pebblekv [OPTIONS]

OPTIONS:
    -h, --host <HOST>    Host to bind to (default: 0.0.0.0)
    -p, --port <PORT>    Port to listen on (default: 6379)
    -v, --version        Print version information
        --help           Print this help message

LOGGING:
    Set RUST_LOG to change verbosity, e.g. RUST_LOG=pebblekv=trace

CONNECTING:
    $ redis-cli -p 6379
    127.0.0.1:6379> SET name "Rosa" PX 60000
    OK
    127.0.0.1:6379> GET name
    "Rosa"
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match Config::from_args(std::env::args().skip(1))? {
        Invocation::Serve(config) => config,
        Invocation::Help => {
            print_help();
            return Ok(());
        }
        Invocation::Version => {
            println!("pebblekv version {}", pebblekv::VERSION);
            return Ok(());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    // Shared by every connection
    let storage = Arc::new(StorageEngine::new());
    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_address()))?;
    info!(version = pebblekv::VERSION, "Listening on {}", config.bind_address());

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    let result = tokio::select! {
        res = accept_loop(listener, Arc::clone(&storage), Arc::clone(&stats)) => res,
        _ = shutdown => Ok(()),
    };

    let storage_stats = storage.stats();
    info!(
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        commands = stats.commands_processed.load(Ordering::Relaxed),
        keys = storage_stats.keys,
        expired = storage_stats.expired_keys,
        "Server shutdown complete"
    );

    result
}

/// Accepts connections until the listener fails.
async fn accept_loop(
    listener: TcpListener,
    storage: Arc<StorageEngine>,
    stats: Arc<ConnectionStats>,
) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                return Err(e).context("accept loop failed");
            }
        };

        let handler = CommandHandler::new(Arc::clone(&storage));
        let stats = Arc::clone(&stats);

        tokio::spawn(async move {
            handle_connection(stream, addr, handler, stats).await;
        });
    }
}
