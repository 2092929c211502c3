//! # pebblekv - A Small In-Memory Key-Value Server
//!
//! pebblekv answers a handful of Redis commands over TCP. Many clients can
//! connect at once; they all share one expiring key-value store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              pebblekv                               │
//! │                                                                     │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐              │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │              │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │              │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘              │
//! │                            │                  │                     │
//! │                            ▼                  ▼                     │
//! │                     ┌─────────────┐    ┌──────────────────────────┐ │
//! │                     │   Request   │    │      StorageEngine       │ │
//! │                     │   Decoder   │    │  64 RwLock shards,       │ │
//! │                     └─────────────┘    │  lazy TTL expiry         │ │
//! │                                        └──────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use pebblekv::storage::StorageEngine;
//! use pebblekv::commands::CommandHandler;
//! use pebblekv::connection::{handle_connection, ConnectionStats};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = Arc::new(StorageEngine::new());
//!     let stats = Arc::new(ConnectionStats::new());
//!     let listener = TcpListener::bind("0.0.0.0:6379").await?;
//!
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         let handler = CommandHandler::new(Arc::clone(&storage));
//!         tokio::spawn(handle_connection(stream, addr, handler, Arc::clone(&stats)));
//!     }
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `PING [arg ...]`
//! - `ECHO [arg ...]`
//! - `SET key value [PX milliseconds]`
//! - `GET key`
//! - `QUIT`
//!
//! ## Module Overview
//!
//! - [`protocol`]: Request decoder and reply encoding
//! - [`storage`]: Thread-safe storage engine with lazy TTL expiry
//! - [`commands`]: Command dispatch
//! - [`connection`]: Client connection loop
//! - [`error`]: Command-level errors and their replies
//!
//! ## Expiry
//!
//! Keys with a TTL are expired lazily: a read that finds the deadline
//! passed deletes the key and answers as if it were never there. There is
//! no background sweep, so an expired key that is never read again keeps
//! its memory.

pub mod commands;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod storage;

pub use commands::CommandHandler;
pub use connection::{handle_connection, ConnectionStats};
pub use error::CommandError;
pub use protocol::{decode_command, Command, ParseError, RespParser, RespValue};
pub use storage::StorageEngine;

/// The default port pebblekv listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host pebblekv binds to (all interfaces)
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Version of pebblekv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
