//! Connection Handler Module
//!
//! Each client connection is handled by its own async task. All tasks share
//! one storage engine through their `CommandHandler`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (main.rs)                                │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │   For each client...   │
//!           └────────────┬───────────┘
//!                        │
//!                        │ spawn task
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ Read bytes  │───>│ Decode      │───>│ Execute cmd │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │                                               │             │
//! │                                               ▼             │
//! │                                      ┌─────────────┐        │
//! │                                      │ Send resp   │        │
//! │                                      └─────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use pebblekv::connection::{handle_connection, ConnectionStats};
//! use pebblekv::commands::CommandHandler;
//! use pebblekv::storage::StorageEngine;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(StorageEngine::new());
//! let stats = Arc::new(ConnectionStats::new());
//!
//! // For each accepted connection...
//! let (stream, addr) = listener.accept().await?;
//! let handler = CommandHandler::new(Arc::clone(&storage));
//! tokio::spawn(handle_connection(stream, addr, handler, Arc::clone(&stats)));
//! ```

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
