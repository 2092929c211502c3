//! Storage Engine Module
//!
//! A thread-safe, sharded key-value store with lazy TTL expiry.
//!
//! ## Features
//!
//! - **Sharded Storage**: 64 independent shards reduce lock contention
//! - **RwLock**: Multiple concurrent readers, exclusive writers
//! - **TTL Support**: Keys can carry a millisecond time-to-live
//! - **Lazy Expiry**: Expired keys are removed when they are next read
//!
//! ## Example
//!
//! ```
//! use pebblekv::storage::StorageEngine;
//! use bytes::Bytes;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let engine = Arc::new(StorageEngine::new());
//!
//! engine.set(Bytes::from("name"), Bytes::from("Rosa"), None);
//! assert_eq!(engine.get(&Bytes::from("name")), Some(Bytes::from("Rosa")));
//!
//! engine.set(
//!     Bytes::from("session"),
//!     Bytes::from("token123"),
//!     Some(Duration::from_millis(3600)),
//! );
//! ```

pub mod engine;

pub use engine::{Entry, StorageEngine, StorageStats};
