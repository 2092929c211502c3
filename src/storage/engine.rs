//! Thread-Safe Storage Engine with Lazy Expiry
//!
//! This module implements the key-value store shared by every connection.
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: Instead of one big lock, keys are spread over 64 shards.
//! 2. **Lazy Expiry**: Keys are only checked for expiry when they are read.
//!    There is no background sweeper, so an expired key that is never read
//!    again stays in memory.
//! 3. **RwLock**: Reads of live keys share a lock; writes and expired-key
//!    removal take it exclusively.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A key always hashes to the same shard, so every operation on one key is
//! serialized by that shard's lock.

use bytes::Bytes;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::trace;

/// Number of shards for the storage engine.
const NUM_SHARDS: usize = 64;

/// A stored value together with its expiry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The actual value stored
    pub value: Bytes,
    /// When this entry was written
    pub created_at: Instant,
    /// The TTL it was written with, if any
    pub ttl_millis: Option<u64>,
    /// `created_at + ttl_millis` (None = never expires)
    pub expires_at: Option<Instant>,
}

impl Entry {
    /// Creates a new entry without expiry.
    pub fn new(value: Bytes) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl_millis: None,
            expires_at: None,
        }
    }

    /// Creates a new entry that expires `ttl` after now.
    ///
    /// A zero TTL means no expiry, and so does a deadline past the end of the
    /// clock's range.
    pub fn with_ttl(value: Bytes, ttl: Duration) -> Self {
        if ttl.is_zero() {
            return Self::new(value);
        }

        let now = Instant::now();
        let Some(expires_at) = now.checked_add(ttl) else {
            return Self::new(value);
        };

        Self {
            value,
            created_at: now,
            ttl_millis: Some(ttl.as_millis() as u64),
            expires_at: Some(expires_at),
        }
    }

    /// Creates an entry whose deadline has already passed.
    pub fn expired(value: Bytes) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            ttl_millis: Some(0),
            expires_at: Some(now.checked_sub(Duration::from_millis(1)).unwrap_or(now)),
        }
    }

    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Checks expiry against a given instant. The deadline itself is still live.
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }
}

/// A single shard containing a portion of the key-value pairs.
#[derive(Debug, Default)]
struct Shard {
    data: RwLock<HashMap<Bytes, Entry>>,
}

impl Shard {
    // A poisoned shard means a writer panicked mid-update; nothing sensible
    // can be served from it.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Bytes, Entry>> {
        self.data.read().expect("storage shard lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Bytes, Entry>> {
        self.data.write().expect("storage shard lock poisoned")
    }
}

/// Snapshot of the engine's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub keys: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub expired_keys: u64,
}

/// The key-value store shared by all client connections.
///
/// # Thread Safety
///
/// This struct is designed to be wrapped in an `Arc` and shared across
/// all client handler tasks. All operations are thread-safe.
///
/// # Example
///
/// ```
/// use pebblekv::storage::StorageEngine;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let engine = StorageEngine::new();
///
/// engine.set(Bytes::from("name"), Bytes::from("Rosa"), None);
/// assert_eq!(engine.get(&Bytes::from("name")), Some(Bytes::from("Rosa")));
///
/// engine.set(
///     Bytes::from("session"),
///     Bytes::from("abc123"),
///     Some(Duration::from_secs(60)),
/// );
/// ```
pub struct StorageEngine {
    shards: Vec<Shard>,

    /// Number of keys currently held, including expired ones not yet read
    key_count: AtomicU64,
    get_count: AtomicU64,
    set_count: AtomicU64,
    /// Keys removed by lazy expiry
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("key_count", &self.key_count.load(Ordering::Relaxed))
            .field("get_count", &self.get_count.load(Ordering::Relaxed))
            .field("set_count", &self.set_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    /// Creates an empty storage engine.
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS).map(|_| Shard::default()).collect();

        Self {
            shards,
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    /// Determines which shard a key belongs to.
    #[inline]
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    #[inline]
    fn get_shard(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    /// Stores `value` under `key`, replacing any previous entry wholesale.
    ///
    /// With `ttl` set to a non-zero duration the key expires that long after
    /// now. A previous TTL on the key never carries over.
    ///
    /// # Returns
    ///
    /// Returns `true` if a new key was created, `false` if an existing key was replaced.
    pub fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let entry = match ttl {
            Some(ttl) => Entry::with_ttl(value, ttl),
            None => Entry::new(value),
        };

        self.insert(key, entry)
    }

    /// Stores `value` under `key` with a deadline that has already passed.
    ///
    /// Any previous value is replaced, so the next read finds nothing.
    pub fn set_expired(&self, key: Bytes, value: Bytes) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        self.insert(key, Entry::expired(value))
    }

    fn insert(&self, key: Bytes, entry: Entry) -> bool {
        let mut data = self.get_shard(&key).write();
        let is_new = data.insert(key, entry).is_none();

        if is_new {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }

        is_new
    }

    /// Gets the value for a key.
    ///
    /// Returns `None` if the key doesn't exist or has expired. An expired key
    /// is removed as a side effect.
    pub fn get(&self, key: &Bytes) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Gets the full entry for a key (including expiry metadata).
    ///
    /// Applies the same lazy expiry as [`get`](Self::get).
    pub fn get_entry(&self, key: &Bytes) -> Option<Entry> {
        let shard = self.get_shard(key);

        // Fast path: shared lock for absent or live keys
        {
            let data = shard.read();
            match data.get(key) {
                Some(entry) if !entry.is_expired() => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Key looked expired; re-check under the write lock since a
        // concurrent SET may have replaced it in between.
        let mut data = shard.write();
        match data.get(key) {
            Some(entry) if entry.is_expired() => {
                data.remove(key);
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                trace!(key = ?key, "Removed expired key");
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Returns the number of keys held, including expired keys that
    /// have not been read since they expired.
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of the engine's counters.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.key_count.load(Ordering::Relaxed),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            expired_keys: self.expired_count.load(Ordering::Relaxed),
        }
    }
}
