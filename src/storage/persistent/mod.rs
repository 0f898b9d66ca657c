//! Persistent storage backend for impactcache.
//!
//! This module provides durable, crash-safe storage with:
//! - Write-Ahead Logging (WAL) for crash recovery
//! - File locking for single-process access
//! - CRC32 checksums for corruption detection
//! - Compaction on open: superseded frames are dropped by rewriting the log
//!   to one frame per live row (temp file, fsync, rename)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     PersistentStores                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  economy / reform_impact / computed_household / policy / ... │
//! │  (in-memory tables, mutations journaled under the row lock)  │
//! │                      ↓                                       │
//! │           ┌─────────────────────┐                            │
//! │           │   WriteAheadLog     │                            │
//! │           └─────────────────────┘                            │
//! │           ┌─────────────────────┐                            │
//! │           │   FileLock (flock)  │                            │
//! │           └─────────────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod codec;
mod file_lock;
mod stores;
mod wal;

pub use file_lock::FileLock;
pub use stores::{
    PersistentHouseholdStore, PersistentPolicyStore, PersistentStores, PersistentTable,
    WalRecordJournal, WalRowJournal,
};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use serde::Deserialize;

use crate::error::CacheError;

/// Configuration for persistent storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
    /// Rewrite the WAL on open when it holds superseded frames.
    pub compact_on_open: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            compact_on_open: true,
        }
    }
}

/// Open or create a persistent cache database at the given path.
///
/// # Errors
/// - If the path cannot be created or accessed
/// - If another process holds the lock
/// - If WAL replay fails
///
/// # Example
/// ```rust,ignore
/// use impactcache::storage::open_database;
///
/// let stores = open_database("./impact.cache", None)?;
/// let engine = ComputeEngine::new(stores.handles(), countries, comparator, config)?;
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentStores, CacheError> {
    PersistentStores::open(path.as_ref(), config.unwrap_or_default())
}
