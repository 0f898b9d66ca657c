//! Persistent store implementations.
//!
//! Each store is an in-memory table whose journal appends to the shared WAL.
//! Opening a database replays the WAL into the tables. Every placeholder,
//! terminal write and reclaim adds a frame, so when the replayed history
//! holds superseded frames the log is rewritten to one frame per live row.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{CacheError, ExecutionError};
use crate::record::{
    CacheEntry, ComputedHouseholdKey, EconomyKey, HouseholdRecord, PolicyRecord,
    ReformImpactKey, Row,
};
use crate::storage::memory::{MemDefinitions, MemTable, RecordJournal, RowJournal};
use crate::storage::traits::{CacheStores, StorageError};

use super::file_lock::FileLock;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

fn storage_err(context: &str, err: impl std::fmt::Display) -> CacheError {
    CacheError::Execution(ExecutionError::Storage {
        message: format!("{context}: {err}"),
    })
}

/// Journal appending row mutations of one table to the WAL.
pub struct WalRowJournal<K, V> {
    wal: Arc<WriteAheadLog>,
    wrap: fn(K, Option<Row<V>>) -> WalEntryKind,
}

impl<K, V> RowJournal<K, V> for WalRowJournal<K, V>
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn record_row(&self, key: &K, row: Option<&Row<V>>) -> Result<(), StorageError> {
        self.wal
            .append((self.wrap)(key.clone(), row.cloned()))
            .map(|_| ())
            .map_err(|e| StorageError::DurabilityError(e.to_string()))
    }
}

/// Journal appending definition writes to the WAL.
pub struct WalRecordJournal<R> {
    wal: Arc<WriteAheadLog>,
    wrap: fn(R) -> WalEntryKind,
}

impl<R: Clone + Send + Sync> RecordJournal<R> for WalRecordJournal<R> {
    fn record(&self, record: &R) -> Result<(), StorageError> {
        self.wal
            .append((self.wrap)(record.clone()))
            .map(|_| ())
            .map_err(|e| StorageError::DurabilityError(e.to_string()))
    }
}

/// Durable cache table.
pub type PersistentTable<K> = MemTable<K, CacheEntry, WalRowJournal<K, CacheEntry>>;

/// Durable policy store.
pub type PersistentPolicyStore = MemDefinitions<PolicyRecord, WalRecordJournal<PolicyRecord>>;

/// Durable household store.
pub type PersistentHouseholdStore =
    MemDefinitions<HouseholdRecord, WalRecordJournal<HouseholdRecord>>;

/// Aggregate of all persistent stores sharing one WAL and directory lock.
pub struct PersistentStores {
    /// The database directory.
    pub dir: PathBuf,
    _lock: FileLock,
    wal: Arc<WriteAheadLog>,

    /// Economy rows.
    pub economy: Arc<PersistentTable<EconomyKey>>,
    /// Reform impact rows.
    pub reform_impact: Arc<PersistentTable<ReformImpactKey>>,
    /// Computed household rows.
    pub computed_household: Arc<PersistentTable<ComputedHouseholdKey>>,
    /// Policy definitions.
    pub policies: Arc<PersistentPolicyStore>,
    /// Household definitions.
    pub households: Arc<PersistentHouseholdStore>,
}

impl PersistentStores {
    /// Open or create a persistent database in `dir`.
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, CacheError> {
        fs::create_dir_all(dir).map_err(|e| storage_err("failed to create database directory", e))?;

        let lock = FileLock::acquire(dir).map_err(|e| storage_err("failed to acquire lock", e))?;

        let wal_path = dir.join("impactcache.wal");
        let wal = Arc::new(
            WriteAheadLog::open(&wal_path, config.sync_on_write)
                .map_err(|e| storage_err("failed to open WAL", e))?,
        );

        let stores = Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            economy: Arc::new(MemTable::with_journal(
                "economy",
                WalRowJournal {
                    wal: Arc::clone(&wal),
                    wrap: |key: EconomyKey, row| WalEntryKind::Economy { key, row },
                },
            )),
            reform_impact: Arc::new(MemTable::with_journal(
                "reform_impact",
                WalRowJournal {
                    wal: Arc::clone(&wal),
                    wrap: |key: ReformImpactKey, row| WalEntryKind::ReformImpact { key, row },
                },
            )),
            computed_household: Arc::new(MemTable::with_journal(
                "computed_household",
                WalRowJournal {
                    wal: Arc::clone(&wal),
                    wrap: |key: ComputedHouseholdKey, row| {
                        WalEntryKind::ComputedHousehold { key, row }
                    },
                },
            )),
            policies: Arc::new(MemDefinitions::with_journal(
                "policy",
                WalRecordJournal {
                    wal: Arc::clone(&wal),
                    wrap: WalEntryKind::Policy,
                },
            )),
            households: Arc::new(MemDefinitions::with_journal(
                "household",
                WalRecordJournal {
                    wal: Arc::clone(&wal),
                    wrap: WalEntryKind::Household,
                },
            )),
            wal,
        };

        let replayed = stores.replay_wal()?;
        if config.compact_on_open {
            stores.compact_wal(replayed)?;
        }
        Ok(stores)
    }

    /// Returns the number of entries replayed.
    fn replay_wal(&self) -> Result<usize, CacheError> {
        let iter = self
            .wal
            .iter()
            .map_err(|e| storage_err("failed to iterate WAL", e))?;

        let mut count = 0usize;
        for entry in iter {
            // Corruption was already truncated away on open; anything here is fatal.
            let entry = entry.map_err(|e| storage_err("corrupted WAL entry", e))?;
            match entry.kind {
                WalEntryKind::Economy { key, row } => self.economy.restore(key, row)?,
                WalEntryKind::ReformImpact { key, row } => self.reform_impact.restore(key, row)?,
                WalEntryKind::ComputedHousehold { key, row } => {
                    self.computed_household.restore(key, row)?;
                }
                WalEntryKind::Policy(record) => self.policies.restore(record)?,
                WalEntryKind::Household(record) => self.households.restore(record)?,
            }
            count += 1;
        }

        if count > 0 {
            info!(dir = %self.dir.display(), entries = count, "replayed cache WAL");
        } else {
            debug!(dir = %self.dir.display(), "opened empty cache database");
        }
        Ok(count)
    }

    /// Current state of every store as WAL entries.
    fn live_entries(&self) -> Result<Vec<WalEntryKind>, CacheError> {
        let mut live = Vec::new();
        live.extend(self.policies.snapshot()?.into_iter().map(WalEntryKind::Policy));
        live.extend(self.households.snapshot()?.into_iter().map(WalEntryKind::Household));
        live.extend(
            self.economy
                .snapshot()?
                .into_iter()
                .map(|(key, row)| WalEntryKind::Economy { key, row: Some(row) }),
        );
        live.extend(
            self.reform_impact
                .snapshot()?
                .into_iter()
                .map(|(key, row)| WalEntryKind::ReformImpact { key, row: Some(row) }),
        );
        live.extend(
            self.computed_household
                .snapshot()?
                .into_iter()
                .map(|(key, row)| WalEntryKind::ComputedHousehold { key, row: Some(row) }),
        );
        Ok(live)
    }

    /// Rewrite the WAL when `replayed` exceeds the live row count.
    ///
    /// Only called from `open`, before any handle exists, so no mutation
    /// can land between the snapshot and the rewrite.
    fn compact_wal(&self, replayed: usize) -> Result<(), CacheError> {
        let live = self.live_entries()?;
        if replayed <= live.len() {
            return Ok(());
        }
        let before = self.wal_size_bytes()?;
        let kept = live.len();
        self.wal
            .compact(live)
            .map_err(|e| storage_err("failed to compact WAL", e))?;
        info!(
            dir = %self.dir.display(),
            replayed,
            kept,
            bytes_before = before,
            bytes_after = self.wal_size_bytes()?,
            "compacted cache WAL"
        );
        Ok(())
    }

    /// Trait-object handles sharing these stores.
    #[must_use]
    pub fn handles(&self) -> CacheStores {
        CacheStores {
            economy: self.economy.clone(),
            reform_impact: self.reform_impact.clone(),
            computed_household: self.computed_household.clone(),
            policies: self.policies.clone(),
            households: self.households.clone(),
        }
    }

    /// Current WAL size in bytes.
    pub fn wal_size_bytes(&self) -> Result<u64, CacheError> {
        self.wal
            .size_bytes()
            .map_err(|e| storage_err("failed to stat WAL", e))
    }
}
