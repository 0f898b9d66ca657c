//! Abstract storage traits for impactcache.
//!
//! These traits define the contract that storage backends must implement.
//! The cache relies on the backend for atomicity: every method below is a
//! single atomic operation, so two callers racing on the same key can never
//! both observe "absent" and both insert.

use std::sync::Arc;

use thiserror::Error;

use crate::record::{
    CacheEntry, ComputedHouseholdKey, ContentHash, CountryId, EconomyKey, EngineVersion,
    HouseholdId, HouseholdRecord, PolicyId, PolicyRecord, ReformImpactKey, Row, RowId,
};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Write-ahead log append failed.
    #[error("Durability error: {0}")]
    DurabilityError(String),
}

/// Outcome of an atomic reservation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation<V> {
    /// No row matched; the caller's value was inserted and the caller owns it.
    Reserved(RowId),
    /// A row already matched; nothing was written.
    Existing(Row<V>),
}

/// Condition evaluated against the current row inside a conditional write.
pub type RowPredicate<'a, V> = &'a dyn Fn(&Row<V>) -> bool;

/// A durable key to record table keyed by an explicit field set.
///
/// # Atomicity
/// - `upsert` is "insert if no row matches the key, else update" in one step.
/// - `insert_if_absent`, `replace_if` and `remove_if` evaluate and write
///   under the same lock (or transaction) in the backend.
pub trait CacheTable<K, V>: Send + Sync {
    /// Get the row matching `key`.
    fn get(&self, key: &K) -> Result<Option<Row<V>>, StorageError>;

    /// Insert or update the row matching `key`. Returns the row id, which is
    /// stable across updates.
    fn upsert(&self, key: K, value: V) -> Result<RowId, StorageError>;

    /// Insert `value` only when no row matches `key`.
    fn insert_if_absent(&self, key: K, value: V) -> Result<Reservation<V>, StorageError>;

    /// Replace the row matching `key` only if `condition` holds for it.
    /// Returns false when the row is missing or the condition fails.
    fn replace_if(&self, key: &K, value: V, condition: RowPredicate<'_, V>)
        -> Result<bool, StorageError>;

    /// Remove the row matching `key` only if `condition` holds for it.
    fn remove_if(&self, key: &K, condition: RowPredicate<'_, V>) -> Result<bool, StorageError>;

    /// Number of stored rows.
    fn len(&self) -> Result<usize, StorageError>;

    /// Returns true when the table holds no rows.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

/// Economy simulation cache table.
pub type EconomyTable = dyn CacheTable<EconomyKey, CacheEntry>;

/// Reform impact cache table.
pub type ReformImpactTable = dyn CacheTable<ReformImpactKey, CacheEntry>;

/// Computed household cache table.
pub type ComputedHouseholdTable = dyn CacheTable<ComputedHouseholdKey, CacheEntry>;

/// Storage trait for policy definitions.
///
/// Policies are deduplicated by `(country, policy_hash)`: storing an
/// identical definition twice returns the id of the first row.
pub trait PolicyStore: Send + Sync {
    /// Get a policy by id.
    fn get(&self, country: &CountryId, id: PolicyId) -> Result<Option<PolicyRecord>, StorageError>;

    /// Find a policy by content hash.
    fn find_by_hash(
        &self,
        country: &CountryId,
        hash: &ContentHash,
    ) -> Result<Option<PolicyRecord>, StorageError>;

    /// Insert (allocating the next id) or update the row matching
    /// `(country, hash)`. The id never changes once allocated.
    fn upsert(
        &self,
        country: &CountryId,
        hash: ContentHash,
        definition: serde_json::Value,
        label: Option<String>,
        engine_version: EngineVersion,
    ) -> Result<PolicyId, StorageError>;

    /// Case-insensitive label substring search, ordered by id.
    fn search(&self, country: &CountryId, query: &str) -> Result<Vec<PolicyRecord>, StorageError>;
}

/// Storage trait for household definitions.
pub trait HouseholdStore: Send + Sync {
    /// Get a household by id.
    fn get(&self, country: &CountryId, id: HouseholdId)
        -> Result<Option<HouseholdRecord>, StorageError>;

    /// Find a household by content hash.
    fn find_by_hash(
        &self,
        country: &CountryId,
        hash: &ContentHash,
    ) -> Result<Option<HouseholdRecord>, StorageError>;

    /// Insert or update the row matching `(country, hash)`.
    fn upsert(
        &self,
        country: &CountryId,
        hash: ContentHash,
        definition: serde_json::Value,
        label: Option<String>,
    ) -> Result<HouseholdId, StorageError>;
}

/// Explicit handles to every table the cache uses.
#[derive(Clone)]
pub struct CacheStores {
    /// Economy rows.
    pub economy: Arc<EconomyTable>,
    /// Reform impact rows.
    pub reform_impact: Arc<ReformImpactTable>,
    /// Computed household rows.
    pub computed_household: Arc<ComputedHouseholdTable>,
    /// Policy definitions.
    pub policies: Arc<dyn PolicyStore>,
    /// Household definitions.
    pub households: Arc<dyn HouseholdStore>,
}
