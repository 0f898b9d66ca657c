//! Storage layer for impactcache.
//!
//! `traits` defines the table contracts, `memory` the thread-safe in-memory
//! backend, and `persistent` (feature `persistent`) a durable WAL-backed
//! backend built on the same tables.

mod traits;
pub mod memory;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::{
    InMemoryHouseholdStore, InMemoryPolicyStore, InMemoryStores, InMemoryTable, MemDefinitions,
    MemTable, NoJournal, RecordJournal, RowJournal,
};
pub use traits::{
    CacheStores, CacheTable, ComputedHouseholdTable, EconomyTable, HouseholdStore, PolicyStore,
    ReformImpactTable, Reservation, RowPredicate, StorageError,
};

#[cfg(feature = "persistent")]
pub use persistent::{open_database, PersistentConfig, PersistentStores};
