//! # impactcache - Memoized Policy Simulation
//!
//! impactcache serves repeated requests for expensive, deterministic
//! simulations from a durable cache, and sequences composite computations
//! (a reform "impact" derived from two economy simulations) so that each
//! prerequisite runs at most once and failures propagate.
//!
//! ## Core Concepts
//!
//! - **Fingerprint**: the explicit key of a computation, always including the engine version
//! - **Record lifecycle**: absent, then `computing`, then `ok` or `error` (both terminal)
//! - **Dispatcher**: atomic reservation plus background simulation on a bounded pool
//! - **Resolver**: joins the baseline and reform economies, then compares them
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use impactcache::{CacheConfig, ComputeEngine, Countries, EconomyComparator, ImpactRequest, InMemoryStores};
//!
//! let stores = InMemoryStores::new();
//! let countries = Countries::new().with("uk", Arc::new(my_simulator));
//! let engine = ComputeEngine::new(stores.handles(), countries, Arc::new(EconomyComparator), CacheConfig::default())?;
//!
//! let uk = impactcache::CountryId::new("uk");
//! let reform = engine.policies().create(&uk, serde_json::json!({
//!     "gov.tax.income.rate": { "2024-01-01.2100-12-31": 0.25 }
//! }), Some("Raise the basic rate".into()))?;
//!
//! // First call returns `computing`; poll until `ok` or `error`.
//! let impact = engine.impact_and_wait(&ImpactRequest::new("uk", reform, "national", "2024"))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod record;

// Storage and definitions
pub mod catalog;
pub mod policy;
pub mod storage;

// Computation
pub mod dispatcher;
pub mod engine;
pub mod household;
pub mod pool;
pub mod resolver;
pub mod simulator;

// Re-export primary types at crate root for convenience
pub use catalog::{HouseholdCatalog, PolicyCatalog, CURRENT_LAW_LABEL};
pub use config::CacheConfig;
pub use dispatcher::{ComputationDispatcher, EconomyRequest};
pub use engine::ComputeEngine;
pub use error::{CacheError, CacheResult, ComputationFailure, ExecutionError, ValidationError};
pub use fingerprint::{canonical_json, content_hash, options_fingerprint, Fingerprint};
pub use household::{requested_slots, HouseholdComputation, HouseholdComputer, SkippedSlot, Slot};
pub use policy::{apply_patches, parse_reform, Parameter, ParameterNode, ParameterPatch, ParameterTree};
pub use pool::WorkerPool;
pub use record::{
    CacheEntry, Computation, ComputedHouseholdKey, ContentHash, CountryId, EconomyKey,
    EngineVersion, HouseholdId, HouseholdRecord, PolicyId, PolicyRecord, RecordStatus,
    ReformImpactKey, Row, RowId,
};
pub use resolver::{DependencyResolver, ImpactRequest};
pub use simulator::{
    Comparator, Countries, EconomyComparator, EconomyRun, HouseholdCalculation, SlotValue, Simulator,
};
pub use storage::{
    CacheStores, CacheTable, HouseholdStore, InMemoryStores, PolicyStore, Reservation, StorageError,
};

#[cfg(feature = "persistent")]
pub use storage::{open_database, PersistentConfig, PersistentStores};
