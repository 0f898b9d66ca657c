//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.
//!
//! The same table types back the persistent store: every mutation is handed
//! to a journal while the write lock is held, so the journal order is the
//! order in which mutations became visible.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::record::{
    CacheEntry, ComputedHouseholdKey, ContentHash, CountryId, EconomyKey, EngineVersion,
    HouseholdId, HouseholdRecord, PolicyId, PolicyRecord, ReformImpactKey, Row, RowId,
};
use crate::storage::traits::{
    CacheStores, CacheTable, HouseholdStore, PolicyStore, Reservation, RowPredicate, StorageError,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Receives every row mutation of a table before it becomes visible.
pub trait RowJournal<K, V>: Send + Sync {
    /// `row` is `None` when the key was removed.
    fn record_row(&self, key: &K, row: Option<&Row<V>>) -> Result<(), StorageError>;
}

/// Receives every definition write of a policy or household store.
pub trait RecordJournal<R>: Send + Sync {
    /// Record the full post-write state of `record`.
    fn record(&self, record: &R) -> Result<(), StorageError>;
}

/// Journal that discards everything (pure in-memory operation).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJournal;

impl<K, V> RowJournal<K, V> for NoJournal {
    fn record_row(&self, _key: &K, _row: Option<&Row<V>>) -> Result<(), StorageError> {
        Ok(())
    }
}

impl<R> RecordJournal<R> for NoJournal {
    fn record(&self, _record: &R) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Debug)]
struct TableState<K, V> {
    rows: HashMap<K, Row<V>>,
    last_id: u64,
}

impl<K, V> Default for TableState<K, V> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            last_id: 0,
        }
    }
}

impl<K: Eq + Hash, V> TableState<K, V> {
    /// Build the row that `value` would become, keeping id and creation time
    /// of an existing row.
    fn next_row(&self, key: &K, value: V) -> Row<V> {
        let now = Utc::now();
        match self.rows.get(key) {
            Some(existing) => Row {
                id: existing.id,
                value,
                created_at: existing.created_at,
                updated_at: now,
            },
            None => Row {
                id: RowId(self.last_id + 1),
                value,
                created_at: now,
                updated_at: now,
            },
        }
    }

    fn put(&mut self, key: K, row: Row<V>) {
        self.last_id = self.last_id.max(row.id.0);
        self.rows.insert(key, row);
    }
}

/// Thread-safe key to record table with an optional journal.
#[derive(Debug)]
pub struct MemTable<K, V, J = NoJournal> {
    state: RwLock<TableState<K, V>>,
    journal: J,
    context: &'static str,
}

/// Pure in-memory cache table.
pub type InMemoryTable<K, V> = MemTable<K, V, NoJournal>;

impl<K, V> InMemoryTable<K, V> {
    /// Create a new empty table.
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self::with_journal(context, NoJournal)
    }
}

impl<K, V, J> MemTable<K, V, J> {
    /// Create a new empty table that reports mutations to `journal`.
    pub fn with_journal(context: &'static str, journal: J) -> Self {
        Self {
            state: RwLock::new(TableState::default()),
            journal,
            context,
        }
    }
}

impl<K: Eq + Hash, V, J> MemTable<K, V, J> {
    /// Apply a recovered mutation without journaling it.
    pub(crate) fn restore(&self, key: K, row: Option<Row<V>>) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err(self.context))?;
        match row {
            Some(row) => state.put(key, row),
            None => {
                state.rows.remove(&key);
            }
        }
        Ok(())
    }

    /// Every live row, ordered by row id.
    pub(crate) fn snapshot(&self) -> Result<Vec<(K, Row<V>)>, StorageError>
    where
        K: Clone,
        V: Clone,
    {
        let state = self.state.read().map_err(|_| lock_err(self.context))?;
        let mut rows: Vec<(K, Row<V>)> = state
            .rows
            .iter()
            .map(|(key, row)| (key.clone(), row.clone()))
            .collect();
        rows.sort_by_key(|(_, row)| row.id.0);
        Ok(rows)
    }
}

impl<K, V, J> CacheTable<K, V> for MemTable<K, V, J>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
    J: RowJournal<K, V>,
{
    fn get(&self, key: &K) -> Result<Option<Row<V>>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err(self.context))?;
        Ok(state.rows.get(key).cloned())
    }

    fn upsert(&self, key: K, value: V) -> Result<RowId, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err(self.context))?;
        let row = state.next_row(&key, value);
        let id = row.id;
        self.journal.record_row(&key, Some(&row))?;
        state.put(key, row);
        Ok(id)
    }

    fn insert_if_absent(&self, key: K, value: V) -> Result<Reservation<V>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err(self.context))?;
        if let Some(existing) = state.rows.get(&key) {
            return Ok(Reservation::Existing(existing.clone()));
        }
        let row = state.next_row(&key, value);
        let id = row.id;
        self.journal.record_row(&key, Some(&row))?;
        state.put(key, row);
        Ok(Reservation::Reserved(id))
    }

    fn replace_if(
        &self,
        key: &K,
        value: V,
        condition: RowPredicate<'_, V>,
    ) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err(self.context))?;
        match state.rows.get(key) {
            Some(current) if condition(current) => {}
            _ => return Ok(false),
        }
        let row = state.next_row(key, value);
        self.journal.record_row(key, Some(&row))?;
        state.put(key.clone(), row);
        Ok(true)
    }

    fn remove_if(&self, key: &K, condition: RowPredicate<'_, V>) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err(self.context))?;
        match state.rows.get(key) {
            Some(current) if condition(current) => {}
            _ => return Ok(false),
        }
        self.journal.record_row(key, None)?;
        state.rows.remove(key);
        Ok(true)
    }

    fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err(self.context))?;
        Ok(state.rows.len())
    }
}

/// Common shape of content-addressed definitions (policies, households).
pub trait DefinitionRecord: Clone + Send + Sync {
    /// Auto-increment id as a raw integer.
    fn raw_id(&self) -> u64;
    /// Owning country.
    fn country(&self) -> &CountryId;
    /// Content hash of the definition.
    fn content_hash(&self) -> &ContentHash;
}

impl DefinitionRecord for PolicyRecord {
    fn raw_id(&self) -> u64 {
        self.id.0
    }

    fn country(&self) -> &CountryId {
        &self.country
    }

    fn content_hash(&self) -> &ContentHash {
        &self.policy_hash
    }
}

impl DefinitionRecord for HouseholdRecord {
    fn raw_id(&self) -> u64 {
        self.id.0
    }

    fn country(&self) -> &CountryId {
        &self.country
    }

    fn content_hash(&self) -> &ContentHash {
        &self.household_hash
    }
}

#[derive(Debug)]
struct DefinitionState<R> {
    by_id: BTreeMap<(CountryId, u64), R>,
    by_hash: HashMap<(CountryId, ContentHash), u64>,
    last_id: u64,
}

impl<R> Default for DefinitionState<R> {
    fn default() -> Self {
        Self {
            by_id: BTreeMap::new(),
            by_hash: HashMap::new(),
            last_id: 0,
        }
    }
}

impl<R: DefinitionRecord> DefinitionState<R> {
    fn find(&self, country: &CountryId, hash: &ContentHash) -> Option<&R> {
        let id = self.by_hash.get(&(country.clone(), hash.clone()))?;
        self.by_id.get(&(country.clone(), *id))
    }

    fn apply(&mut self, record: R) {
        let country = record.country().clone();
        let id = record.raw_id();
        self.last_id = self.last_id.max(id);
        self.by_hash
            .insert((country.clone(), record.content_hash().clone()), id);
        self.by_id.insert((country, id), record);
    }
}

/// Thread-safe content-addressed definition store with an optional journal.
#[derive(Debug)]
pub struct MemDefinitions<R, J = NoJournal> {
    state: RwLock<DefinitionState<R>>,
    journal: J,
    context: &'static str,
}

/// In-memory policy store.
pub type InMemoryPolicyStore = MemDefinitions<PolicyRecord, NoJournal>;

/// In-memory household store.
pub type InMemoryHouseholdStore = MemDefinitions<HouseholdRecord, NoJournal>;

impl<R> MemDefinitions<R, NoJournal> {
    /// Create a new empty store.
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self::with_journal(context, NoJournal)
    }
}

impl<R, J> MemDefinitions<R, J> {
    /// Create a new empty store that reports writes to `journal`.
    pub fn with_journal(context: &'static str, journal: J) -> Self {
        Self {
            state: RwLock::new(DefinitionState::default()),
            journal,
            context,
        }
    }
}

impl<R: DefinitionRecord, J: RecordJournal<R>> MemDefinitions<R, J> {
    /// Apply a recovered record without journaling it.
    pub(crate) fn restore(&self, record: R) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err(self.context))?;
        state.apply(record);
        Ok(())
    }

    /// Every stored record, ordered by country then id.
    pub(crate) fn snapshot(&self) -> Result<Vec<R>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err(self.context))?;
        Ok(state.by_id.values().cloned().collect())
    }

    fn get_raw(&self, country: &CountryId, id: u64) -> Result<Option<R>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err(self.context))?;
        Ok(state.by_id.get(&(country.clone(), id)).cloned())
    }

    fn find_raw(&self, country: &CountryId, hash: &ContentHash) -> Result<Option<R>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err(self.context))?;
        Ok(state.find(country, hash).cloned())
    }

    /// Atomically update the row matching `(country, hash)` or insert a new
    /// row built by `build(next_id)`.
    fn upsert_raw(
        &self,
        country: &CountryId,
        hash: &ContentHash,
        update: impl FnOnce(&mut R),
        build: impl FnOnce(u64) -> R,
    ) -> Result<u64, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err(self.context))?;
        let record = match state.find(country, hash) {
            Some(existing) => {
                let mut record = existing.clone();
                update(&mut record);
                record
            }
            None => build(state.last_id + 1),
        };
        let id = record.raw_id();
        self.journal.record(&record)?;
        state.apply(record);
        Ok(id)
    }
}

impl<J: RecordJournal<PolicyRecord>> PolicyStore for MemDefinitions<PolicyRecord, J> {
    fn get(&self, country: &CountryId, id: PolicyId) -> Result<Option<PolicyRecord>, StorageError> {
        self.get_raw(country, id.0)
    }

    fn find_by_hash(
        &self,
        country: &CountryId,
        hash: &ContentHash,
    ) -> Result<Option<PolicyRecord>, StorageError> {
        self.find_raw(country, hash)
    }

    fn upsert(
        &self,
        country: &CountryId,
        hash: ContentHash,
        definition: serde_json::Value,
        label: Option<String>,
        engine_version: EngineVersion,
    ) -> Result<PolicyId, StorageError> {
        let id = self.upsert_raw(
            country,
            &hash,
            |record| {
                if label.is_some() {
                    record.label.clone_from(&label);
                }
                record.definition = definition.clone();
                record.engine_version = engine_version.clone();
            },
            |id| PolicyRecord {
                country: country.clone(),
                id: PolicyId(id),
                policy_hash: hash.clone(),
                definition: definition.clone(),
                label: label.clone(),
                engine_version: engine_version.clone(),
            },
        )?;
        Ok(PolicyId(id))
    }

    fn search(&self, country: &CountryId, query: &str) -> Result<Vec<PolicyRecord>, StorageError> {
        let needle = query.trim().to_lowercase();
        let state = self.state.read().map_err(|_| lock_err(self.context))?;
        Ok(state
            .by_id
            .range((country.clone(), 0)..=(country.clone(), u64::MAX))
            .map(|(_, record)| record)
            .filter(|record| {
                record
                    .label
                    .as_deref()
                    .is_some_and(|label| label.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect())
    }
}

impl<J: RecordJournal<HouseholdRecord>> HouseholdStore for MemDefinitions<HouseholdRecord, J> {
    fn get(
        &self,
        country: &CountryId,
        id: HouseholdId,
    ) -> Result<Option<HouseholdRecord>, StorageError> {
        self.get_raw(country, id.0)
    }

    fn find_by_hash(
        &self,
        country: &CountryId,
        hash: &ContentHash,
    ) -> Result<Option<HouseholdRecord>, StorageError> {
        self.find_raw(country, hash)
    }

    fn upsert(
        &self,
        country: &CountryId,
        hash: ContentHash,
        definition: serde_json::Value,
        label: Option<String>,
    ) -> Result<HouseholdId, StorageError> {
        let id = self.upsert_raw(
            country,
            &hash,
            |record| {
                if label.is_some() {
                    record.label.clone_from(&label);
                }
            },
            |id| HouseholdRecord {
                country: country.clone(),
                id: HouseholdId(id),
                household_hash: hash.clone(),
                definition: definition.clone(),
                label: label.clone(),
            },
        )?;
        Ok(HouseholdId(id))
    }
}

/// Convenience aggregate of all in-memory stores.
#[derive(Clone)]
pub struct InMemoryStores {
    /// Economy rows.
    pub economy: Arc<InMemoryTable<EconomyKey, CacheEntry>>,
    /// Reform impact rows.
    pub reform_impact: Arc<InMemoryTable<ReformImpactKey, CacheEntry>>,
    /// Computed household rows.
    pub computed_household: Arc<InMemoryTable<ComputedHouseholdKey, CacheEntry>>,
    /// Policy definitions.
    pub policies: Arc<InMemoryPolicyStore>,
    /// Household definitions.
    pub households: Arc<InMemoryHouseholdStore>,
}

impl Default for InMemoryStores {
    fn default() -> Self {
        Self {
            economy: Arc::new(InMemoryTable::new("economy")),
            reform_impact: Arc::new(InMemoryTable::new("reform_impact")),
            computed_household: Arc::new(InMemoryTable::new("computed_household")),
            policies: Arc::new(InMemoryPolicyStore::new("policy")),
            households: Arc::new(InMemoryHouseholdStore::new("household")),
        }
    }
}

impl InMemoryStores {
    /// Create empty stores.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordStatus;
    use serde_json::json;
    use std::sync::Barrier;
    use std::thread;
    use uuid::Uuid;

    fn key(policy: u64) -> EconomyKey {
        EconomyKey {
            country: CountryId::new("uk"),
            policy_id: PolicyId(policy),
            region: "national".to_string(),
            time_period: "2024".to_string(),
            options_fingerprint: "none".to_string(),
            engine_version: EngineVersion::new("1.0.0"),
        }
    }

    #[test]
    fn upsert_inserts_then_updates_in_place() {
        let table: InMemoryTable<EconomyKey, CacheEntry> = InMemoryTable::new("economy");
        let id = table.upsert(key(1), CacheEntry::computing(Uuid::new_v4())).unwrap();
        let again = table.upsert(key(1), CacheEntry::ok(json!({"v": 1}))).unwrap();
        assert_eq!(id, again);
        assert_eq!(table.len().unwrap(), 1);

        let row = table.get(&key(1)).unwrap().unwrap();
        assert_eq!(row.value.status, RecordStatus::Ok);
        assert!(row.updated_at >= row.created_at);
    }

    #[test]
    fn insert_if_absent_returns_existing_row() {
        let table: InMemoryTable<EconomyKey, CacheEntry> = InMemoryTable::new("economy");
        let first = table.insert_if_absent(key(1), CacheEntry::ok(json!(1))).unwrap();
        assert!(matches!(first, Reservation::Reserved(RowId(1))));

        let second = table.insert_if_absent(key(1), CacheEntry::error("late")).unwrap();
        let Reservation::Existing(row) = second else {
            panic!("expected existing row");
        };
        assert_eq!(row.value, CacheEntry::ok(json!(1)));
    }

    #[test]
    fn concurrent_reservations_have_one_winner() {
        let table: Arc<InMemoryTable<EconomyKey, CacheEntry>> =
            Arc::new(InMemoryTable::new("economy"));
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    table
                        .insert_if_absent(key(9), CacheEntry::computing(Uuid::new_v4()))
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| matches!(r, Reservation::Reserved(_)))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(table.len().unwrap(), 1);
    }

    #[test]
    fn replace_if_respects_condition() {
        let table: InMemoryTable<EconomyKey, CacheEntry> = InMemoryTable::new("economy");
        let token = Uuid::new_v4();
        table.upsert(key(1), CacheEntry::computing(token)).unwrap();

        let other = Uuid::new_v4();
        let replaced = table
            .replace_if(&key(1), CacheEntry::ok(json!(2)), &|row: &Row<CacheEntry>| {
                row.value.is_owned_by(other)
            })
            .unwrap();
        assert!(!replaced);

        let replaced = table
            .replace_if(&key(1), CacheEntry::ok(json!(2)), &|row: &Row<CacheEntry>| {
                row.value.is_owned_by(token)
            })
            .unwrap();
        assert!(replaced);

        let missing = table
            .replace_if(&key(2), CacheEntry::ok(json!(2)), &|_: &Row<CacheEntry>| true)
            .unwrap();
        assert!(!missing);
    }

    #[test]
    fn remove_if_deletes_only_matching_rows() {
        let table: InMemoryTable<EconomyKey, CacheEntry> = InMemoryTable::new("economy");
        let token = Uuid::new_v4();
        table.upsert(key(1), CacheEntry::computing(token)).unwrap();
        assert!(!table
            .remove_if(&key(1), &|row: &Row<CacheEntry>| row.value.status == RecordStatus::Ok)
            .unwrap());
        assert!(table
            .remove_if(&key(1), &|row: &Row<CacheEntry>| row.value.is_owned_by(token))
            .unwrap());
        assert!(table.is_empty().unwrap());
    }

    #[test]
    fn policies_dedupe_by_hash_and_keep_id() {
        let store = InMemoryPolicyStore::new("policy");
        let uk = CountryId::new("uk");
        let v = EngineVersion::new("1.0.0");
        let hash = ContentHash("abc".to_string());

        let a = store
            .upsert(&uk, hash.clone(), json!({}), Some("Current law".to_string()), v.clone())
            .unwrap();
        let b = store.upsert(&uk, hash.clone(), json!({}), None, v.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            store.get(&uk, a).unwrap().unwrap().label.as_deref(),
            Some("Current law")
        );

        let other = store
            .upsert(&uk, ContentHash("def".to_string()), json!({"x": 1}), None, v)
            .unwrap();
        assert_eq!(other, PolicyId(a.0 + 1));
        assert!(store.find_by_hash(&uk, &hash).unwrap().is_some());
        assert!(store.find_by_hash(&CountryId::new("us"), &hash).unwrap().is_none());
    }

    #[test]
    fn policy_search_is_case_insensitive_and_scoped() {
        let store = InMemoryPolicyStore::new("policy");
        let uk = CountryId::new("uk");
        let us = CountryId::new("us");
        let v = EngineVersion::new("1.0.0");
        store
            .upsert(&uk, ContentHash("1".into()), json!({}), Some("Raise Personal Allowance".into()), v.clone())
            .unwrap();
        store
            .upsert(&uk, ContentHash("2".into()), json!({}), Some("Cut VAT".into()), v.clone())
            .unwrap();
        store
            .upsert(&us, ContentHash("3".into()), json!({}), Some("personal exemption".into()), v)
            .unwrap();

        let hits = store.search(&uk, "personal").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].label.as_deref(), Some("Raise Personal Allowance"));
    }

    #[test]
    fn households_dedupe_by_hash() {
        let store = InMemoryHouseholdStore::new("household");
        let uk = CountryId::new("uk");
        let a = store
            .upsert(&uk, ContentHash("h".into()), json!({"people": {}}), None)
            .unwrap();
        let b = store
            .upsert(&uk, ContentHash("h".into()), json!({"people": {}}), Some("family".into()))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(
            store.get(&uk, a).unwrap().unwrap().label.as_deref(),
            Some("family")
        );
    }
}
