//! Policy and household catalogs.
//!
//! Definitions are content-addressed: creating a definition whose canonical
//! hash already exists returns the existing id, so identical reforms under
//! different labels share one id (and therefore one set of cache rows).

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{CacheResult, ExecutionError, ValidationError};
use crate::fingerprint::content_hash;
use crate::policy::{parse_reform, ParameterPatch};
use crate::record::{CountryId, EngineVersion, HouseholdId, HouseholdRecord, PolicyId, PolicyRecord};
use crate::storage::{HouseholdStore, PolicyStore};

/// Label given to the implicit current-law policy.
pub const CURRENT_LAW_LABEL: &str = "Current law";

/// Stored policy reforms for all countries.
#[derive(Clone)]
pub struct PolicyCatalog {
    store: Arc<dyn PolicyStore>,
    engine_version: EngineVersion,
}

impl PolicyCatalog {
    /// Create a catalog over `store`, stamping new rows with `engine_version`.
    #[must_use]
    pub fn new(store: Arc<dyn PolicyStore>, engine_version: EngineVersion) -> Self {
        Self {
            store,
            engine_version,
        }
    }

    /// Get a policy by id.
    ///
    /// # Errors
    /// Returns `PolicyNotFound` if no such policy exists in `country`.
    pub fn get(&self, country: &CountryId, id: PolicyId) -> CacheResult<PolicyRecord> {
        self.store.get(country, id)?.ok_or_else(|| {
            ExecutionError::PolicyNotFound {
                country: country.clone(),
                id,
            }
            .into()
        })
    }

    /// Find the policy with the same content as `definition`.
    pub fn find_by_definition(&self, country: &CountryId, definition: &Value) -> CacheResult<Option<PolicyRecord>> {
        Ok(self.store.find_by_hash(country, &content_hash(definition))?)
    }

    /// Store a reform definition, returning the id of the row with its content hash.
    ///
    /// # Errors
    /// Returns a validation error if the definition is not a well-formed reform.
    pub fn create(&self, country: &CountryId, definition: Value, label: Option<String>) -> CacheResult<PolicyId> {
        parse_reform(&definition)?;
        let hash = content_hash(&definition);
        let id = self
            .store
            .upsert(country, hash.clone(), definition, label, self.engine_version.clone())?;
        debug!(country = %country, policy_id = %id, policy_hash = %hash, "stored policy");
        Ok(id)
    }

    /// Policies whose label contains `query`, case-insensitively.
    pub fn search(&self, country: &CountryId, query: &str) -> CacheResult<Vec<PolicyRecord>> {
        Ok(self.store.search(country, query)?)
    }

    /// Id of the empty reform (current law), creating it on first use.
    pub fn current_law_id(&self, country: &CountryId) -> CacheResult<PolicyId> {
        let empty = Value::Object(serde_json::Map::new());
        if let Some(existing) = self.find_by_definition(country, &empty)? {
            return Ok(existing.id);
        }
        let id = self.create(country, empty, Some(CURRENT_LAW_LABEL.to_string()))?;
        info!(country = %country, policy_id = %id, "registered current-law policy");
        Ok(id)
    }

    /// The parameter patches of a stored policy.
    pub fn reform(&self, country: &CountryId, id: PolicyId) -> CacheResult<Vec<ParameterPatch>> {
        let policy = self.get(country, id)?;
        Ok(parse_reform(&policy.definition)?)
    }
}

/// Stored household descriptions for all countries.
#[derive(Clone)]
pub struct HouseholdCatalog {
    store: Arc<dyn HouseholdStore>,
}

impl HouseholdCatalog {
    /// Create a catalog over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn HouseholdStore>) -> Self {
        Self { store }
    }

    /// Get a household by id.
    ///
    /// # Errors
    /// Returns `HouseholdNotFound` if no such household exists in `country`.
    pub fn get(&self, country: &CountryId, id: HouseholdId) -> CacheResult<HouseholdRecord> {
        self.store.get(country, id)?.ok_or_else(|| {
            ExecutionError::HouseholdNotFound {
                country: country.clone(),
                id,
            }
            .into()
        })
    }

    /// Store a household description, deduplicated by content.
    ///
    /// # Errors
    /// Returns a validation error unless `definition` is a JSON object.
    pub fn create(&self, country: &CountryId, definition: Value, label: Option<String>) -> CacheResult<HouseholdId> {
        if !definition.is_object() {
            return Err(ValidationError::InvalidField {
                field: "household".to_string(),
                reason: "household definition must be a JSON object".to_string(),
            }
            .into());
        }
        let hash = content_hash(&definition);
        Ok(self.store.upsert(country, hash, definition, label)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStores;
    use serde_json::json;

    fn catalog() -> (PolicyCatalog, HouseholdCatalog) {
        let stores = InMemoryStores::new().handles();
        (
            PolicyCatalog::new(stores.policies, EngineVersion::new("1.0.0")),
            HouseholdCatalog::new(stores.households),
        )
    }

    #[test]
    fn identical_reforms_share_an_id() {
        let (policies, _) = catalog();
        let uk = CountryId::new("uk");
        let a = policies
            .create(&uk, json!({"tax.rate": {"2024-01-01.2024-12-31": 0.3}}), Some("A".into()))
            .unwrap();
        let b = policies
            .create(&uk, json!({"tax.rate": {"2024-01-01.2024-12-31": 0.3}}), Some("B".into()))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(policies.get(&uk, a).unwrap().label.as_deref(), Some("B"));
    }

    #[test]
    fn missing_policy_is_not_found() {
        let (policies, _) = catalog();
        let err = policies.get(&CountryId::new("uk"), PolicyId(42)).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Execution error: Policy 42 not found in uk");
    }

    #[test]
    fn create_rejects_malformed_reform() {
        let (policies, _) = catalog();
        let err = policies
            .create(&CountryId::new("uk"), json!({"tax.rate": 0.3}), None)
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn current_law_is_created_once() {
        let (policies, _) = catalog();
        let us = CountryId::new("us");
        let first = policies.current_law_id(&us).unwrap();
        let second = policies.current_law_id(&us).unwrap();
        assert_eq!(first, second);
        assert!(policies.reform(&us, first).unwrap().is_empty());

        let hits = policies.search(&us, "current").unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn households_dedupe_and_report_missing() {
        let (_, households) = catalog();
        let uk = CountryId::new("uk");
        let definition = json!({"people": {"you": {"age": {"2024": 40}}}});
        let a = households.create(&uk, definition.clone(), None).unwrap();
        let b = households.create(&uk, definition, None).unwrap();
        assert_eq!(a, b);

        assert!(households.get(&uk, HouseholdId(99)).unwrap_err().is_not_found());
        assert!(households.create(&uk, json!(3), None).unwrap_err().is_validation());
    }
}
