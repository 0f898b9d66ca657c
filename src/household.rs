//! Single-household computations.
//!
//! Unlike economies, a household is computed synchronously by the caller and
//! written once; no `computing` placeholder is stored. Every empty slot of
//! the household description is computed independently: a slot whose
//! calculation fails is left empty and reported in
//! [`HouseholdComputation::skipped`] instead of failing the household.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog::{HouseholdCatalog, PolicyCatalog};
use crate::error::{CacheResult, ComputationFailure};
use crate::fingerprint::Fingerprint;
use crate::policy::{apply_patches, parse_reform};
use crate::pool::panic_message;
use crate::record::{CacheEntry, CountryId, HouseholdId, PolicyId, RecordStatus};
use crate::simulator::{Countries, HouseholdCalculation};
use crate::storage::ComputedHouseholdTable;

/// Address of one value in a household description:
/// `entity_plural / entity_id / variable / period`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    pub entity_plural: String,
    pub entity_id: String,
    pub variable: String,
    pub period: String,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.entity_plural, self.entity_id, self.variable, self.period
        )
    }
}

/// A slot left empty because its calculation failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedSlot {
    /// The slot.
    pub slot: Slot,
    /// Why it was skipped.
    pub reason: String,
}

/// Outcome of [`HouseholdComputer::get_or_compute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdComputation {
    /// The household description with computed slots filled in.
    pub result: Value,
    /// Slots that could not be computed. Always empty for cache hits.
    pub skipped: Vec<SkippedSlot>,
    /// True when served from the cache.
    pub cached: bool,
}

/// Every `entity_plural/entity_id/variable/period` whose value is `null`.
#[must_use]
pub fn requested_slots(household: &Value) -> Vec<Slot> {
    let mut slots = Vec::new();
    let Some(groups) = household.as_object() else {
        return slots;
    };
    for (entity_plural, entities) in groups {
        let Some(entities) = entities.as_object() else { continue };
        for (entity_id, variables) in entities {
            let Some(variables) = variables.as_object() else { continue };
            for (variable, periods) in variables {
                let Some(periods) = periods.as_object() else { continue };
                for (period, value) in periods {
                    if value.is_null() {
                        slots.push(Slot {
                            entity_plural: entity_plural.clone(),
                            entity_id: entity_id.clone(),
                            variable: variable.clone(),
                            period: period.clone(),
                        });
                    }
                }
            }
        }
    }
    slots
}

fn fill(household: &mut Value, slot: &Slot, value: Value) {
    if let Some(target) = household
        .get_mut(&slot.entity_plural)
        .and_then(|entities| entities.get_mut(&slot.entity_id))
        .and_then(|variables| variables.get_mut(&slot.variable))
        .and_then(|periods| periods.get_mut(&slot.period))
    {
        *target = value;
    }
}

/// Computes and caches households evaluated under a policy.
pub struct HouseholdComputer {
    table: Arc<ComputedHouseholdTable>,
    policies: PolicyCatalog,
    households: HouseholdCatalog,
    countries: Countries,
    fingerprint: Fingerprint,
}

impl HouseholdComputer {
    /// Create a computer over explicit store handles.
    #[must_use]
    pub fn new(
        table: Arc<ComputedHouseholdTable>,
        policies: PolicyCatalog,
        households: HouseholdCatalog,
        countries: Countries,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            table,
            policies,
            households,
            countries,
            fingerprint,
        }
    }

    /// Return the cached household or compute, store and return it.
    ///
    /// # Errors
    /// `CountryNotFound`, `HouseholdNotFound`, `PolicyNotFound`, a validation
    /// error if the policy cannot be applied, or a storage error. Failures
    /// of individual slots are not errors.
    pub fn get_or_compute(
        &self,
        country: &CountryId,
        household_id: HouseholdId,
        policy_id: PolicyId,
    ) -> CacheResult<HouseholdComputation> {
        let key = self.fingerprint.computed_household(country, household_id, policy_id);
        if let Some(row) = self.table.get(&key)? {
            if row.value.status == RecordStatus::Ok {
                debug!(country = %country, household_id = %household_id, policy_id = %policy_id, "household cache hit");
                return Ok(HouseholdComputation {
                    result: row.value.payload,
                    skipped: Vec::new(),
                    cached: true,
                });
            }
        }

        let simulator = self.countries.get(country)?;
        let household = self.households.get(country, household_id)?;
        let policy = self.policies.get(country, policy_id)?;
        let reform = parse_reform(&policy.definition)?;
        let parameters = apply_patches(simulator.parameters(), &reform)?;

        let axes = household.definition.get("axes").is_some();
        let mut result = household.definition.clone();
        let mut skipped = Vec::new();

        for slot in requested_slots(&household.definition) {
            let calculation = HouseholdCalculation {
                country,
                household: &household.definition,
                parameters: &parameters,
                slot: &slot,
                axes,
            };
            let computed = panic::catch_unwind(AssertUnwindSafe(|| simulator.calculate(&calculation)))
                .unwrap_or_else(|payload| Err(ComputationFailure::Panicked(panic_message(payload.as_ref()))))
                .and_then(|value| value.to_json());

            match computed {
                Ok(value) => fill(&mut result, &slot, value),
                Err(failure) => {
                    debug!(slot = %slot, error = %failure, "skipping household slot");
                    skipped.push(SkippedSlot {
                        slot,
                        reason: failure.to_string(),
                    });
                }
            }
        }

        self.table.upsert(key, CacheEntry::ok(result.clone()))?;

        if skipped.is_empty() {
            info!(country = %country, household_id = %household_id, policy_id = %policy_id, "household computed");
        } else {
            warn!(
                country = %country,
                household_id = %household_id,
                policy_id = %policy_id,
                skipped = skipped.len(),
                "household computed with skipped slots"
            );
        }

        Ok(HouseholdComputation {
            result,
            skipped,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_null_slots_only() {
        let household = json!({
            "people": {
                "you": { "age": { "2024": 40 }, "income_tax": { "2024": null } },
                "partner": { "income_tax": { "2024": null, "2025": 3 } }
            },
            "households": { "home": { "net_income": { "2024": null } } },
            "axes": [[{ "name": "employment_income", "count": 3, "min": 0, "max": 2000 }]]
        });

        let slots = requested_slots(&household);
        let rendered: Vec<String> = slots.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "households/home/net_income/2024",
                "people/partner/income_tax/2024",
                "people/you/income_tax/2024",
            ]
        );
    }

    #[test]
    fn non_object_household_has_no_slots() {
        assert!(requested_slots(&json!(null)).is_empty());
        assert!(requested_slots(&json!({"people": [1, 2]})).is_empty());
    }

    #[test]
    fn fill_writes_existing_slot_only() {
        let mut household = json!({ "people": { "you": { "tax": { "2024": null } } } });
        let slot = Slot {
            entity_plural: "people".into(),
            entity_id: "you".into(),
            variable: "tax".into(),
            period: "2024".into(),
        };
        fill(&mut household, &slot, json!(12.5));
        assert_eq!(household["people"]["you"]["tax"]["2024"], json!(12.5));

        let missing = Slot {
            entity_id: "nobody".into(),
            ..slot
        };
        fill(&mut household, &missing, json!(1));
        assert!(household["people"].get("nobody").is_none());
    }
}
