//! Deterministic computation fingerprints.
//!
//! A fingerprint reduces everything that affects a computation's result to
//! a stable key. Option maps and JSON definitions are hashed through a
//! canonical encoding (object keys sorted, compact separators) so that equal
//! content always collides regardless of construction order.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::record::{
    ComputedHouseholdKey, ContentHash, CountryId, EconomyKey, EngineVersion, HouseholdId,
    PolicyId, ReformImpactKey,
};

/// Canonical, key-sorted JSON encoding of `value`.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn hash_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Content hash of a JSON definition (policies, households).
#[must_use]
pub fn content_hash(value: &Value) -> ContentHash {
    ContentHash(hash_hex(canonical_json(value).as_bytes()))
}

/// Fingerprint of an auxiliary option set.
#[must_use]
pub fn options_fingerprint(options: &BTreeMap<String, String>) -> String {
    let object: serde_json::Map<String, Value> = options
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    hash_hex(canonical_json(&Value::Object(object)).as_bytes())
}

/// Builds cache keys stamped with a fixed engine version.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    engine_version: EngineVersion,
}

impl Fingerprint {
    /// Create a key builder for `engine_version`.
    #[must_use]
    pub fn new(engine_version: EngineVersion) -> Self {
        Self { engine_version }
    }

    /// The engine version appended to every key.
    #[must_use]
    pub fn engine_version(&self) -> &EngineVersion {
        &self.engine_version
    }

    /// Key of an economy simulation.
    #[must_use]
    pub fn economy(
        &self,
        country: &CountryId,
        policy_id: PolicyId,
        region: &str,
        time_period: &str,
        options: &BTreeMap<String, String>,
    ) -> EconomyKey {
        EconomyKey {
            country: country.clone(),
            policy_id,
            region: region.to_string(),
            time_period: time_period.to_string(),
            options_fingerprint: options_fingerprint(options),
            engine_version: self.engine_version.clone(),
        }
    }

    /// Key of a reform impact comparison.
    #[must_use]
    pub fn reform_impact(
        &self,
        country: &CountryId,
        baseline_policy_id: PolicyId,
        reform_policy_id: PolicyId,
        region: &str,
        time_period: &str,
        options: &BTreeMap<String, String>,
    ) -> ReformImpactKey {
        ReformImpactKey {
            country: country.clone(),
            baseline_policy_id,
            reform_policy_id,
            region: region.to_string(),
            time_period: time_period.to_string(),
            options_fingerprint: options_fingerprint(options),
            engine_version: self.engine_version.clone(),
        }
    }

    /// Key of a household computed under a policy.
    #[must_use]
    pub fn computed_household(
        &self,
        country: &CountryId,
        household_id: HouseholdId,
        policy_id: PolicyId,
    ) -> ComputedHouseholdKey {
        ComputedHouseholdKey {
            country: country.clone(),
            household_id,
            policy_id,
            engine_version: self.engine_version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let a = json!({"b": {"y": 1, "x": [true, null]}, "a": "s"});
        assert_eq!(canonical_json(&a), r#"{"a":"s","b":{"x":[true,null],"y":1}}"#);
    }

    #[test]
    fn options_fingerprint_ignores_insertion_order() {
        let mut first = BTreeMap::new();
        first.insert("target".to_string(), "cliff".to_string());
        first.insert("age_group".to_string(), "all".to_string());

        let mut second = BTreeMap::new();
        second.insert("age_group".to_string(), "all".to_string());
        second.insert("target".to_string(), "cliff".to_string());

        assert_eq!(options_fingerprint(&first), options_fingerprint(&second));

        second.insert("extra".to_string(), String::new());
        assert_ne!(options_fingerprint(&first), options_fingerprint(&second));
    }

    #[test]
    fn content_hash_matches_blake3_of_canonical_form() {
        let policy = json!({"tax.rate": {"2024-01-01.2100-12-31": 0.21}});
        let expected = hex::encode(blake3::hash(canonical_json(&policy).as_bytes()).as_bytes());
        assert_eq!(content_hash(&policy).0, expected);
    }

    #[test]
    fn empty_policy_has_stable_hash() {
        assert_eq!(content_hash(&json!({})), content_hash(&json!({})));
        assert_ne!(content_hash(&json!({})), content_hash(&json!([])));
    }

    #[test]
    fn engine_version_is_part_of_every_key() {
        let country = CountryId::new("uk");
        let options = BTreeMap::new();
        let v1 = Fingerprint::new(EngineVersion::new("1.0.0"));
        let v2 = Fingerprint::new(EngineVersion::new("1.1.0"));

        let a = v1.economy(&country, PolicyId(1), "national", "2024", &options);
        let b = v2.economy(&country, PolicyId(1), "national", "2024", &options);
        assert_ne!(a, b);
        assert_eq!(a, v1.economy(&country, PolicyId(1), "national", "2024", &options));

        let impact = v2.reform_impact(&country, PolicyId(1), PolicyId(2), "national", "2024", &options);
        assert_eq!(impact.economy_key(PolicyId(1)), b);
    }
}
