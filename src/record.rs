//! Cache record types.
//!
//! Every cached computation is a row keyed by an explicit field set. The
//! engine version is always one of the key fields: a new engine version
//! produces new keys instead of overwriting old rows.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Country identifier (e.g. `uk`, `us`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountryId(String);

impl CountryId {
    /// Create a country id, normalized to lowercase.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_ascii_lowercase())
    }

    /// Borrow the id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CountryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Auto-increment policy identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(pub u64);

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Auto-increment household identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HouseholdId(pub u64);

impl fmt::Display for HouseholdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage row identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub u64);

/// Version tag of the simulation engine that produced a cached row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineVersion(String);

impl EngineVersion {
    /// Create an engine version tag.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Borrow the version as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Blake3 content hash (hex) of a canonical JSON definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a cached computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// A placeholder has been reserved and a worker owns the computation.
    Computing,
    /// Terminal: the payload holds the result.
    Ok,
    /// Terminal: the message describes the failure.
    Error,
}

impl RecordStatus {
    /// Returns true for `ok` and `error`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Error)
    }

    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Computing => "computing",
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of an economy-wide simulation run.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EconomyKey {
    pub country: CountryId,
    pub policy_id: PolicyId,
    pub region: String,
    pub time_period: String,
    pub options_fingerprint: String,
    pub engine_version: EngineVersion,
}

/// Key of a baseline-vs-reform comparison.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReformImpactKey {
    pub country: CountryId,
    pub baseline_policy_id: PolicyId,
    pub reform_policy_id: PolicyId,
    pub region: String,
    pub time_period: String,
    pub options_fingerprint: String,
    pub engine_version: EngineVersion,
}

impl ReformImpactKey {
    /// Key of one side of the comparison.
    #[must_use]
    pub fn economy_key(&self, policy_id: PolicyId) -> EconomyKey {
        EconomyKey {
            country: self.country.clone(),
            policy_id,
            region: self.region.clone(),
            time_period: self.time_period.clone(),
            options_fingerprint: self.options_fingerprint.clone(),
            engine_version: self.engine_version.clone(),
        }
    }
}

/// Key of a single household evaluated under a policy.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputedHouseholdKey {
    pub country: CountryId,
    pub household_id: HouseholdId,
    pub policy_id: PolicyId,
    pub engine_version: EngineVersion,
}

/// Value side of an economy, reform-impact or computed-household row.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: RecordStatus,
    /// `result_payload` / `impact_payload`; empty object while computing.
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Token of the worker that owns a `computing` row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<Uuid>,
}

impl CacheEntry {
    /// A `computing` placeholder owned by `token`.
    #[must_use]
    pub fn computing(token: Uuid) -> Self {
        Self {
            status: RecordStatus::Computing,
            payload: serde_json::Value::Object(serde_json::Map::new()),
            message: None,
            reservation: Some(token),
        }
    }

    /// A terminal `ok` value.
    #[must_use]
    pub fn ok(payload: serde_json::Value) -> Self {
        Self {
            status: RecordStatus::Ok,
            payload,
            message: None,
            reservation: None,
        }
    }

    /// A terminal `error` value.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::Error,
            payload: serde_json::Value::Object(serde_json::Map::new()),
            message: Some(message.into()),
            reservation: None,
        }
    }

    /// True if this is a `computing` row reserved by `token`.
    #[must_use]
    pub fn is_owned_by(&self, token: Uuid) -> bool {
        self.status == RecordStatus::Computing && self.reservation == Some(token)
    }
}

/// A stored row with bookkeeping timestamps.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row<V> {
    pub id: RowId,
    pub value: V,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a caller sees for a cached computation.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Computation {
    /// Still in flight.
    #[must_use]
    pub const fn computing() -> Self {
        Self {
            status: RecordStatus::Computing,
            result: None,
            message: None,
        }
    }

    /// True once the record reached `ok` or `error`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<&CacheEntry> for Computation {
    fn from(entry: &CacheEntry) -> Self {
        match entry.status {
            RecordStatus::Computing => Self::computing(),
            RecordStatus::Ok => Self {
                status: RecordStatus::Ok,
                result: Some(entry.payload.clone()),
                message: None,
            },
            RecordStatus::Error => Self {
                status: RecordStatus::Error,
                result: None,
                message: entry.message.clone(),
            },
        }
    }
}

/// A stored policy reform definition.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub country: CountryId,
    pub id: PolicyId,
    pub policy_hash: ContentHash,
    /// Parameter-patch definition, `{ "a.b": { "start.end": value } }`.
    pub definition: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub engine_version: EngineVersion,
}

/// A stored household (population) description.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdRecord {
    pub country: CountryId,
    pub id: HouseholdId,
    pub household_hash: ContentHash,
    /// `{ entity_plural: { entity_id: { variable: { period: value | null } } } }`
    pub definition: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        let s = serde_json::to_string(&RecordStatus::Computing).unwrap();
        assert_eq!(s, "\"computing\"");
        assert!(RecordStatus::Ok.is_terminal());
        assert!(!RecordStatus::Computing.is_terminal());
    }

    #[test]
    fn country_id_is_normalized() {
        assert_eq!(CountryId::new(" UK ").as_str(), "uk");
    }

    #[test]
    fn computation_from_entry() {
        let ok = CacheEntry::ok(serde_json::json!({"x": 1}));
        let c = Computation::from(&ok);
        assert_eq!(c.status, RecordStatus::Ok);
        assert_eq!(c.result, Some(serde_json::json!({"x": 1})));

        let err = CacheEntry::error("boom");
        let c = Computation::from(&err);
        assert_eq!(c.message.as_deref(), Some("boom"));
        assert!(c.result.is_none());
    }

    #[test]
    fn ownership_requires_matching_token() {
        let token = Uuid::new_v4();
        let entry = CacheEntry::computing(token);
        assert!(entry.is_owned_by(token));
        assert!(!entry.is_owned_by(Uuid::new_v4()));
        assert!(!CacheEntry::ok(serde_json::Value::Null).is_owned_by(token));
    }
}
