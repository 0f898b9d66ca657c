//! Economy computation dispatch.
//!
//! `ensure` returns a cached economy record when one exists. Otherwise it
//! atomically reserves a `computing` placeholder carrying a fresh token and
//! queues the simulation on the economy pool; the worker later replaces the
//! placeholder with `ok` or `error`, but only while it still holds the token.
//!
//! ```text
//! absent ──reserve(token)──▶ computing ──replace_if(owned)──▶ ok | error
//!                               │
//!                               └─ stale? replace_if(same row) ─▶ computing(token')
//! ```

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::PolicyCatalog;
use crate::error::{CacheResult, CacheError, ComputationFailure, ExecutionError, ValidationError};
use crate::fingerprint::Fingerprint;
use crate::policy::{apply_patches, parse_reform};
use crate::pool::{panic_message, WorkerPool};
use crate::record::{CacheEntry, Computation, CountryId, EconomyKey, PolicyId, RecordStatus, Row};
use crate::simulator::{Countries, EconomyRun, Simulator};
use crate::storage::{CacheTable, EconomyTable, Reservation};

/// Parameters of an economy computation, as requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EconomyRequest {
    /// Country to simulate.
    pub country: CountryId,
    /// Policy to simulate under.
    pub policy_id: PolicyId,
    /// Region filter.
    pub region: String,
    /// Time period.
    pub time_period: String,
    /// Auxiliary options; part of the cache key.
    pub options: BTreeMap<String, String>,
}

impl EconomyRequest {
    /// A request with no auxiliary options.
    #[must_use]
    pub fn new(
        country: impl Into<String>,
        policy_id: PolicyId,
        region: impl Into<String>,
        time_period: impl Into<String>,
    ) -> Self {
        Self {
            country: CountryId::new(country),
            policy_id,
            region: region.into(),
            time_period: time_period.into(),
            options: BTreeMap::new(),
        }
    }

    /// Add an auxiliary option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Build a request from query parameters, taking `region` and
    /// `time_period` out and keeping the rest as options.
    ///
    /// # Errors
    /// Returns `MissingField` if `region` or `time_period` is absent.
    pub fn from_query(
        country: impl Into<String>,
        policy_id: PolicyId,
        mut query: BTreeMap<String, String>,
    ) -> Result<Self, ValidationError> {
        let (region, time_period) = take_region_and_period(&mut query)?;
        Ok(Self {
            country: CountryId::new(country),
            policy_id,
            region,
            time_period,
            options: query,
        })
    }

    /// Check that required fields are present.
    ///
    /// # Errors
    /// Returns `MissingField` for a blank region or time period.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("region", &self.region)?;
        require("time_period", &self.time_period)
    }
}

pub(crate) fn require(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: field.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn take_region_and_period(
    query: &mut BTreeMap<String, String>,
) -> Result<(String, String), ValidationError> {
    let region = query.remove("region").ok_or_else(|| ValidationError::MissingField {
        field: "region".to_string(),
    })?;
    let time_period = query
        .remove("time_period")
        .ok_or_else(|| ValidationError::MissingField {
            field: "time_period".to_string(),
        })?;
    require("region", &region)?;
    require("time_period", &time_period)?;
    Ok((region, time_period))
}

/// Result of trying to take ownership of a cache key.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Claim {
    /// The key already resolved.
    Terminal(Computation),
    /// Another worker owns the computation.
    InFlight,
    /// The caller owns the placeholder and must schedule the work.
    Owned(Uuid),
}

fn is_stale(row: &Row<CacheEntry>, stale_after: Option<Duration>) -> bool {
    let Some(limit) = stale_after else {
        return false;
    };
    (Utc::now() - row.updated_at)
        .to_std()
        .is_ok_and(|age| age >= limit)
}

/// Reserve `key` or report its current state.
pub(crate) fn claim<K, T>(
    table: &T,
    key: &K,
    stale_after: Option<Duration>,
) -> CacheResult<Claim>
where
    K: Clone,
    T: CacheTable<K, CacheEntry> + ?Sized,
{
    let existing = match table.get(key)? {
        Some(row) => row,
        None => {
            let token = Uuid::new_v4();
            match table.insert_if_absent(key.clone(), CacheEntry::computing(token))? {
                Reservation::Reserved(_) => return Ok(Claim::Owned(token)),
                Reservation::Existing(row) => row,
            }
        }
    };

    if existing.value.status.is_terminal() {
        return Ok(Claim::Terminal(Computation::from(&existing.value)));
    }
    if !is_stale(&existing, stale_after) {
        return Ok(Claim::InFlight);
    }

    // Take over only the exact row we judged stale; a concurrent reclaim or
    // terminal write changes `updated_at` and makes this a no-op.
    let token = Uuid::new_v4();
    let seen = existing.updated_at;
    let previous = existing.value.reservation;
    let reclaimed = table.replace_if(key, CacheEntry::computing(token), &|row: &Row<CacheEntry>| {
        row.value.status == RecordStatus::Computing
            && row.value.reservation == previous
            && row.updated_at == seen
    })?;
    if reclaimed {
        warn!(
            previous = ?previous,
            age_secs = (Utc::now() - seen).num_seconds(),
            "reclaimed stale computing record"
        );
        Ok(Claim::Owned(token))
    } else {
        Ok(Claim::InFlight)
    }
}

/// Replace the placeholder owned by `token` with a terminal entry.
/// Returns false when the reservation was lost to a reclaim.
pub(crate) fn settle<K, T>(table: &T, key: &K, token: Uuid, entry: CacheEntry) -> CacheResult<bool>
where
    T: CacheTable<K, CacheEntry> + ?Sized,
{
    Ok(table.replace_if(key, entry, &|row: &Row<CacheEntry>| row.value.is_owned_by(token))?)
}

/// Drop the placeholder owned by `token` so a later request can retry.
pub(crate) fn release<K, T>(table: &T, key: &K, token: Uuid) -> CacheResult<bool>
where
    T: CacheTable<K, CacheEntry> + ?Sized,
{
    Ok(table.remove_if(key, &|row: &Row<CacheEntry>| row.value.is_owned_by(token))?)
}

/// Poll `read` until it yields a terminal computation or `timeout` elapses.
pub(crate) fn poll_until_terminal(
    timeout: Duration,
    poll_interval: Duration,
    mut read: impl FnMut() -> CacheResult<Computation>,
) -> CacheResult<Computation> {
    let deadline = Instant::now() + timeout;
    loop {
        let computation = read()?;
        if computation.is_terminal() {
            return Ok(computation);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into());
        }
        thread::sleep(poll_interval.min(deadline - now));
    }
}

/// Report a full queue as `computing` so a blocking wait resubmits on its
/// next poll instead of giving up while time remains.
pub(crate) fn retry_when_queue_full(outcome: CacheResult<Computation>) -> CacheResult<Computation> {
    match outcome {
        Err(CacheError::Execution(ExecutionError::QueueFull { pool, capacity })) => {
            debug!(pool = %pool, capacity, "queue full; retrying on next poll");
            Ok(Computation::computing())
        }
        other => other,
    }
}

/// State shared with economy workers.
struct EconomyContext {
    table: Arc<EconomyTable>,
}

impl EconomyContext {
    fn run(&self, key: &EconomyKey, token: Uuid, simulator: &Arc<dyn Simulator>, definition: &Value, options: BTreeMap<String, String>) {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<Value, ComputationFailure> {
            let reform = parse_reform(definition).map_err(|e| ComputationFailure::InvalidPolicy(e.to_string()))?;
            let parameters = apply_patches(simulator.parameters(), &reform)
                .map_err(|e| ComputationFailure::InvalidPolicy(e.to_string()))?;
            simulator.simulate_economy(&EconomyRun {
                country: key.country.clone(),
                policy_id: key.policy_id,
                reform,
                parameters,
                region: key.region.clone(),
                time_period: key.time_period.clone(),
                options,
            })
        }))
        .unwrap_or_else(|payload| Err(ComputationFailure::Panicked(panic_message(payload.as_ref()))));

        let entry = match outcome {
            Ok(payload) => {
                info!(
                    country = %key.country,
                    policy_id = %key.policy_id,
                    region = %key.region,
                    time_period = %key.time_period,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "economy computed"
                );
                CacheEntry::ok(payload)
            }
            Err(failure) => {
                warn!(
                    country = %key.country,
                    policy_id = %key.policy_id,
                    error = %failure,
                    "economy computation failed"
                );
                CacheEntry::error(failure.to_string())
            }
        };

        match settle(self.table.as_ref(), key, token, entry) {
            Ok(true) => {}
            Ok(false) => debug!(policy_id = %key.policy_id, "economy reservation lost; result discarded"),
            Err(e) => error!(policy_id = %key.policy_id, error = %e, "failed to store economy result"),
        }
    }
}

/// Memoizing dispatcher for economy simulations.
pub struct ComputationDispatcher {
    ctx: Arc<EconomyContext>,
    countries: Countries,
    policies: PolicyCatalog,
    fingerprint: Fingerprint,
    pool: WorkerPool,
    stale_after: Option<Duration>,
    poll_interval: Duration,
}

impl ComputationDispatcher {
    /// Create a dispatcher over `table`, running simulations on `pool`.
    #[must_use]
    pub fn new(
        table: Arc<EconomyTable>,
        countries: Countries,
        policies: PolicyCatalog,
        fingerprint: Fingerprint,
        pool: WorkerPool,
        stale_after: Option<Duration>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ctx: Arc::new(EconomyContext { table }),
            countries,
            policies,
            fingerprint,
            pool,
            stale_after,
            poll_interval,
        }
    }

    /// Cache key of `request`.
    #[must_use]
    pub fn key(&self, request: &EconomyRequest) -> EconomyKey {
        self.fingerprint.economy(
            &request.country,
            request.policy_id,
            &request.region,
            &request.time_period,
            &request.options,
        )
    }

    /// Return the cached economy or start computing it.
    ///
    /// Never recomputes a key that already resolved, including to `error`.
    ///
    /// # Errors
    /// Validation, `CountryNotFound`, `PolicyNotFound`, storage errors, and
    /// `QueueFull` when the economy pool cannot accept the job (the
    /// placeholder is released so a later request can retry).
    pub fn ensure(&self, request: &EconomyRequest) -> CacheResult<Computation> {
        request.validate()?;
        let simulator = self.countries.get(&request.country)?;
        let policy = self.policies.get(&request.country, request.policy_id)?;
        let key = self.key(request);

        let token = match claim(self.ctx.table.as_ref(), &key, self.stale_after)? {
            Claim::Terminal(computation) => return Ok(computation),
            Claim::InFlight => return Ok(Computation::computing()),
            Claim::Owned(token) => token,
        };

        debug!(
            country = %key.country,
            policy_id = %key.policy_id,
            region = %key.region,
            time_period = %key.time_period,
            "reserved economy computation"
        );

        let ctx = Arc::clone(&self.ctx);
        let job_key = key.clone();
        let options = request.options.clone();
        let submitted = self.pool.submit(move || {
            ctx.run(&job_key, token, &simulator, &policy.definition, options);
        });

        if let Err(e) = submitted {
            warn!(policy_id = %key.policy_id, error = %e, "economy job rejected; releasing reservation");
            release(self.ctx.table.as_ref(), &key, token)?;
            return Err(e);
        }
        Ok(Computation::computing())
    }

    /// Current state of `key` without scheduling anything.
    pub fn status(&self, key: &EconomyKey) -> CacheResult<Option<Computation>> {
        Ok(self.ctx.table.get(key)?.map(|row| Computation::from(&row.value)))
    }

    /// Block until `key` is terminal.
    ///
    /// # Errors
    /// `Timeout` past `timeout`; an internal error if the record disappears
    /// (its job was rejected).
    pub fn wait(&self, key: &EconomyKey, timeout: Duration) -> CacheResult<Computation> {
        poll_until_terminal(timeout, self.poll_interval, || {
            self.status(key)?.ok_or_else(|| {
                CacheError::internal(format!("economy record for policy {} was released", key.policy_id))
            })
        })
    }

    /// `ensure`, then block until the economy is terminal.
    ///
    /// Re-ensures on every poll so a released or stale reservation is
    /// picked up again. A full economy queue counts as still computing
    /// until `timeout` elapses.
    ///
    /// # Errors
    /// Validation, not-found and storage errors from `ensure`; `Timeout`
    /// past `timeout`.
    pub fn ensure_and_wait(&self, request: &EconomyRequest, timeout: Duration) -> CacheResult<Computation> {
        poll_until_terminal(timeout, self.poll_interval, || {
            retry_when_queue_full(self.ensure(request))
        })
    }

    /// The registered countries.
    #[must_use]
    pub const fn countries(&self) -> &Countries {
        &self.countries
    }

    /// Queued economy jobs.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.pool.queued()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EngineVersion;
    use crate::storage::{InMemoryStores, InMemoryTable};
    use serde_json::json;

    type Table = InMemoryTable<EconomyKey, CacheEntry>;

    fn key() -> EconomyKey {
        Fingerprint::new(EngineVersion::new("1.0.0")).economy(
            &CountryId::new("uk"),
            PolicyId(1),
            "national",
            "2024",
            &BTreeMap::new(),
        )
    }

    #[test]
    fn claim_reserves_once() {
        let table = Table::new("economy");
        let Claim::Owned(token) = claim(&table, &key(), None).unwrap() else {
            panic!("first claim must own the key");
        };
        assert_eq!(claim(&table, &key(), None).unwrap(), Claim::InFlight);

        assert!(settle(&table, &key(), token, CacheEntry::ok(json!({"v": 1}))).unwrap());
        let Claim::Terminal(done) = claim(&table, &key(), None).unwrap() else {
            panic!("expected terminal");
        };
        assert_eq!(done.result, Some(json!({"v": 1})));
    }

    #[test]
    fn cached_error_is_terminal() {
        let table = Table::new("economy");
        table.upsert(key(), CacheEntry::error("boom")).unwrap();
        let claimed = claim(&table, &key(), Some(Duration::ZERO)).unwrap();
        assert_eq!(
            claimed,
            Claim::Terminal(Computation {
                status: RecordStatus::Error,
                result: None,
                message: Some("boom".to_string()),
            })
        );
    }

    #[test]
    fn stale_reservation_is_reclaimed_and_old_owner_cannot_settle() {
        let table = Table::new("economy");
        let Claim::Owned(old) = claim(&table, &key(), None).unwrap() else {
            panic!("expected ownership");
        };
        assert_eq!(claim(&table, &key(), Some(Duration::from_secs(3600))).unwrap(), Claim::InFlight);

        let Claim::Owned(new) = claim(&table, &key(), Some(Duration::ZERO)).unwrap() else {
            panic!("expected reclaim");
        };
        assert_ne!(old, new);
        assert!(!settle(&table, &key(), old, CacheEntry::ok(json!(1))).unwrap());
        assert!(settle(&table, &key(), new, CacheEntry::ok(json!(2))).unwrap());
    }

    #[test]
    fn release_only_removes_own_placeholder() {
        let table = Table::new("economy");
        let Claim::Owned(token) = claim(&table, &key(), None).unwrap() else {
            panic!("expected ownership");
        };
        assert!(!release(&table, &key(), Uuid::new_v4()).unwrap());
        assert!(release(&table, &key(), token).unwrap());
        assert!(table.get(&key()).unwrap().is_none());
    }

    #[test]
    fn poll_times_out_on_computing() {
        let err = poll_until_terminal(Duration::from_millis(20), Duration::from_millis(5), || {
            Ok(Computation::computing())
        })
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn queue_full_keeps_polling_until_the_deadline() {
        let mut attempts = 0;
        let done = poll_until_terminal(Duration::from_secs(5), Duration::from_millis(1), || {
            attempts += 1;
            retry_when_queue_full(if attempts < 3 {
                Err(ExecutionError::QueueFull {
                    pool: "economy".to_string(),
                    capacity: 1,
                }
                .into())
            } else {
                Ok(Computation::from(&CacheEntry::ok(json!(1))))
            })
        })
        .unwrap();
        assert_eq!(done.status, RecordStatus::Ok);
        assert_eq!(attempts, 3);

        let err = poll_until_terminal(Duration::from_millis(20), Duration::from_millis(5), || {
            retry_when_queue_full(Err(ExecutionError::QueueFull {
                pool: "economy".to_string(),
                capacity: 1,
            }
            .into()))
        })
        .unwrap_err();
        assert!(matches!(err, CacheError::Execution(ExecutionError::Timeout { .. })), "{err}");

        let err = retry_when_queue_full(Err(CacheError::internal("gone"))).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn from_query_splits_options() {
        let query: BTreeMap<String, String> = [
            ("region", "national"),
            ("time_period", "2024"),
            ("max_households", "1000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let request = EconomyRequest::from_query("UK", PolicyId(2), query).unwrap();
        assert_eq!(request.country.as_str(), "uk");
        assert_eq!(request.options.len(), 1);

        let err = EconomyRequest::from_query("uk", PolicyId(2), BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { ref field } if field == "region"));
    }

    #[test]
    fn ensure_validates_before_touching_the_store() {
        let stores = InMemoryStores::new();
        let handles = stores.handles();
        let dispatcher = ComputationDispatcher::new(
            handles.economy,
            Countries::new(),
            PolicyCatalog::new(handles.policies, EngineVersion::new("1.0.0")),
            Fingerprint::new(EngineVersion::new("1.0.0")),
            WorkerPool::start("economy", 1, 4, Duration::from_millis(10)).unwrap(),
            None,
            Duration::from_millis(5),
        );

        let blank = EconomyRequest::new("uk", PolicyId(1), " ", "2024");
        assert!(dispatcher.ensure(&blank).unwrap_err().is_validation());

        let unknown = EconomyRequest::new("fr", PolicyId(1), "national", "2024");
        assert!(dispatcher.ensure(&unknown).unwrap_err().is_not_found());
        assert!(stores.economy.is_empty().unwrap());
    }
}
