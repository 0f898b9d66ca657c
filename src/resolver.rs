//! Reform impact resolution.
//!
//! An impact depends on two economies: the baseline and the reform. The
//! resolver reserves the impact record with the same token discipline as
//! the dispatcher, then runs the pipeline on the impact pool:
//!
//! 1. `ensure` both economies (they are simulated concurrently on the
//!    economy pool) and block until both are terminal.
//! 2. If either resolved to `error`, store an `error` impact; the comparator
//!    is not called.
//! 3. Otherwise compare and store the `ok` impact.
//!
//! Impact pipelines and economy simulations run on separate pools, so a
//! pipeline waiting on its prerequisites never occupies a thread those
//! prerequisites need.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::PolicyCatalog;
use crate::dispatcher::{
    claim, poll_until_terminal, release, require, retry_when_queue_full, settle,
    take_region_and_period, Claim,
    ComputationDispatcher, EconomyRequest,
};
use crate::error::{CacheError, CacheResult, ComputationFailure, ValidationError};
use crate::fingerprint::Fingerprint;
use crate::pool::{panic_message, WorkerPool};
use crate::record::{CacheEntry, Computation, CountryId, PolicyId, RecordStatus, ReformImpactKey};
use crate::simulator::Comparator;
use crate::storage::ReformImpactTable;

/// Parameters of a reform impact, as requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpactRequest {
    /// Country to simulate.
    pub country: CountryId,
    /// The reform policy.
    pub reform_policy_id: PolicyId,
    /// The baseline policy; current law when `None`.
    pub baseline_policy_id: Option<PolicyId>,
    /// Region filter.
    pub region: String,
    /// Time period.
    pub time_period: String,
    /// Auxiliary options; part of the cache key.
    pub options: BTreeMap<String, String>,
}

impl ImpactRequest {
    /// A request against current law with no auxiliary options.
    #[must_use]
    pub fn new(
        country: impl Into<String>,
        reform_policy_id: PolicyId,
        region: impl Into<String>,
        time_period: impl Into<String>,
    ) -> Self {
        Self {
            country: CountryId::new(country),
            reform_policy_id,
            baseline_policy_id: None,
            region: region.into(),
            time_period: time_period.into(),
            options: BTreeMap::new(),
        }
    }

    /// Compare against `baseline` instead of current law.
    #[must_use]
    pub fn against(mut self, baseline: PolicyId) -> Self {
        self.baseline_policy_id = Some(baseline);
        self
    }

    /// Add an auxiliary option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Build a request from query parameters; see [`EconomyRequest::from_query`].
    ///
    /// # Errors
    /// Returns `MissingField` if `region` or `time_period` is absent.
    pub fn from_query(
        country: impl Into<String>,
        reform_policy_id: PolicyId,
        baseline_policy_id: Option<PolicyId>,
        mut query: BTreeMap<String, String>,
    ) -> Result<Self, ValidationError> {
        let (region, time_period) = take_region_and_period(&mut query)?;
        Ok(Self {
            country: CountryId::new(country),
            reform_policy_id,
            baseline_policy_id,
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

    fn economy(&self, policy_id: PolicyId) -> EconomyRequest {
        EconomyRequest {
            country: self.country.clone(),
            policy_id,
            region: self.region.clone(),
            time_period: self.time_period.clone(),
            options: self.options.clone(),
        }
    }
}

/// An impact request with its baseline resolved and its key computed.
#[derive(Debug, Clone)]
struct Pipeline {
    key: ReformImpactKey,
    baseline: EconomyRequest,
    reform: EconomyRequest,
}

/// State shared with impact workers.
struct ImpactContext {
    table: Arc<ReformImpactTable>,
    dispatcher: Arc<ComputationDispatcher>,
    comparator: Arc<dyn Comparator>,
    dependency_timeout: Duration,
}

impl ImpactContext {
    /// Produce the terminal impact entry. `Err` means the pipeline could not
    /// finish (not that a computation failed).
    fn compute(&self, pipeline: &Pipeline) -> CacheResult<CacheEntry> {
        let deadline = Instant::now() + self.dependency_timeout;

        // Both ensures return immediately, so the economies run concurrently.
        // A full economy queue is retried by the waits below.
        let baseline = retry_when_queue_full(self.dispatcher.ensure(&pipeline.baseline))?;
        let reform = retry_when_queue_full(self.dispatcher.ensure(&pipeline.reform))?;

        let remaining = || deadline.saturating_duration_since(Instant::now());
        let baseline = if baseline.is_terminal() {
            baseline
        } else {
            self.dispatcher.ensure_and_wait(&pipeline.baseline, remaining())?
        };
        let reform = if reform.is_terminal() {
            reform
        } else {
            self.dispatcher.ensure_and_wait(&pipeline.reform, remaining())?
        };

        if baseline.status != RecordStatus::Ok || reform.status != RecordStatus::Ok {
            warn!(
                baseline_policy_id = %pipeline.key.baseline_policy_id,
                reform_policy_id = %pipeline.key.reform_policy_id,
                baseline_status = %baseline.status,
                reform_status = %reform.status,
                "prerequisite economy failed"
            );
            return Ok(CacheEntry::error(ComputationFailure::Dependency.to_string()));
        }

        let (Some(baseline), Some(reform)) = (baseline.result, reform.result) else {
            return Err(CacheError::internal("ok economy without a result payload"));
        };

        let compared = panic::catch_unwind(AssertUnwindSafe(|| self.comparator.compare(&baseline, &reform)))
            .unwrap_or_else(|payload| Err(ComputationFailure::Panicked(panic_message(payload.as_ref()))));
        Ok(match compared {
            Ok(impact) => CacheEntry::ok(impact),
            Err(failure) => {
                warn!(
                    reform_policy_id = %pipeline.key.reform_policy_id,
                    error = %failure,
                    "impact comparison failed"
                );
                CacheEntry::error(failure.to_string())
            }
        })
    }

    /// Run the pipeline for a reservation held under `token`.
    fn run(&self, pipeline: &Pipeline, token: Uuid) -> CacheResult<Computation> {
        let key = &pipeline.key;
        let entry = match self.compute(pipeline) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    reform_policy_id = %key.reform_policy_id,
                    error = %e,
                    "impact pipeline aborted; releasing reservation"
                );
                release(self.table.as_ref(), key, token)?;
                return Err(e);
            }
        };

        let computation = Computation::from(&entry);
        if settle(self.table.as_ref(), key, token, entry)? {
            info!(
                country = %key.country,
                baseline_policy_id = %key.baseline_policy_id,
                reform_policy_id = %key.reform_policy_id,
                status = %computation.status,
                "reform impact resolved"
            );
        } else {
            debug!(reform_policy_id = %key.reform_policy_id, "impact reservation lost; result discarded");
        }
        Ok(computation)
    }
}

/// Memoizing resolver for reform impacts.
pub struct DependencyResolver {
    ctx: Arc<ImpactContext>,
    policies: PolicyCatalog,
    fingerprint: Fingerprint,
    pool: WorkerPool,
    stale_after: Option<Duration>,
    poll_interval: Duration,
}

impl DependencyResolver {
    /// Create a resolver over `table`, running pipelines on `pool`.
    ///
    /// `dependency_timeout` bounds how long a pipeline waits for its two
    /// economies.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: Arc<ReformImpactTable>,
        dispatcher: Arc<ComputationDispatcher>,
        comparator: Arc<dyn Comparator>,
        policies: PolicyCatalog,
        fingerprint: Fingerprint,
        pool: WorkerPool,
        stale_after: Option<Duration>,
        poll_interval: Duration,
        dependency_timeout: Duration,
    ) -> Self {
        Self {
            ctx: Arc::new(ImpactContext {
                table,
                dispatcher,
                comparator,
                dependency_timeout,
            }),
            policies,
            fingerprint,
            pool,
            stale_after,
            poll_interval,
        }
    }

    /// Validate `request`, resolve its baseline and check both policies exist.
    fn prepare(&self, request: &ImpactRequest) -> CacheResult<Pipeline> {
        request.validate()?;
        self.ctx.dispatcher.countries().get(&request.country)?;

        let baseline_id = match request.baseline_policy_id {
            Some(id) => id,
            None => self.policies.current_law_id(&request.country)?,
        };
        self.policies.get(&request.country, baseline_id)?;
        self.policies.get(&request.country, request.reform_policy_id)?;

        Ok(Pipeline {
            key: self.fingerprint.reform_impact(
                &request.country,
                baseline_id,
                request.reform_policy_id,
                &request.region,
                &request.time_period,
                &request.options,
            ),
            baseline: request.economy(baseline_id),
            reform: request.economy(request.reform_policy_id),
        })
    }

    /// Cache key of `request`, with the default baseline resolved.
    pub fn key(&self, request: &ImpactRequest) -> CacheResult<ReformImpactKey> {
        Ok(self.prepare(request)?.key)
    }

    /// Return the cached impact or schedule its pipeline on the impact pool.
    ///
    /// # Errors
    /// Validation, not-found and storage errors; `QueueFull` if the impact
    /// pool cannot take the pipeline (the reservation is released).
    pub fn request_impact(&self, request: &ImpactRequest) -> CacheResult<Computation> {
        let pipeline = self.prepare(request)?;
        let token = match claim(self.ctx.table.as_ref(), &pipeline.key, self.stale_after)? {
            Claim::Terminal(computation) => return Ok(computation),
            Claim::InFlight => return Ok(Computation::computing()),
            Claim::Owned(token) => token,
        };

        debug!(
            country = %pipeline.key.country,
            baseline_policy_id = %pipeline.key.baseline_policy_id,
            reform_policy_id = %pipeline.key.reform_policy_id,
            "scheduling reform impact pipeline"
        );

        let ctx = Arc::clone(&self.ctx);
        let job = pipeline.clone();
        let submitted = self.pool.submit(move || {
            if let Err(e) = ctx.run(&job, token) {
                error!(reform_policy_id = %job.key.reform_policy_id, error = %e, "impact pipeline failed");
            }
        });

        if let Err(e) = submitted {
            warn!(error = %e, "impact job rejected; releasing reservation");
            release(self.ctx.table.as_ref(), &pipeline.key, token)?;
            return Err(e);
        }
        Ok(Computation::computing())
    }

    /// Resolve an impact on the calling thread, blocking until it is terminal.
    ///
    /// A cached result is returned as is; if another worker owns the
    /// reservation this waits for it instead of starting a second pipeline.
    pub fn resolve_impact(&self, request: &ImpactRequest, timeout: Duration) -> CacheResult<Computation> {
        let pipeline = self.prepare(request)?;
        match claim(self.ctx.table.as_ref(), &pipeline.key, self.stale_after)? {
            Claim::Terminal(computation) => Ok(computation),
            Claim::InFlight => self.wait(&pipeline.key, timeout),
            Claim::Owned(token) => self.ctx.run(&pipeline, token),
        }
    }

    /// Current state of `key`.
    pub fn status(&self, key: &ReformImpactKey) -> CacheResult<Option<Computation>> {
        Ok(self.ctx.table.get(key)?.map(|row| Computation::from(&row.value)))
    }

    /// Block until `key` is terminal.
    ///
    /// # Errors
    /// `Timeout` past `timeout`; an internal error if the reservation was
    /// released because its pipeline aborted.
    pub fn wait(&self, key: &ReformImpactKey, timeout: Duration) -> CacheResult<Computation> {
        poll_until_terminal(timeout, self.poll_interval, || {
            self.status(key)?.ok_or_else(|| {
                CacheError::internal(format!(
                    "impact record for policy {} was released",
                    key.reform_policy_id
                ))
            })
        })
    }

    /// `request_impact`, then poll until terminal.
    ///
    /// Re-requests on every poll, so a full impact queue or a pipeline that
    /// aborted and released its reservation is scheduled again while time
    /// remains.
    pub fn request_and_wait(&self, request: &ImpactRequest, timeout: Duration) -> CacheResult<Computation> {
        poll_until_terminal(timeout, self.poll_interval, || {
            retry_when_queue_full(self.request_impact(request))
        })
    }
}
