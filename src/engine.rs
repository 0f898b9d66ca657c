//! Engine facade.
//!
//! `ComputeEngine` wires the catalogs, the dispatcher, the resolver and the
//! household computer over one set of explicit store handles. There is no
//! process-wide state: two engines over different stores are independent.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::catalog::{HouseholdCatalog, PolicyCatalog};
use crate::config::CacheConfig;
use crate::dispatcher::{ComputationDispatcher, EconomyRequest};
use crate::error::CacheResult;
use crate::fingerprint::Fingerprint;
use crate::household::{HouseholdComputation, HouseholdComputer};
use crate::pool::WorkerPool;
use crate::record::{Computation, CountryId, HouseholdId, PolicyId};
use crate::resolver::{DependencyResolver, ImpactRequest};
use crate::simulator::{Comparator, Countries};
use crate::storage::CacheStores;

/// Memoizing front end for economy, impact and household computations.
pub struct ComputeEngine {
    config: CacheConfig,
    fingerprint: Fingerprint,
    policies: PolicyCatalog,
    households: HouseholdCatalog,
    resolver: DependencyResolver,
    dispatcher: Arc<ComputationDispatcher>,
    household: HouseholdComputer,
}

impl ComputeEngine {
    /// Build an engine and start its worker pools.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for an invalid `config`, or an internal error
    /// if worker threads cannot be spawned.
    pub fn new(
        stores: CacheStores,
        countries: Countries,
        comparator: Arc<dyn Comparator>,
        config: CacheConfig,
    ) -> CacheResult<Self> {
        config.validate()?;
        let fingerprint = Fingerprint::new(config.engine_version());
        let policies = PolicyCatalog::new(stores.policies, config.engine_version());
        let households = HouseholdCatalog::new(stores.households);

        let dispatcher = Arc::new(ComputationDispatcher::new(
            stores.economy,
            countries.clone(),
            policies.clone(),
            fingerprint.clone(),
            WorkerPool::start(
                "economy",
                config.economy_workers,
                config.queue_capacity,
                config.submit_timeout(),
            )?,
            config.stale_after(),
            config.poll_interval(),
        ));

        let resolver = DependencyResolver::new(
            stores.reform_impact,
            Arc::clone(&dispatcher),
            comparator,
            policies.clone(),
            fingerprint.clone(),
            WorkerPool::start(
                "impact",
                config.impact_workers,
                config.queue_capacity,
                config.submit_timeout(),
            )?,
            config.stale_after(),
            config.poll_interval(),
            config.wait_timeout(),
        );

        let household = HouseholdComputer::new(
            stores.computed_household,
            policies.clone(),
            households.clone(),
            countries.clone(),
            fingerprint.clone(),
        );

        info!(
            engine_version = %fingerprint.engine_version(),
            countries = ?countries.ids(),
            economy_workers = config.economy_workers,
            impact_workers = config.impact_workers,
            "compute engine started"
        );

        Ok(Self {
            config,
            fingerprint,
            policies,
            households,
            resolver,
            dispatcher,
            household,
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key builder stamped with this engine's version.
    #[must_use]
    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Policy catalog.
    #[must_use]
    pub const fn policies(&self) -> &PolicyCatalog {
        &self.policies
    }

    /// Household catalog.
    #[must_use]
    pub const fn households(&self) -> &HouseholdCatalog {
        &self.households
    }

    /// The economy dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &ComputationDispatcher {
        &self.dispatcher
    }

    /// The impact resolver.
    #[must_use]
    pub const fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Return the cached economy or start computing it.
    pub fn ensure_economy(&self, request: &EconomyRequest) -> CacheResult<Computation> {
        self.dispatcher.ensure(request)
    }

    /// Ensure an economy and wait up to the configured timeout.
    pub fn economy_and_wait(&self, request: &EconomyRequest) -> CacheResult<Computation> {
        self.dispatcher.ensure_and_wait(request, self.config.wait_timeout())
    }

    /// Return the cached impact or schedule it.
    pub fn request_impact(&self, request: &ImpactRequest) -> CacheResult<Computation> {
        self.resolver.request_impact(request)
    }

    /// Request an impact and wait up to the configured timeout.
    pub fn impact_and_wait(&self, request: &ImpactRequest) -> CacheResult<Computation> {
        self.impact_and_wait_for(request, self.config.wait_timeout())
    }

    /// Request an impact and wait up to `timeout`.
    pub fn impact_and_wait_for(&self, request: &ImpactRequest, timeout: Duration) -> CacheResult<Computation> {
        self.resolver.request_and_wait(request, timeout)
    }

    /// Compute (or fetch) a household under a policy.
    pub fn compute_household(
        &self,
        country: &CountryId,
        household_id: HouseholdId,
        policy_id: PolicyId,
    ) -> CacheResult<HouseholdComputation> {
        self.household.get_or_compute(country, household_id, policy_id)
    }
}
