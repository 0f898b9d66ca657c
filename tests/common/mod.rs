//! Shared fixtures: a deterministic stub simulator and a call-counting comparator.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::{json, Value};

use impactcache::{
    CacheConfig, Comparator, ComputationFailure, ComputeEngine, Countries, EconomyComparator,
    EconomyRun, HouseholdCalculation, InMemoryStores, Parameter, ParameterTree, PolicyId,
    SlotValue, Simulator,
};

pub const GROSS: [f64; 4] = [800.0, 2000.0, 3000.0, 4000.0];

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn period_start(time_period: &str) -> NaiveDate {
    let year: i32 = time_period.get(..4).and_then(|y| y.parse().ok()).unwrap_or(2024);
    NaiveDate::from_ymd_opt(year, 1, 1).unwrap()
}

/// Four-household toy economy: a flat income tax and a benefit paid to the
/// poorest household.
pub struct StubSimulator {
    parameters: ParameterTree,
    delay: Duration,
    calls: AtomicUsize,
    per_policy: Mutex<BTreeMap<PolicyId, usize>>,
    failing: Mutex<HashSet<PolicyId>>,
    panicking: Mutex<HashSet<PolicyId>>,
}

impl StubSimulator {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        let mut parameters = ParameterTree::new();
        parameters
            .insert("tax.rate", Parameter::starting(date("2000-01-01"), 0.2))
            .unwrap();
        parameters
            .insert("benefit.amount", Parameter::starting(date("2000-01-01"), 100.0))
            .unwrap();
        Self {
            parameters,
            delay,
            calls: AtomicUsize::new(0),
            per_policy: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(HashSet::new()),
            panicking: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_for(&self, policy: PolicyId) {
        self.failing.lock().unwrap().insert(policy);
    }

    pub fn panic_for(&self, policy: PolicyId) {
        self.panicking.lock().unwrap().insert(policy);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, policy: PolicyId) -> usize {
        self.per_policy.lock().unwrap().get(&policy).copied().unwrap_or(0)
    }
}

impl Simulator for StubSimulator {
    fn parameters(&self) -> &ParameterTree {
        &self.parameters
    }

    fn simulate_economy(&self, run: &EconomyRun) -> Result<Value, ComputationFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.per_policy.lock().unwrap().entry(run.policy_id).or_insert(0) += 1;
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.panicking.lock().unwrap().contains(&run.policy_id) {
            panic!("simulated engine crash");
        }
        if self.failing.lock().unwrap().contains(&run.policy_id) {
            return Err(ComputationFailure::Simulation("microsimulation diverged".to_string()));
        }

        let on = period_start(&run.time_period);
        let rate = run.parameters.value_at("tax.rate", on).unwrap_or(0.0);
        let benefit = run.parameters.value_at("benefit.amount", on).unwrap_or(0.0);

        let tax: Vec<f64> = GROSS.iter().map(|g| g * rate).collect();
        let benefits = [benefit, 0.0, 0.0, 0.0];
        let net: Vec<f64> = (0..4).map(|i| GROSS[i] - tax[i] + benefits[i]).collect();

        Ok(json!({
            "total_net_income": net.iter().sum::<f64>(),
            "total_tax": tax.iter().sum::<f64>(),
            "total_benefits": benefits.iter().sum::<f64>(),
            "household_net_income": net,
            "household_income_decile": [1, 4, 7, 10],
            "in_poverty": net.iter().map(|n| *n < 1000.0).collect::<Vec<_>>(),
            "household_weight": [1.0, 1.0, 1.0, 1.0],
            "household_count_people": [1, 2, 2, 3],
            "region": run.region,
            "options": run.options,
        }))
    }

    fn calculate(&self, calculation: &HouseholdCalculation<'_>) -> Result<SlotValue, ComputationFailure> {
        let slot = calculation.slot;
        let on = period_start(&slot.period);
        let rate = calculation.parameters.value_at("tax.rate", on).unwrap_or(0.0);
        let income = calculation.household[&slot.entity_plural][&slot.entity_id]["employment_income"]
            [&slot.period]
            .as_f64()
            .unwrap_or(0.0);

        match slot.variable.as_str() {
            "income_tax" if calculation.axes => {
                Ok(SlotValue::Series((0..3).map(|i| f64::from(i) * 1000.0 * rate).collect()))
            }
            "income_tax" => Ok(SlotValue::Number(income * rate)),
            "is_taxpayer" => Ok(SlotValue::Bool(income * rate > 0.0)),
            "marginal_rate_cap" => Ok(SlotValue::Number(f64::INFINITY)),
            "divergent_series" => Ok(SlotValue::Series(vec![1.0, f64::INFINITY])),
            "broken" => Err(ComputationFailure::Simulation("variable not defined".to_string())),
            "explodes" => panic!("formula panicked"),
            other => Err(ComputationFailure::Simulation(format!("unknown variable {other}"))),
        }
    }
}

/// Delegates to [`EconomyComparator`] and counts calls.
#[derive(Default)]
pub struct CountingComparator {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingComparator {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Comparator for CountingComparator {
    fn compare(&self, baseline: &Value, reform: &Value) -> Result<Value, ComputationFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ComputationFailure::Comparison("decile arrays misaligned".to_string()));
        }
        EconomyComparator.compare(baseline, reform)
    }
}

pub fn test_config(engine_version: &str) -> CacheConfig {
    CacheConfig {
        engine_version: engine_version.to_string(),
        economy_workers: 4,
        impact_workers: 2,
        queue_capacity: 64,
        submit_timeout_ms: 50,
        poll_interval_ms: 2,
        wait_timeout_ms: 5_000,
        stale_after_secs: None,
    }
}

pub struct Harness {
    pub stores: InMemoryStores,
    pub simulator: Arc<StubSimulator>,
    pub comparator: Arc<CountingComparator>,
    pub engine: ComputeEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(StubSimulator::new(), CountingComparator::default(), test_config("1.0.0"))
    }

    pub fn build(simulator: StubSimulator, comparator: CountingComparator, config: CacheConfig) -> Self {
        let stores = InMemoryStores::new();
        let simulator = Arc::new(simulator);
        let comparator = Arc::new(comparator);
        let engine = ComputeEngine::new(
            stores.handles(),
            Countries::new().with("a", simulator.clone()),
            comparator.clone(),
            config,
        )
        .unwrap();
        Self {
            stores,
            simulator,
            comparator,
            engine,
        }
    }

    /// Store the empty reform (policy 1) and a reform raising the tax rate (policy 2).
    pub fn seed_policies(&self) -> (PolicyId, PolicyId) {
        let country = impactcache::CountryId::new("a");
        let baseline = self.engine.policies().current_law_id(&country).unwrap();
        let reform = self
            .engine
            .policies()
            .create(
                &country,
                json!({ "tax.rate": { "2024-01-01.2024-12-31": 0.25 } }),
                Some("Raise the flat rate".to_string()),
            )
            .unwrap();
        (baseline, reform)
    }
}
