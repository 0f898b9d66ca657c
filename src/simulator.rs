//! Interfaces to the simulation engine and the impact comparator.
//!
//! Both collaborators are pure functions from the cache's point of view.
//! Their failures are [`ComputationFailure`] values which the dispatcher and
//! resolver turn into terminal `error` records.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Number, Value};

use crate::error::{CacheResult, ComputationFailure, ExecutionError};
use crate::household::Slot;
use crate::policy::{ParameterPatch, ParameterTree};
use crate::record::{CountryId, PolicyId};

/// One economy-wide simulation.
#[derive(Debug, Clone)]
pub struct EconomyRun {
    /// Country being simulated.
    pub country: CountryId,
    /// Policy the run is for.
    pub policy_id: PolicyId,
    /// Patches that produced `parameters`.
    pub reform: Vec<ParameterPatch>,
    /// Effective rule set (base parameters with the reform applied).
    pub parameters: ParameterTree,
    /// Region filter, e.g. `national`.
    pub region: String,
    /// Time period, e.g. `2024`.
    pub time_period: String,
    /// Auxiliary options.
    pub options: BTreeMap<String, String>,
}

/// One requested household slot.
#[derive(Debug, Clone, Copy)]
pub struct HouseholdCalculation<'a> {
    /// Country being simulated.
    pub country: &'a CountryId,
    /// The full household description (inputs and empty slots).
    pub household: &'a Value,
    /// Effective rule set.
    pub parameters: &'a ParameterTree,
    /// The slot to fill.
    pub slot: &'a Slot,
    /// True when the household varies along `axes`; the result is then a series.
    pub axes: bool,
}

/// Value computed for one household slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    /// Floating point result.
    Number(f64),
    /// Integer result.
    Integer(i64),
    /// Boolean result.
    Bool(bool),
    /// Text or enum-name result.
    Text(String),
    /// One value per point along the household's axes.
    Series(Vec<f64>),
}

impl SlotValue {
    /// Convert to JSON.
    ///
    /// A scalar infinity becomes the string `"Infinity"` or `"-Infinity"`.
    ///
    /// # Errors
    /// Returns [`ComputationFailure::InvalidNumeric`] for NaN anywhere and
    /// for an infinite value inside a series.
    pub fn to_json(&self) -> Result<Value, ComputationFailure> {
        match self {
            Self::Number(v) if v.is_nan() => Err(ComputationFailure::InvalidNumeric("NaN".to_string())),
            Self::Number(v) if v.is_infinite() => Ok(Value::String(
                if v.is_sign_positive() { "Infinity" } else { "-Infinity" }.to_string(),
            )),
            Self::Number(v) => finite_number(*v),
            Self::Integer(v) => Ok(Value::from(*v)),
            Self::Bool(v) => Ok(Value::Bool(*v)),
            Self::Text(v) => Ok(Value::String(v.clone())),
            Self::Series(values) => values
                .iter()
                .map(|v| {
                    if v.is_finite() {
                        finite_number(*v)
                    } else {
                        Err(ComputationFailure::InvalidNumeric(format!("series contains {v}")))
                    }
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }
}

fn finite_number(v: f64) -> Result<Value, ComputationFailure> {
    Number::from_f64(v)
        .map(Value::Number)
        .ok_or_else(|| ComputationFailure::InvalidNumeric(v.to_string()))
}

/// A country's simulation engine.
pub trait Simulator: Send + Sync {
    /// Base parameters (current law).
    fn parameters(&self) -> &ParameterTree;

    /// Run an economy-wide simulation and return its summary payload.
    fn simulate_economy(&self, run: &EconomyRun) -> Result<Value, ComputationFailure>;

    /// Compute one household slot.
    fn calculate(&self, calculation: &HouseholdCalculation<'_>) -> Result<SlotValue, ComputationFailure>;
}

/// Derives an impact payload from a baseline and a reform economy.
pub trait Comparator: Send + Sync {
    /// Compare two `ok` economy payloads.
    fn compare(&self, baseline: &Value, reform: &Value) -> Result<Value, ComputationFailure>;
}

/// Registry of supported countries.
#[derive(Clone, Default)]
pub struct Countries {
    simulators: HashMap<CountryId, Arc<dyn Simulator>>,
}

impl fmt::Debug for Countries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Countries").field("ids", &self.ids()).finish()
    }
}

impl Countries {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `simulator` for `country`.
    #[must_use]
    pub fn with(mut self, country: impl Into<String>, simulator: Arc<dyn Simulator>) -> Self {
        self.simulators.insert(CountryId::new(country), simulator);
        self
    }

    /// The simulator for `country`.
    ///
    /// # Errors
    /// Returns `CountryNotFound` for an unregistered country.
    pub fn get(&self, country: &CountryId) -> CacheResult<Arc<dyn Simulator>> {
        self.simulators.get(country).cloned().ok_or_else(|| {
            ExecutionError::CountryNotFound {
                country: country.clone(),
            }
            .into()
        })
    }

    /// Registered country ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<CountryId> {
        let mut ids: Vec<CountryId> = self.simulators.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Household-level arrays read from an economy payload.
struct Microdata {
    net_income: Vec<f64>,
    weight: Vec<f64>,
    people: Vec<f64>,
    decile: Vec<i64>,
    in_poverty: Vec<bool>,
}

fn field<'a>(payload: &'a Value, name: &str) -> Result<&'a Value, ComputationFailure> {
    payload
        .get(name)
        .ok_or_else(|| ComputationFailure::Comparison(format!("economy is missing '{name}'")))
}

fn scalar(payload: &Value, name: &str) -> Result<f64, ComputationFailure> {
    field(payload, name)?
        .as_f64()
        .ok_or_else(|| ComputationFailure::Comparison(format!("'{name}' is not a number")))
}

fn array<T>(payload: &Value, name: &str, read: impl Fn(&Value) -> Option<T>) -> Result<Vec<T>, ComputationFailure> {
    let bad = || ComputationFailure::Comparison(format!("'{name}' is not a homogeneous array"));
    field(payload, name)?
        .as_array()
        .ok_or_else(bad)?
        .iter()
        .map(|v| read(v).ok_or_else(bad))
        .collect()
}

impl Microdata {
    fn read(payload: &Value) -> Result<Self, ComputationFailure> {
        let net_income = array(payload, "household_net_income", Value::as_f64)?;
        let weight = array(payload, "household_weight", Value::as_f64)?;
        let people = match payload.get("household_count_people") {
            Some(_) => array(payload, "household_count_people", Value::as_f64)?,
            None => vec![1.0; net_income.len()],
        };
        let decile = array(payload, "household_income_decile", Value::as_i64)?;
        let in_poverty = array(payload, "in_poverty", Value::as_bool)?;

        let n = net_income.len();
        if [weight.len(), people.len(), decile.len(), in_poverty.len()]
            .iter()
            .any(|len| *len != n)
        {
            return Err(ComputationFailure::Comparison(
                "household arrays have different lengths".to_string(),
            ));
        }
        Ok(Self {
            net_income,
            weight,
            people,
            decile,
            in_poverty,
        })
    }

    fn poverty_rate(&self) -> f64 {
        let (poor, total) = self
            .in_poverty
            .iter()
            .zip(self.weight.iter().zip(&self.people))
            .fold((0.0, 0.0), |(poor, total), (is_poor, (w, p))| {
                let people = w * p;
                (if *is_poor { poor + people } else { poor }, total + people)
            });
        if total > 0.0 {
            poor / total
        } else {
            0.0
        }
    }
}

/// Default comparator over the economy summary shape.
///
/// Produces the budgetary impact, the average and relative change in
/// household net income per baseline income decile, and the change in the
/// person-weighted poverty rate.
#[derive(Debug, Default, Clone, Copy)]
pub struct EconomyComparator;

impl Comparator for EconomyComparator {
    fn compare(&self, baseline: &Value, reform: &Value) -> Result<Value, ComputationFailure> {
        let tax_revenue_impact = scalar(reform, "total_tax")? - scalar(baseline, "total_tax")?;
        let benefit_spending_impact =
            scalar(reform, "total_benefits")? - scalar(baseline, "total_benefits")?;
        let net_income_impact =
            scalar(reform, "total_net_income")? - scalar(baseline, "total_net_income")?;

        let base = Microdata::read(baseline)?;
        let next = Microdata::read(reform)?;
        if base.net_income.len() != next.net_income.len() {
            return Err(ComputationFailure::Comparison(
                "baseline and reform cover different households".to_string(),
            ));
        }

        // decile -> (weighted baseline income, weighted change, weight)
        let mut deciles: BTreeMap<i64, (f64, f64, f64)> = BTreeMap::new();
        for i in 0..base.net_income.len() {
            let entry = deciles.entry(base.decile[i]).or_insert((0.0, 0.0, 0.0));
            let w = base.weight[i];
            entry.0 += w * base.net_income[i];
            entry.1 += w * (next.net_income[i] - base.net_income[i]);
            entry.2 += w;
        }

        let mut average = Map::new();
        let mut relative = Map::new();
        for (decile, (income, change, weight)) in deciles {
            let avg = if weight > 0.0 { change / weight } else { 0.0 };
            let rel = if income.abs() > f64::EPSILON { change / income } else { 0.0 };
            average.insert(decile.to_string(), finite_number(avg)?);
            relative.insert(decile.to_string(), finite_number(rel)?);
        }

        let baseline_poverty = base.poverty_rate();
        let reform_poverty = next.poverty_rate();

        Ok(json!({
            "budget": {
                "tax_revenue_impact": tax_revenue_impact,
                "benefit_spending_impact": benefit_spending_impact,
                "budgetary_impact": tax_revenue_impact - benefit_spending_impact,
                "net_income_impact": net_income_impact,
            },
            "decile": {
                "average": average,
                "relative": relative,
            },
            "poverty": {
                "baseline": baseline_poverty,
                "reform": reform_poverty,
                "change": reform_poverty - baseline_poverty,
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn economy(net: [f64; 4], tax: f64, benefits: f64, poor: [bool; 4]) -> Value {
        json!({
            "total_net_income": net.iter().sum::<f64>(),
            "total_tax": tax,
            "total_benefits": benefits,
            "household_net_income": net,
            "household_income_decile": [1, 1, 10, 10],
            "in_poverty": poor,
            "household_weight": [1.0, 1.0, 2.0, 2.0],
            "household_count_people": [1, 3, 2, 2],
        })
    }

    #[test]
    fn scalar_infinity_becomes_string() {
        assert_eq!(SlotValue::Number(f64::INFINITY).to_json().unwrap(), json!("Infinity"));
        assert_eq!(SlotValue::Number(f64::NEG_INFINITY).to_json().unwrap(), json!("-Infinity"));
        assert_eq!(SlotValue::Number(1.5).to_json().unwrap(), json!(1.5));
    }

    #[test]
    fn non_finite_series_and_nan_are_invalid() {
        let err = SlotValue::Series(vec![1.0, f64::INFINITY]).to_json().unwrap_err();
        assert!(matches!(err, ComputationFailure::InvalidNumeric(_)));
        assert!(SlotValue::Number(f64::NAN).to_json().is_err());
        assert_eq!(SlotValue::Series(vec![1.0, 2.0]).to_json().unwrap(), json!([1.0, 2.0]));
    }

    #[test]
    fn unknown_country_is_not_found() {
        let err = Countries::new().get(&CountryId::new("fr")).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn comparator_reports_budget_deciles_and_poverty() {
        let baseline = economy([100.0, 200.0, 1000.0, 2000.0], 500.0, 50.0, [true, true, false, false]);
        let reform = economy([110.0, 220.0, 1000.0, 2000.0], 480.0, 80.0, [false, true, false, false]);

        let impact = EconomyComparator.compare(&baseline, &reform).unwrap();
        assert_eq!(impact["budget"]["tax_revenue_impact"], json!(-20.0));
        assert_eq!(impact["budget"]["benefit_spending_impact"], json!(30.0));
        assert_eq!(impact["budget"]["budgetary_impact"], json!(-50.0));
        assert_eq!(impact["decile"]["average"]["1"], json!(15.0));
        assert_eq!(impact["decile"]["average"]["10"], json!(0.0));
        assert_eq!(impact["decile"]["relative"]["1"], json!(0.1));

        // people: 1, 3, 4, 4 -> baseline poor 4/12, reform poor 3/12
        let change = impact["poverty"]["change"].as_f64().unwrap();
        assert!((change - (-1.0 / 12.0)).abs() < 1e-12);
    }

    #[test]
    fn comparator_is_pure() {
        let baseline = economy([1.0, 2.0, 3.0, 4.0], 10.0, 1.0, [false; 4]);
        let reform = economy([2.0, 2.0, 3.0, 4.0], 9.0, 1.0, [false; 4]);
        assert_eq!(
            EconomyComparator.compare(&baseline, &reform).unwrap(),
            EconomyComparator.compare(&baseline, &reform).unwrap()
        );
    }

    #[test]
    fn comparator_rejects_incomplete_economies() {
        let err = EconomyComparator.compare(&json!({}), &json!({})).unwrap_err();
        assert!(matches!(err, ComputationFailure::Comparison(_)));
    }
}
