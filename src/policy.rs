//! Policy reforms as parameter patches.
//!
//! A stored policy definition has the shape
//! `{ "a.b.c": { "YYYY-MM-DD.YYYY-MM-DD": value } }`. It is parsed into an
//! ordered list of [`ParameterPatch`]es and applied to a country's base
//! [`ParameterTree`] to produce the effective rule set a simulation runs under.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// One `(path, time range, value)` change to a parameter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterPatch {
    /// Dotted parameter path, e.g. `gov.tax.income.rate`.
    pub path: String,
    /// First day the value applies (inclusive).
    pub start: NaiveDate,
    /// Last day the value applies (inclusive).
    pub end: NaiveDate,
    /// The new value.
    pub value: f64,
}

fn parse_date(raw: &str, period: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(|e| ValidationError::InvalidPeriod {
        period: period.to_string(),
        reason: format!("'{raw}' is not a YYYY-MM-DD date: {e}"),
    })
}

fn parse_value(path: &str, raw: &Value) -> Result<f64, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidField {
        field: path.to_string(),
        reason,
    };
    match raw {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| invalid(format!("{n} is not representable as f64"))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| invalid(format!("'{s}' is not a number: {e}"))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(invalid(format!("unsupported value {other}"))),
    }
}

/// Parse a stored reform definition into patches, in path then period order.
///
/// # Errors
/// Returns a [`ValidationError`] if the definition is not an object of
/// objects, a period is not `start.end`, or a value is not numeric.
pub fn parse_reform(definition: &Value) -> Result<Vec<ParameterPatch>, ValidationError> {
    let Value::Object(paths) = definition else {
        return Err(ValidationError::InvalidField {
            field: "policy".to_string(),
            reason: "reform definition must be a JSON object".to_string(),
        });
    };

    let mut patches = Vec::new();
    for (path, periods) in paths {
        let Value::Object(periods) = periods else {
            return Err(ValidationError::InvalidField {
                field: path.clone(),
                reason: "expected an object of periods".to_string(),
            });
        };
        for (period, raw) in periods {
            let (start, end) = period
                .split_once('.')
                .ok_or_else(|| ValidationError::InvalidPeriod {
                    period: period.clone(),
                    reason: "expected 'start.end'".to_string(),
                })?;
            let start = parse_date(start, period)?;
            let end = parse_date(end, period)?;
            if end < start {
                return Err(ValidationError::InvalidPeriod {
                    period: period.clone(),
                    reason: "end precedes start".to_string(),
                });
            }
            patches.push(ParameterPatch {
                path: path.clone(),
                start,
                end,
                value: parse_value(path, raw)?,
            });
        }
    }
    Ok(patches)
}

/// A time-varying scalar parameter.
///
/// Each breakpoint holds from its date until the next breakpoint. A `None`
/// breakpoint marks the parameter as undefined from that date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameter {
    breakpoints: BTreeMap<NaiveDate, Option<f64>>,
}

impl Parameter {
    /// A parameter with no values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A parameter holding `value` from `from` onward.
    #[must_use]
    pub fn starting(from: NaiveDate, value: f64) -> Self {
        let mut parameter = Self::new();
        parameter.set(from, value);
        parameter
    }

    /// Set `value` from `from` until the next existing breakpoint.
    pub fn set(&mut self, from: NaiveDate, value: f64) {
        self.breakpoints.insert(from, Some(value));
    }

    /// The value in force on `date`.
    #[must_use]
    pub fn value_at(&self, date: NaiveDate) -> Option<f64> {
        self.breakpoints
            .range(..=date)
            .next_back()
            .and_then(|(_, value)| *value)
    }

    /// Set `value` over `start..=stop`, leaving every other date unchanged.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidPeriod`] if `stop` precedes `start`.
    pub fn update(&mut self, start: NaiveDate, stop: NaiveDate, value: f64) -> Result<(), ValidationError> {
        if stop < start {
            return Err(ValidationError::InvalidPeriod {
                period: format!("{start}.{stop}"),
                reason: "end precedes start".to_string(),
            });
        }

        let resume = stop.succ_opt();
        let after = resume.map(|day| {
            self.breakpoints
                .range(..=day)
                .next_back()
                .and_then(|(_, value)| *value)
        });

        self.breakpoints.retain(|date, _| *date < start || *date > stop);
        self.breakpoints.insert(start, Some(value));
        if let (Some(day), Some(previous)) = (resume, after) {
            self.breakpoints.entry(day).or_insert(previous);
        }
        Ok(())
    }

    /// Breakpoints in date order.
    pub fn breakpoints(&self) -> impl Iterator<Item = (NaiveDate, Option<f64>)> + '_ {
        self.breakpoints.iter().map(|(date, value)| (*date, *value))
    }
}

/// A node of a parameter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterNode {
    /// Named children.
    Branch(BTreeMap<String, ParameterNode>),
    /// A scalar parameter.
    Leaf(Parameter),
}

/// A country's rule set: parameters addressed by dotted path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterTree {
    root: BTreeMap<String, ParameterNode>,
}

impl ParameterTree {
    /// An empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `parameter` at `path`, creating intermediate branches.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidParameterPath`] if the path is empty
    /// or passes through an existing leaf.
    pub fn insert(&mut self, path: &str, parameter: Parameter) -> Result<(), ValidationError> {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(invalid_path(path, path));
        };
        if last.is_empty() {
            return Err(invalid_path(path, last));
        }

        let mut children = &mut self.root;
        for segment in parents {
            if segment.is_empty() {
                return Err(invalid_path(path, segment));
            }
            let node = children
                .entry((*segment).to_string())
                .or_insert_with(|| ParameterNode::Branch(BTreeMap::new()));
            children = match node {
                ParameterNode::Branch(next) => next,
                ParameterNode::Leaf(_) => return Err(invalid_path(path, segment)),
            };
        }
        children.insert((*last).to_string(), ParameterNode::Leaf(parameter));
        Ok(())
    }

    /// The parameter at `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Parameter> {
        let mut segments = path.split('.');
        let mut node = self.root.get(segments.next()?)?;
        for segment in segments {
            node = match node {
                ParameterNode::Branch(children) => children.get(segment)?,
                ParameterNode::Leaf(_) => return None,
            };
        }
        match node {
            ParameterNode::Leaf(parameter) => Some(parameter),
            ParameterNode::Branch(_) => None,
        }
    }

    /// The value of the parameter at `path` on `date`.
    #[must_use]
    pub fn value_at(&self, path: &str, date: NaiveDate) -> Option<f64> {
        self.get(path)?.value_at(date)
    }

    fn get_mut(&mut self, path: &str) -> Result<&mut Parameter, ValidationError> {
        let mut segments = path.split('.');
        let first = segments.next().unwrap_or_default();
        let mut node = self
            .root
            .get_mut(first)
            .ok_or_else(|| invalid_path(path, first))?;
        for segment in segments {
            node = match node {
                ParameterNode::Branch(children) => children
                    .get_mut(segment)
                    .ok_or_else(|| invalid_path(path, segment))?,
                ParameterNode::Leaf(_) => return Err(invalid_path(path, segment)),
            };
        }
        match node {
            ParameterNode::Leaf(parameter) => Ok(parameter),
            ParameterNode::Branch(_) => Err(invalid_path(path, path.rsplit('.').next().unwrap_or(path))),
        }
    }
}

fn invalid_path(path: &str, segment: &str) -> ValidationError {
    ValidationError::InvalidParameterPath {
        path: path.to_string(),
        segment: segment.to_string(),
    }
}

/// Apply `patches` in order to a copy of `base`.
///
/// # Errors
/// Returns [`ValidationError::InvalidParameterPath`] if a patch names a path
/// that does not end at a parameter.
pub fn apply_patches(base: &ParameterTree, patches: &[ParameterPatch]) -> Result<ParameterTree, ValidationError> {
    let mut effective = base.clone();
    for patch in patches {
        effective
            .get_mut(&patch.path)?
            .update(patch.start, patch.end, patch.value)?;
    }
    Ok(effective)
}
