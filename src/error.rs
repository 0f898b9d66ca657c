//! Error types for impactcache.
//!
//! Errors are strongly typed using thiserror. Only request-level problems
//! (bad input, unknown identifiers, storage and queue failures) surface as
//! errors; simulation failures are captured as [`ComputationFailure`] values
//! and stored in the cache instead of being propagated.

use thiserror::Error;

use crate::record::{CountryId, HouseholdId, PolicyId};
use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        field: String,
        reason: String,
    },

    #[error("Unknown parameter path '{path}' (failed at segment '{segment}')")]
    InvalidParameterPath {
        path: String,
        segment: String,
    },

    #[error("Invalid period '{period}': {reason}")]
    InvalidPeriod {
        period: String,
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors that occur while serving a request.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Country {country} not found")]
    CountryNotFound {
        country: CountryId,
    },

    #[error("Policy {id} not found in {country}")]
    PolicyNotFound {
        country: CountryId,
        id: PolicyId,
    },

    #[error("Household {id} not found in {country}")]
    HouseholdNotFound {
        country: CountryId,
        id: HouseholdId,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Worker queue '{pool}' is full (capacity {capacity})")]
    QueueFull {
        pool: String,
        capacity: usize,
    },

    #[error("Worker pool '{pool}' is disconnected")]
    Disconnected {
        pool: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// A failure of the simulation engine or comparator.
///
/// These are never returned to callers as errors: the dispatcher and
/// resolver turn them into terminal `error` records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputationFailure {
    #[error("simulation failed: {0}")]
    Simulation(String),

    #[error("invalid numeric result: {0}")]
    InvalidNumeric(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("comparison failed: {0}")]
    Comparison(String),

    #[error("computation panicked: {0}")]
    Panicked(String),

    #[error("baseline or reform economy computation failed")]
    Dependency,
}

/// Top-level error type for impactcache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl From<StorageError> for CacheError {
    fn from(err: StorageError) -> Self {
        Self::Execution(ExecutionError::Storage {
            message: err.to_string(),
        })
    }
}

impl CacheError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if a country, policy or household id did not resolve.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Execution(
                ExecutionError::CountryNotFound { .. }
                    | ExecutionError::PolicyNotFound { .. }
                    | ExecutionError::HouseholdNotFound { .. }
            )
        )
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::QueueFull { .. }
            ),
        }
    }
}

/// Result type alias for impactcache operations.
pub type CacheResult<T> = Result<T, CacheError>;
