//! Error types for the fee billing core
//!
//! The taxonomy mirrors how callers are expected to react:
//! - `Validation` / `NotFound` / `Business` are surfaced and never retried
//! - `Database` failures inside batch loops are caught per item
//! - `Transport` failures are retried by the event pipeline up to a bound

use thiserror::Error;

/// Errors produced by the billing core
#[derive(Debug, Error)]
pub enum BillingError {
    /// Bad input shape or range (overlapping configs, invalid percentage,
    /// missing calculation params). Surfaced to the caller, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A referenced customer/config/fee-type is missing or inactive
    #[error("Not found: {0}")]
    NotFound(String),

    /// A business rule was violated (wrong job state, unknown calculation type)
    #[error("Business rule violation [{code}]: {message}")]
    Business { code: String, message: String },

    /// Optimistic-concurrency conflict: the row changed since it was read
    #[error("Stale version for {entity} with id {id}")]
    StaleVersion { entity: &'static str, id: i64 },

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Event payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Event transport publish/subscribe failure
    #[error("Transport error: {0}")]
    Transport(String),
}

impl BillingError {
    /// Business error with a machine-readable code
    pub fn business(code: &str, message: impl Into<String>) -> Self {
        Self::Business {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// The error code used for attempt logging and operator triage
    pub fn code(&self) -> &str {
        match self {
            BillingError::Validation(_) => "VALIDATION_ERROR",
            BillingError::NotFound(_) => "ENTITY_NOT_FOUND",
            BillingError::Business { code, .. } => code,
            BillingError::StaleVersion { .. } => "STALE_VERSION",
            BillingError::Database(_) => "DATABASE_ERROR",
            BillingError::Serialization(_) => "SERIALIZATION_ERROR",
            BillingError::Transport(_) => "TRANSPORT_ERROR",
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
