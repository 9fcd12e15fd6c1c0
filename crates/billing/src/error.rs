//! Billing error types
//!
//! Expected conditions (not found, invalid state) are typed variants that
//! callers pattern-match; database and external-service failures are genuine
//! faults. Unique-constraint conflicts on the idempotent insert paths are
//! resolved to success-with-existing-record by the callers and never surface
//! as errors there.

use thiserror::Error;

/// Result alias for billing operations
pub type BillingResult<T> = Result<T, BillingError>;

/// Billing error taxonomy
#[derive(Debug, Clone, Error)]
pub enum BillingError {
    /// Missing box, subscription, plan, or pending request.
    /// Retrying will not help.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation attempted against a record not in the required state,
    /// e.g. approving an already-approved plan change.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Payment gateway or notification call failed. A retry may succeed.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// Concurrent modification detected (optimistic lock failure)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database failure
    #[error("database error: {0}")]
    Database(String),

    /// Missing or invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Inbound event payload could not be interpreted
    #[error("invalid event payload: {0}")]
    InvalidEvent(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::ExternalService(e.to_string())
    }
}

/// Whether a sqlx error is a Postgres unique-constraint violation.
///
/// The dedup paths (event claims, grace periods, overage records) use
/// `INSERT ... ON CONFLICT`, so this is only needed where a plain insert
/// races a concurrent writer.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = BillingError::NotFound("box abc".to_string());
        assert_eq!(e.to_string(), "not found: box abc");

        let e = BillingError::InvalidState("request already approved".to_string());
        assert!(e.to_string().starts_with("invalid state:"));
    }
}
