//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature is invalid")]
    InvalidSignature,

    #[error("Malformed webhook event: {0}")]
    MalformedEvent(String),

    #[error("Insufficient credits: requested {requested}, available {available}")]
    InsufficientCredits { requested: i64, available: i64 },

    #[error("Concurrent update conflict on balance row")]
    ConcurrentUpdateConflict,

    #[error("Ledger temporarily unavailable, try again")]
    TemporarilyUnavailable,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Credit account not found for user {0}")]
    AccountNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether retrying the same call later can succeed without any change
    /// on the caller's side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::ConcurrentUpdateConflict
                | BillingError::TemporarilyUnavailable
                | BillingError::StoreUnavailable(_)
        )
    }

    /// Stable machine-readable code for API responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::InvalidSignature => "invalid_signature",
            BillingError::MalformedEvent(_) => "malformed_event",
            BillingError::InsufficientCredits { .. } => "insufficient_credits",
            BillingError::ConcurrentUpdateConflict => "concurrent_update_conflict",
            BillingError::TemporarilyUnavailable => "temporarily_unavailable",
            BillingError::StoreUnavailable(_) => "store_unavailable",
            BillingError::Database(_) => "database_error",
            BillingError::AccountNotFound(_) => "account_not_found",
            BillingError::NotFound(_) => "not_found",
            BillingError::InvalidInput(_) => "invalid_input",
            BillingError::StripeApi(_) => "stripe_error",
            BillingError::Config(_) => "config_error",
            BillingError::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                BillingError::StoreUnavailable(err.to_string())
            }
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::MalformedEvent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BillingError::ConcurrentUpdateConflict.is_retryable());
        assert!(BillingError::TemporarilyUnavailable.is_retryable());
        assert!(BillingError::StoreUnavailable("timeout".into()).is_retryable());
        assert!(!BillingError::InvalidSignature.is_retryable());
        assert!(!BillingError::InsufficientCredits {
            requested: 5,
            available: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_pool_timeout_maps_to_store_unavailable() {
        let err: BillingError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, BillingError::StoreUnavailable(_)));
        assert_eq!(err.code(), "store_unavailable");
    }
}
