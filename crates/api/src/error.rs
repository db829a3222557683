//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use creditline_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient credits: requested {requested}, available {available}")]
    InsufficientCredits { requested: i64, available: i64 },

    #[error("Service temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Billing(BillingError),
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientCredits {
                requested,
                available,
            } => ApiError::InsufficientCredits {
                requested,
                available,
            },
            other => ApiError::Billing(other),
        }
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::InsufficientCredits { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "insufficient_credits")
            }
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "temporarily_unavailable"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            ApiError::Billing(err) => {
                let status = match err {
                    BillingError::InvalidSignature
                    | BillingError::MalformedEvent(_)
                    | BillingError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    BillingError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
                    BillingError::NotFound(_) | BillingError::AccountNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    BillingError::TemporarilyUnavailable
                    | BillingError::StoreUnavailable(_)
                    | BillingError::ConcurrentUpdateConflict => StatusCode::SERVICE_UNAVAILABLE,
                    BillingError::Database(_)
                    | BillingError::StripeApi(_)
                    | BillingError::Config(_)
                    | BillingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Internal details stay in the logs
        let message = if status.is_server_error() {
            tracing::error!(error = %self, code = code, "Request failed");
            match status {
                StatusCode::SERVICE_UNAVAILABLE => "Service temporarily unavailable, retry later".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };

        let mut body = json!({
            "error": message,
            "code": code,
        });
        if let ApiError::InsufficientCredits {
            requested,
            available,
        } = &self
        {
            body["requested"] = json!(requested);
            body["available"] = json!(available);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: BillingError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_billing_error_status_mapping() {
        assert_eq!(status_of(BillingError::InvalidSignature), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(BillingError::MalformedEvent("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::InsufficientCredits {
                requested: 5,
                available: 1
            }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_of(BillingError::AccountNotFound("u".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(BillingError::TemporarilyUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(BillingError::StoreUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(BillingError::Config("missing price".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
