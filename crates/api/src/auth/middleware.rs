//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use creditline_billing::UserId;
use serde_json::json;
use subtle::ConstantTimeEq;

use super::jwt::JwtManager;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Authenticated user extracted from a bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub admin_token: String,
}

fn extract_bearer_token(request: &Request) -> Result<Option<&str>, AuthError> {
    match request.headers().get(AUTHORIZATION) {
        None => Ok(None),
        Some(value) => {
            let header = value.to_str().map_err(|_| AuthError::InvalidAuthFormat)?;
            header
                .strip_prefix("Bearer ")
                .map(|token| Some(token.trim()))
                .ok_or(AuthError::InvalidAuthFormat)
        }
    }
}

/// Middleware that requires a valid bearer token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Ok(Some(token)) => auth_state
            .jwt_manager
            .verify(token)
            .map(|claims| AuthUser {
                user_id: UserId::new(claims.sub),
            }),
        Ok(None) => Err(AuthError::MissingAuth),
        Err(e) => Err(e),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(path = %path, user_id = %auth_user.user_id, "require_auth: authenticated");
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware for operator routes, checked against the configured admin token
pub async fn require_admin(
    State(auth_state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if auth_state.admin_token.is_empty() {
        tracing::warn!(path = %path, "require_admin: admin token not configured");
        return AuthError::AdminDisabled.into_response();
    }

    let presented = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok());

    let Some(presented) = presented else {
        return AuthError::MissingAuth.into_response();
    };

    if !bool::from(presented.as_bytes().ct_eq(auth_state.admin_token.as_bytes())) {
        tracing::warn!(path = %path, "require_admin: invalid admin token");
        return AuthError::InvalidAdminToken.into_response();
    }

    next.run(request).await
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Invalid admin token")]
    InvalidAdminToken,
    #[error("Admin access is not configured")]
    AdminDisabled,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidAuthFormat => {
                (StatusCode::UNAUTHORIZED, "Invalid authentication format")
            }
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::InvalidAdminToken => (StatusCode::FORBIDDEN, "Invalid admin token"),
            AuthError::AdminDisabled => (StatusCode::FORBIDDEN, "Admin access is disabled"),
            AuthError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
