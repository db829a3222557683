//! Authentication module for Creditline

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager};
pub use middleware::{require_admin, require_auth, AuthError, AuthState, AuthUser, ADMIN_TOKEN_HEADER};
