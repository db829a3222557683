//! API server configuration

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooled) URL used for migrations, if different
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    /// HS256 secret for user bearer tokens
    pub jwt_secret: String,
    /// Shared secret for `/v1/admin` routes. Empty disables admin routes.
    pub admin_token: String,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;

        let admin_token = std::env::var("ADMIN_TOKEN").unwrap_or_default();
        if admin_token.is_empty() {
            tracing::warn!("ADMIN_TOKEN not set - admin routes will reject every request");
        }

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL").ok(),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            jwt_secret,
            admin_token,
            allowed_origins,
            run_migrations: std::env::var("RUN_MIGRATIONS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        })
    }
}
