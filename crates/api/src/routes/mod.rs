//! HTTP routes

pub mod admin;
pub mod credits;
pub mod webhooks;


use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_admin, require_auth},
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let user_routes = Router::new()
        .route("/v1/credits/account", post(credits::open_account))
        .route("/v1/credits/debit", post(credits::debit))
        .route("/v1/credits/summary", get(credits::summary))
        .route("/v1/credits/history", get(credits::history))
        .route_layer(from_fn_with_state(auth_state.clone(), require_auth));

    let admin_routes = Router::new()
        .route("/v1/admin/webhooks", get(admin::list_webhook_events))
        .route(
            "/v1/admin/webhooks/{event_id}/replay",
            post(admin::replay_webhook_event),
        )
        .route("/v1/admin/webhooks/prune", post(admin::prune_webhook_events))
        .route("/v1/admin/invariants", get(admin::run_all_invariants))
        .route("/v1/admin/invariants/{user_id}", get(admin::check_user_invariants))
        .route_layer(from_fn_with_state(auth_state, require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(user_routes)
        .merge(admin_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
