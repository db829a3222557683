//! Operator routes
//!
//! Protected by the admin token. Used to inspect and repair webhook
//! processing and to run ledger invariant checks on demand.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use creditline_billing::{
    InvariantCheckSummary, ProcessedWebhookEvent, UserId, WebhookReplayResult,
};
use serde::{Deserialize, Serialize};

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PruneResponse {
    pub removed: u64,
}

pub async fn list_webhook_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<Vec<ProcessedWebhookEvent>>> {
    let events = state
        .billing
        .webhooks
        .list_processed(query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(events))
}

pub async fn replay_webhook_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    tracing::info!(event_id = %event_id, "Admin webhook replay requested");
    let result = state.billing.webhooks.replay_event(&event_id).await?;
    Ok(Json(result))
}

pub async fn prune_webhook_events(State(state): State<AppState>) -> ApiResult<Json<PruneResponse>> {
    let removed = state.billing.webhooks.prune_processed().await?;
    Ok(Json(PruneResponse { removed }))
}

pub async fn run_all_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.billing.invariants.run_all_checks().await?;
    Ok(Json(summary))
}

pub async fn check_user_invariants(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state
        .billing
        .invariants
        .check_user(&UserId::new(user_id))
        .await?;
    Ok(Json(summary))
}
