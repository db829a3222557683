//! Credit routes for the authenticated user

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use creditline_billing::{BucketDraw, CreditSummary, CreditTransaction, EffectiveBalance, Mutation};
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;
const MAX_REASON_LEN: usize = 64;

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub created: bool,
    pub balance: EffectiveBalance,
}

#[derive(Debug, Deserialize)]
pub struct DebitRequest {
    pub amount: i64,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DebitResponse {
    pub ok: bool,
    pub remaining_balance: i64,
    pub drawn: Vec<BucketDraw>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// Open the caller's credit account with the signup allotment
pub async fn open_account(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<AccountResponse>> {
    let ledger = &state.billing.ledger;

    let response = match ledger.open_account(&auth_user.user_id).await? {
        Mutation::Applied(balance) => AccountResponse {
            created: true,
            balance,
        },
        Mutation::Unchanged(balance) => AccountResponse {
            created: false,
            balance,
        },
        Mutation::AlreadyApplied => AccountResponse {
            created: false,
            balance: ledger.effective_balance(&auth_user.user_id).await?,
        },
    };

    Ok(Json(response))
}

pub async fn debit(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<DebitRequest>,
) -> ApiResult<Json<DebitResponse>> {
    if req.amount <= 0 {
        return Err(ApiError::Validation("amount must be positive".to_string()));
    }

    let reason = req.reason.unwrap_or_else(|| "usage".to_string());
    if reason.is_empty() || reason.len() > MAX_REASON_LEN {
        return Err(ApiError::Validation(format!(
            "reason must be 1 to {} characters",
            MAX_REASON_LEN
        )));
    }

    let receipt = state
        .billing
        .ledger
        .debit(&auth_user.user_id, req.amount, &reason)
        .await?;

    Ok(Json(DebitResponse {
        ok: true,
        remaining_balance: receipt.remaining_balance,
        drawn: receipt.drawn,
    }))
}

pub async fn summary(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CreditSummary>> {
    let summary = state
        .billing
        .ledger
        .get_user_credit_summary(&auth_user.user_id)
        .await?;
    Ok(Json(summary))
}

pub async fn history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<CreditTransaction>>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
        return Err(ApiError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_HISTORY_LIMIT
        )));
    }

    let rows = state
        .billing
        .ledger
        .usage_history(&auth_user.user_id, limit)
        .await?;
    Ok(Json(rows))
}
