//! Credit balance routes

use axum::{
    extract::{Extension, State},
    Json,
};
use retouch_billing::{exact_credits, whole_credits};
use retouch_shared::UserId;
use serde::{Deserialize, Serialize};

use crate::{
    auth::{is_admin_user, AuthUser},
    error::ApiError,
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub user_id: UserId,
    pub balance: i64,
}

/// Get the caller's credit balance
pub async fn get_balance(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state.ledger.get_balance(auth_user.user_id).await?;

    Ok(Json(BalanceResponse {
        user_id: auth_user.user_id,
        balance,
    }))
}

/// Request to grant credits to a user
#[derive(Debug, Deserialize)]
pub struct GrantCreditsRequest {
    pub user_id: UserId,
    pub amount: f64,
}

/// Grant credits to any user. Operators only.
pub async fn grant_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<GrantCreditsRequest>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let caller = state.identity.get_user(auth_user.user_id).await?;
    if !is_admin_user(&caller, &state.config.admin_emails) {
        tracing::warn!(
            user_id = %auth_user.user_id,
            target_user_id = %req.user_id,
            "Non-admin attempted to grant credits"
        );
        return Err(ApiError::Forbidden);
    }

    let amount = whole_credits(req.amount)?;
    let balance = state.ledger.add_credits(req.user_id, amount).await?;

    tracing::info!(
        admin_id = %auth_user.user_id,
        target_user_id = %req.user_id,
        amount = amount,
        balance = balance,
        "Admin granted credits"
    );

    Ok(Json(BalanceResponse {
        user_id: req.user_id,
        balance,
    }))
}

/// Request to spend credits
#[derive(Debug, Deserialize)]
pub struct ConsumeCreditsRequest {
    pub amount: f64,
}

/// Spend credits from the caller's balance
pub async fn consume_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ConsumeCreditsRequest>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let amount = exact_credits(req.amount)?;

    if !state.ledger.consume_credits(auth_user.user_id, amount).await? {
        return Err(ApiError::InsufficientCredits);
    }

    let balance = state.ledger.get_balance(auth_user.user_id).await?;

    Ok(Json(BalanceResponse {
        user_id: auth_user.user_id,
        balance,
    }))
}
