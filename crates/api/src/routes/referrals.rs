//! Referral routes

use axum::{
    extract::{Extension, State},
    Json,
};
use retouch_billing::{ClaimOutcome, ReferralSummary};
use serde::Deserialize;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Get (allocating on first use) the caller's referral code
pub async fn get_code(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<ReferralSummary>, ApiError> {
    let summary = state.referrals.referral_summary(auth_user.user_id).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct ClaimReferralRequest {
    #[serde(default)]
    pub code: String,
}

/// Claim someone else's referral code
pub async fn claim(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ClaimReferralRequest>,
) -> Result<Json<ClaimOutcome>, ApiError> {
    let outcome = state.referrals.claim(auth_user.user_id, &req.code).await?;
    Ok(Json(outcome))
}
