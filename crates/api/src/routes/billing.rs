//! Billing routes for Stripe integration

use axum::{
    extract::{Extension, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use retouch_billing::{
    BillingError, CheckoutResponse, EventOutcome, PortalResponse, UpgradeOutcome,
};
use retouch_shared::{SubscriptionRecord, SubscriptionStatus};
use serde::{Deserialize, Serialize};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Subscription info response
#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub status: SubscriptionStatus,
    pub plan: String,
    pub price_reference: Option<String>,
    pub quota_limit: i32,
    pub quota_used: i32,
    pub remaining: i32,
    pub current_period_start: Option<String>,
    pub current_period_end: Option<String>,
    pub has_billing_account: bool,
}

impl SubscriptionInfo {
    fn from_record(record: &SubscriptionRecord, plan: &str) -> Self {
        let rfc3339 = |t: Option<time::OffsetDateTime>| {
            t.and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok())
        };

        Self {
            status: record.status,
            plan: plan.to_string(),
            price_reference: record.price_reference.clone(),
            quota_limit: record.quota_limit,
            quota_used: record.quota_used,
            remaining: record.remaining_quota(),
            current_period_start: rfc3339(record.current_period_start),
            current_period_end: rfc3339(record.current_period_end),
            has_billing_account: record.billing_customer_id.is_some(),
        }
    }
}

fn subscription_info(state: &AppState, record: &SubscriptionRecord) -> SubscriptionInfo {
    let plan = state
        .reconciler
        .plans()
        .plan_label(record.price_reference.as_deref());
    SubscriptionInfo::from_record(record, plan)
}

/// Get the caller's subscription mirror. A baseline row is reported, not created.
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let record = match state.reconciler.find(auth_user.user_id).await? {
        Some(record) => record,
        None => SubscriptionRecord::baseline(
            auth_user.user_id,
            state.reconciler.resolve_quota_limit(None),
        ),
    };

    Ok(Json(subscription_info(&state, &record)))
}

/// Create the caller's free-tier row if they have none
pub async fn ensure_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let record = state
        .reconciler
        .ensure_subscription_row(auth_user.user_id, None)
        .await?;

    Ok(Json(subscription_info(&state, &record)))
}

/// Request to create a checkout session
#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub price_id: String,
}

/// Create a checkout session for a subscription
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateCheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let price_id = req.price_id.trim();
    if price_id.is_empty() {
        return Err(ApiError::Validation("price_id is required".to_string()));
    }

    let response = billing
        .checkout
        .create_subscription_checkout(auth_user.user_id, auth_user.email.as_deref(), price_id)
        .await?;

    Ok(Json(response))
}

/// Request to finalize a completed checkout session
#[derive(Debug, Deserialize)]
pub struct FinalizeCheckoutRequest {
    pub session_id: String,
}

/// Mirror a completed checkout right after the redirect back from Stripe
pub async fn finalize_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<FinalizeCheckoutRequest>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let record = billing
        .checkout
        .finalize_checkout_session(auth_user.user_id, &req.session_id)
        .await?;

    Ok(Json(subscription_info(&state, &record)))
}

/// Create a billing portal session
pub async fn create_portal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<PortalResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let response = billing.portal.open_for_user(auth_user.user_id).await?;

    Ok(Json(response))
}

/// Move the caller's subscription to the Pro price
pub async fn upgrade_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<UpgradeOutcome>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let outcome = billing.upgrades.upgrade_to_pro(auth_user.user_id).await?;

    Ok(Json(outcome))
}

/// Handle Stripe webhooks.
///
/// Dropped and ignored events are acknowledged so Stripe stops retrying them;
/// persistence failures return 500 so it retries.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let webhooks = state.webhooks.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Stripe webhook rejected");
        ApiError::from(e)
    })?;

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    let event_id = event.id.clone();
    match webhooks.handle_event(event).await {
        Ok(EventOutcome::Dropped { reason }) => {
            tracing::warn!(event_id = %event_id, reason = reason, "Stripe webhook dropped");
            Ok(StatusCode::OK)
        }
        Ok(_) => Ok(StatusCode::OK),
        Err(BillingError::MalformedEvent(msg)) => {
            tracing::warn!(event_id = %event_id, error = %msg, "Malformed Stripe webhook payload");
            Err(ApiError::BadRequest(msg))
        }
        Err(e) => {
            tracing::error!(event_id = %event_id, error = %e, "Webhook handling error");
            Err(ApiError::Database(format!("Webhook handling error: {}", e)))
        }
    }
}
