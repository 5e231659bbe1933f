//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use retouch_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("{0}")]
    NotFound(String),

    // Billing errors
    #[error("Generation quota exhausted")]
    QuotaExceeded { used: i32, limit: i32 },
    #[error("Insufficient credits")]
    InsufficientCredits,

    // Upstream errors
    #[error("Upstream service error: {0}")]
    Upstream(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),

            // Billing
            ApiError::QuotaExceeded { used, limit } => {
                let body = Json(json!({
                    "error": {
                        "code": "QUOTA_EXCEEDED",
                        "message": "Your generation quota is used up. Upgrade your plan to continue.",
                        "quota_used": used,
                        "quota_limit": limit,
                    }
                }));
                return (StatusCode::PAYMENT_REQUIRED, body).into_response();
            }
            ApiError::InsufficientCredits => {
                (StatusCode::CONFLICT, "INSUFFICIENT_CREDITS", "Insufficient credit balance".to_string())
            }

            // Upstream
            ApiError::Upstream(_) => (
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_ERROR",
                "The generation service failed. Please try again.".to_string(),
            ),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        ApiError::Database(err.to_string())
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::QuotaExceeded { used, limit } => ApiError::QuotaExceeded { used, limit },
            BillingError::InvalidAmount(msg) | BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::UnknownPrice(price) => {
                ApiError::Validation(format!("Unknown price reference: {}", price))
            }
            BillingError::MissingReferralCode | BillingError::SelfReferral => ApiError::Validation(err.to_string()),
            BillingError::ReferralCodeNotFound(_) => ApiError::NotFound("Referral code not found".to_string()),
            BillingError::UserNotFound(_) => ApiError::NotFound("User not found".to_string()),
            BillingError::CustomerNotFound(_) | BillingError::SubscriptionNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            BillingError::WebhookSignatureInvalid => ApiError::BadRequest("Invalid webhook signature".to_string()),
            BillingError::MalformedEvent(msg) => ApiError::BadRequest(msg),
            BillingError::Database(msg) => {
                tracing::error!(error = %msg, "Billing database error");
                ApiError::Database(msg)
            }
            other => {
                tracing::error!(error = %other, "Billing operation failed");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
