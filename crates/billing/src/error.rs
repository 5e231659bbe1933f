//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Unknown price reference: {0}")]
    UnknownPrice(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    MalformedEvent(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Identity provider error: {0}")]
    IdentityProvider(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Generation quota exhausted ({used}/{limit})")]
    QuotaExceeded { used: i32, limit: i32 },

    #[error("Referral code is required")]
    MissingReferralCode,

    #[error("Referral code not found: {0}")]
    ReferralCodeNotFound(String),

    #[error("You cannot claim your own referral code")]
    SelfReferral,

    #[error("Unable to allocate a referral code for user {0}")]
    ReferralCodeExhausted(String),
}

impl BillingError {
    /// Failures worth retrying: upstream and storage errors, not bad input
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::StripeApi(_) | BillingError::Database(_) | BillingError::IdentityProvider(_)
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
