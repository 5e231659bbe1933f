//! Stripe client configuration

use stripe::Client;

use crate::error::{BillingError, BillingResult};

const DEFAULT_BASIC_PRICE_ID: &str = "price_1SIqRxLm8HeEccYQxPFjeTlh";
const DEFAULT_PRO_PRICE_ID: &str = "price_1SIqa1Lm8HeEccYQoSkKzdMk";

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each paid plan
    pub price_ids: PriceIds,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
    /// Coupon granted once to users who claimed a referral code
    pub referral_coupon_id: Option<String>,
}

/// Stripe price IDs for the paid plans (Free has no price)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceIds {
    pub basic: String,
    pub pro: String,
}

impl Default for PriceIds {
    fn default() -> Self {
        Self {
            basic: DEFAULT_BASIC_PRICE_ID.to_string(),
            pro: DEFAULT_PRO_PRICE_ID.to_string(),
        }
    }
}

impl PriceIds {
    /// Read price IDs from the environment, falling back to the live catalog
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            basic: non_empty_env("STRIPE_PRICE_BASIC").unwrap_or(defaults.basic),
            pro: non_empty_env("STRIPE_PRICE_PRO").unwrap_or(defaults.pro),
        }
    }
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: non_empty_env("STRIPE_SECRET_KEY")
                .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: non_empty_env("STRIPE_WEBHOOK_SECRET")
                .ok_or_else(|| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds::from_env(),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            referral_coupon_id: non_empty_env("STRIPE_REFERRAL_COUPON_ID"),
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
