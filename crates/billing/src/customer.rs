//! Stripe customer management

use std::collections::HashMap;

use async_trait::async_trait;
use retouch_shared::{SubscriptionPatch, UserId};
use stripe::{CreateCustomer, Customer, CustomerId};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::reconciler::QuotaReconciler;

/// Metadata keys that may carry our user id, in lookup order
pub const USER_ID_METADATA_KEYS: [&str; 2] = ["supabase_user_id", "user_id"];

/// Extract a user id from a provider metadata map
pub fn user_id_from_metadata(metadata: &HashMap<String, String>) -> Option<UserId> {
    USER_ID_METADATA_KEYS
        .iter()
        .filter_map(|key| metadata.get(*key))
        .find_map(|value| value.parse::<UserId>().ok())
}

/// Live lookup of the user that owns a billing customer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn user_id_for_customer(&self, customer_id: &str) -> BillingResult<Option<UserId>>;
}

/// [`CustomerDirectory`] backed by Stripe customer metadata
#[derive(Clone)]
pub struct StripeCustomerDirectory {
    stripe: StripeClient,
}

impl StripeCustomerDirectory {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

#[async_trait]
impl CustomerDirectory for StripeCustomerDirectory {
    async fn user_id_for_customer(&self, customer_id: &str) -> BillingResult<Option<UserId>> {
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let customer = Customer::retrieve(self.stripe.inner(), &customer_id, &[]).await?;
        if customer.deleted {
            return Ok(None);
        }

        Ok(customer.metadata.as_ref().and_then(user_id_from_metadata))
    }
}

/// Customer service for managing Stripe customers
#[derive(Clone)]
pub struct CustomerService {
    stripe: StripeClient,
    reconciler: QuotaReconciler,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, reconciler: QuotaReconciler) -> Self {
        Self { stripe, reconciler }
    }

    /// Return the user's Stripe customer id, creating the customer on first use
    pub async fn get_or_create_customer(
        &self,
        user_id: UserId,
        email: Option<&str>,
    ) -> BillingResult<String> {
        let row = self.reconciler.ensure_subscription_row(user_id, None).await?;

        if let Some(existing) = row.billing_customer_id {
            let customer_id = existing
                .parse::<CustomerId>()
                .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

            let customer = Customer::retrieve(self.stripe.inner(), &customer_id, &[]).await?;
            if !customer.deleted {
                return Ok(customer.id.to_string());
            }

            tracing::warn!(
                user_id = %user_id,
                customer_id = %existing,
                "Stored Stripe customer was deleted, creating a new one"
            );
        }

        self.create_customer(user_id, email).await
    }

    /// Create a new Stripe customer and link it to the user's subscription row
    pub async fn create_customer(&self, user_id: UserId, email: Option<&str>) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("supabase_user_id".to_string(), user_id.to_string());
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("platform".to_string(), "retouch".to_string());

        let params = CreateCustomer {
            email,
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;
        let customer_id = customer.id.to_string();

        self.reconciler
            .ensure_subscription_row(
                user_id,
                Some(SubscriptionPatch {
                    billing_customer_id: Some(Some(customer_id.clone())),
                    ..Default::default()
                }),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer_id,
            "Created Stripe customer"
        );

        Ok(customer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_from_metadata_prefers_supabase_key() {
        let primary = UserId::new();
        let secondary = UserId::new();
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), secondary.to_string());
        metadata.insert("supabase_user_id".to_string(), primary.to_string());

        assert_eq!(user_id_from_metadata(&metadata), Some(primary));
    }

    #[test]
    fn test_user_id_from_metadata_skips_garbage() {
        let user = UserId::new();
        let mut metadata = HashMap::new();
        metadata.insert("supabase_user_id".to_string(), "not-a-uuid".to_string());
        metadata.insert("user_id".to_string(), user.to_string());
        assert_eq!(user_id_from_metadata(&metadata), Some(user));

        assert_eq!(user_id_from_metadata(&HashMap::new()), None);
    }
}
