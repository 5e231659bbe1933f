//! Stripe Billing Portal

use retouch_shared::UserId;
use stripe::{BillingPortalSession, CreateBillingPortalSession, CustomerId};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::reconciler::QuotaReconciler;

/// Where the portal sends the user back to
fn return_url(app_base_url: &str) -> String {
    format!("{}/dashboard", app_base_url.trim_end_matches('/'))
}

/// Self-service subscription management through the Stripe portal
#[derive(Clone)]
pub struct PortalService {
    stripe: StripeClient,
    reconciler: QuotaReconciler,
}

impl PortalService {
    pub fn new(stripe: StripeClient, reconciler: QuotaReconciler) -> Self {
        Self { stripe, reconciler }
    }

    /// Open the portal for the customer linked to `user_id`.
    /// A user who never went through checkout has nothing to manage.
    pub async fn open_for_user(&self, user_id: UserId) -> BillingResult<PortalResponse> {
        let customer_id = self
            .reconciler
            .find(user_id)
            .await?
            .and_then(|row| row.billing_customer_id)
            .ok_or_else(|| {
                BillingError::InvalidInput("No billing account found. Subscribe to a plan first.".to_string())
            })?;

        self.create_portal_session(user_id, &customer_id).await
    }

    /// Create a billing portal session for a customer
    pub async fn create_portal_session(
        &self,
        user_id: UserId,
        customer_id: &str,
    ) -> BillingResult<PortalResponse> {
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|_| BillingError::InvalidInput(format!("Invalid customer ID: {}", customer_id)))?;

        let return_url = return_url(&self.stripe.config().app_base_url);
        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(&return_url);

        let session = BillingPortalSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %session.customer,
            "Created billing portal session"
        );

        Ok(PortalResponse { url: session.url })
    }
}

/// Response for creating a portal session
#[derive(Debug, serde::Serialize)]
pub struct PortalResponse {
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_url_strips_trailing_slash() {
        assert_eq!(return_url("https://retouch.app/"), "https://retouch.app/dashboard");
        assert_eq!(return_url("http://localhost:3000"), "http://localhost:3000/dashboard");
    }
}
