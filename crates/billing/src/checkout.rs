//! Stripe Checkout sessions

use std::collections::HashMap;
use std::sync::Arc;

use retouch_shared::{SubscriptionRecord, UserId};
use serde::Serialize;
use stripe::{
    CheckoutSession, CheckoutSessionId, CheckoutSessionMode, CreateCheckoutSession,
    CreateCheckoutSessionDiscounts, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, CustomerId, Subscription, SubscriptionId,
};

use crate::client::StripeClient;
use crate::customer::{user_id_from_metadata, CustomerService};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, BillingEventProcessor, EventOutcome, SubscriptionEventKind, SubscriptionPayload};
use crate::identity::IdentityProvider;

/// Response for creating a checkout session
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

/// Decide whether a completed checkout session belongs to `user_id`.
///
/// The owner stamped on the session (metadata or `client_reference_id`) must be
/// the caller, and a session customer must match the customer already linked to
/// the caller's row. A session with neither an owner nor a matching customer is
/// rejected.
fn verify_session_owner(
    user_id: UserId,
    stamped_owner: Option<UserId>,
    session_customer: Option<&str>,
    linked_customer: Option<&str>,
) -> BillingResult<()> {
    let foreign = || BillingError::InvalidInput("This session does not belong to your account".to_string());

    if stamped_owner.is_some_and(|owner| owner != user_id) {
        return Err(foreign());
    }

    let customer_matches = match (session_customer, linked_customer) {
        (Some(session), Some(linked)) if session != linked => return Err(foreign()),
        (Some(_), Some(_)) => true,
        _ => false,
    };

    if stamped_owner.is_none() && !customer_matches {
        return Err(foreign());
    }
    Ok(())
}

/// Checkout service for creating Stripe checkout sessions
#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    customers: CustomerService,
    identity: Arc<dyn IdentityProvider>,
    processor: BillingEventProcessor,
}

impl CheckoutService {
    pub fn new(
        stripe: StripeClient,
        customers: CustomerService,
        identity: Arc<dyn IdentityProvider>,
        processor: BillingEventProcessor,
    ) -> Self {
        Self {
            stripe,
            customers,
            identity,
            processor,
        }
    }

    /// The referral coupon to apply, if the user holds one they have not redeemed
    async fn pending_referral_coupon(&self, user_id: UserId) -> Option<String> {
        match self.identity.get_user(user_id).await {
            Ok(profile) if profile.metadata.referral_coupon_redeemed != Some(true) => {
                profile.metadata.referral_coupon_id
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Unable to check referral coupon");
                None
            }
        }
    }

    /// Create a checkout session for a new subscription
    pub async fn create_subscription_checkout(
        &self,
        user_id: UserId,
        email: Option<&str>,
        price_id: &str,
    ) -> BillingResult<CheckoutResponse> {
        let price_id = price_id.trim();
        if !self.processor.reconciler().plans().is_known_price(price_id) {
            return Err(BillingError::UnknownPrice(price_id.to_string()));
        }

        let customer_id = self.customers.get_or_create_customer(user_id, email).await?;
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let base_url = self.stripe.config().app_base_url.trim_end_matches('/');
        let success_url = format!("{}/dashboard", base_url);
        let cancel_url = format!("{}/pricing", base_url);
        let user_ref = user_id.to_string();

        let mut metadata = HashMap::new();
        metadata.insert("supabase_user_id".to_string(), user_ref.clone());

        let coupon = self.pending_referral_coupon(user_id).await;

        let mut params = CreateCheckoutSession {
            customer: Some(customer_id),
            client_reference_id: Some(&user_ref),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(price_id.to_string()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata.clone()),
            subscription_data: Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(metadata),
                ..Default::default()
            }),
            billing_address_collection: Some(stripe::CheckoutSessionBillingAddressCollection::Auto),
            ..Default::default()
        };

        // Stripe rejects promotion codes alongside an explicit discount
        match &coupon {
            Some(coupon_id) => {
                params.discounts = Some(vec![CreateCheckoutSessionDiscounts {
                    coupon: Some(coupon_id.clone()),
                    ..Default::default()
                }]);
            }
            None => params.allow_promotion_codes = Some(true),
        }

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;
        let url = session
            .url
            .ok_or_else(|| BillingError::StripeApi("Stripe did not return a redirect URL".to_string()))?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            price_id = %price_id,
            referral_coupon = coupon.is_some(),
            "Created checkout session"
        );

        Ok(CheckoutResponse {
            session_id: session.id.to_string(),
            url,
        })
    }

    /// Mirror a completed checkout immediately after the redirect, without
    /// waiting for the webhook. Goes through the same path as subscription events.
    pub async fn finalize_checkout_session(
        &self,
        user_id: UserId,
        session_id: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let session_id = session_id
            .trim()
            .parse::<CheckoutSessionId>()
            .map_err(|_| BillingError::InvalidInput("A valid session identifier is required".to_string()))?;

        let session = CheckoutSession::retrieve(self.stripe.inner(), &session_id, &[]).await?;

        let stamped_owner = session.metadata.as_ref().and_then(user_id_from_metadata).or_else(|| {
            session
                .client_reference_id
                .as_deref()
                .and_then(|r| r.parse::<UserId>().ok())
        });
        let session_customer = session.customer.as_ref().map(|c| c.id().to_string());
        let linked_customer = self
            .processor
            .reconciler()
            .find(user_id)
            .await?
            .and_then(|row| row.billing_customer_id);

        if let Err(e) = verify_session_owner(
            user_id,
            stamped_owner,
            session_customer.as_deref(),
            linked_customer.as_deref(),
        ) {
            tracing::warn!(
                user_id = %user_id,
                session_id = %session_id,
                "Checkout session belongs to another user"
            );
            return Err(e);
        }

        let subscription_id = session
            .subscription
            .as_ref()
            .map(|s| s.id().to_string())
            .ok_or_else(|| {
                BillingError::InvalidInput("Unable to resolve subscription from checkout session".to_string())
            })?;
        let subscription_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let subscription = Subscription::retrieve(self.stripe.inner(), &subscription_id, &[]).await?;
        let mut payload = SubscriptionPayload::from_stripe(&subscription)?;
        if payload.price_reference().is_none() {
            return Err(BillingError::InvalidInput(
                "Subscription is missing price information".to_string(),
            ));
        }
        payload
            .metadata
            .insert("supabase_user_id".to_string(), user_id.to_string());

        let outcome = self
            .processor
            .apply_billing_event(BillingEvent::SubscriptionUpserted {
                kind: SubscriptionEventKind::Reconciled,
                subscription: payload,
            })
            .await?;

        if let EventOutcome::Dropped { reason } = outcome {
            return Err(BillingError::InvalidInput(format!(
                "Unable to finalize checkout: {}",
                reason
            )));
        }

        self.processor
            .reconciler()
            .find(user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamped_owner_must_be_caller() {
        let user = UserId::new();
        assert!(verify_session_owner(user, Some(user), Some("cus_1"), None).is_ok());
        assert!(verify_session_owner(user, Some(user), Some("cus_1"), Some("cus_1")).is_ok());
        assert!(matches!(
            verify_session_owner(user, Some(UserId::new()), Some("cus_1"), Some("cus_1")),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_session_customer_must_match_linked_customer() {
        let user = UserId::new();
        assert!(matches!(
            verify_session_owner(user, Some(user), Some("cus_other"), Some("cus_1")),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_unowned_session_is_rejected() {
        let user = UserId::new();
        assert!(verify_session_owner(user, None, Some("cus_1"), Some("cus_1")).is_ok());
        assert!(matches!(
            verify_session_owner(user, None, Some("cus_1"), None),
            Err(BillingError::InvalidInput(_))
        ));
        assert!(matches!(
            verify_session_owner(user, None, None, Some("cus_1")),
            Err(BillingError::InvalidInput(_))
        ));
    }
}
