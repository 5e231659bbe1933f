//! Subscription management

use retouch_shared::{SubscriptionPatch, SubscriptionRecord, SubscriptionStatus, UserId};
use serde::Serialize;
use stripe::{Subscription, SubscriptionId, UpdateSubscription, UpdateSubscriptionItems};
// Import the proration behavior enum from the subscription module (not subscription_item)
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;
use crate::reconciler::QuotaReconciler;

/// Result of an upgrade request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UpgradeOutcome {
    AlreadyOnPro,
    Upgraded { status: SubscriptionStatus, quota_limit: i32 },
}

/// What an upgrade has to do for a given local row
#[derive(Debug, Clone, PartialEq, Eq)]
enum UpgradeStep {
    Nothing,
    SwapPrice { subscription_id: String },
}

fn plan_upgrade(record: Option<&SubscriptionRecord>, pro_price: &str) -> BillingResult<UpgradeStep> {
    let Some(subscription_id) = record.and_then(|r| r.billing_subscription_id.clone()) else {
        return Err(BillingError::InvalidInput(
            "No active subscription found. Subscribe to a plan first".to_string(),
        ));
    };

    if record.and_then(|r| r.price_reference.as_deref()) == Some(pro_price) {
        return Ok(UpgradeStep::Nothing);
    }

    Ok(UpgradeStep::SwapPrice { subscription_id })
}

/// Plan changes on an existing Stripe subscription
#[derive(Clone)]
pub struct UpgradeService {
    stripe: StripeClient,
    reconciler: QuotaReconciler,
}

impl UpgradeService {
    pub fn new(stripe: StripeClient, reconciler: QuotaReconciler) -> Self {
        Self { stripe, reconciler }
    }

    /// Move the user's subscription to the Pro price, prorating the difference
    pub async fn upgrade_to_pro(&self, user_id: UserId) -> BillingResult<UpgradeOutcome> {
        let pro_price = self
            .reconciler
            .plans()
            .price_for(Plan::Pro)
            .map(str::to_string)
            .ok_or_else(|| BillingError::Config("Pro price is not configured".to_string()))?;

        let record = self.reconciler.find(user_id).await?;
        let subscription_id = match plan_upgrade(record.as_ref(), &pro_price)? {
            UpgradeStep::Nothing => return Ok(UpgradeOutcome::AlreadyOnPro),
            UpgradeStep::SwapPrice { subscription_id } => subscription_id,
        };

        let sub_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        // Get current subscription to get the item ID
        let current = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(pro_price.clone()),
                ..Default::default()
            }]),
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            ..Default::default()
        };

        let updated = Subscription::update(self.stripe.inner(), &sub_id, params).await?;

        let status = updated
            .status
            .as_str()
            .parse::<SubscriptionStatus>()
            .map_err(|e| BillingError::Internal(e.to_string()))?;
        let quota_limit = self.reconciler.resolve_quota_limit(Some(&pro_price));

        self.reconciler
            .upsert_subscription_for_user(
                user_id,
                SubscriptionPatch {
                    price_reference: Some(Some(pro_price)),
                    status: Some(status),
                    quota_limit: Some(quota_limit),
                    ..Default::default()
                },
                None,
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            status = %status,
            "Upgraded subscription to Pro"
        );

        Ok(UpgradeOutcome::Upgraded { status, quota_limit })
    }
}
