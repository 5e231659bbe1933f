//! Reconciliation sweep
//!
//! Webhooks can be lost or fail after Stripe gives up retrying. The sweep walks
//! every row linked to a Stripe subscription, re-reads the subscription from
//! Stripe, and re-applies it through the same path a
//! `customer.subscription.updated` event takes.
//!
//! Events whose user could never be resolved have no row to sweep and remain
//! unrecoverable.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use stripe::{StripeError, Subscription, SubscriptionId};

use crate::client::StripeClient;
use crate::error::BillingResult;
use crate::events::{BillingEvent, BillingEventProcessor, EventOutcome, SubscriptionEventKind, SubscriptionPayload};

/// Source of truth for subscription state
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// `Ok(None)` when the provider no longer knows the subscription
    async fn fetch_subscription(&self, subscription_id: &str) -> BillingResult<Option<SubscriptionPayload>>;
}

/// [`SubscriptionSource`] backed by the Stripe API
#[derive(Clone)]
pub struct StripeSubscriptionSource {
    stripe: StripeClient,
}

impl StripeSubscriptionSource {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

#[async_trait]
impl SubscriptionSource for StripeSubscriptionSource {
    async fn fetch_subscription(&self, subscription_id: &str) -> BillingResult<Option<SubscriptionPayload>> {
        let Ok(sub_id) = subscription_id.parse::<SubscriptionId>() else {
            tracing::warn!(subscription_id = %subscription_id, "Stored subscription id is not a Stripe id");
            return Ok(None);
        };

        match Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await {
            Ok(subscription) => SubscriptionPayload::from_stripe(&subscription).map(Some),
            Err(StripeError::Stripe(err)) if err.http_status == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Counters from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub applied: usize,
    /// Already in a terminal status locally
    pub skipped: usize,
    /// Unknown to the provider
    pub missing: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ReconciliationSweep {
    source: Arc<dyn SubscriptionSource>,
    processor: BillingEventProcessor,
}

impl ReconciliationSweep {
    pub fn new(source: Arc<dyn SubscriptionSource>, processor: BillingEventProcessor) -> Self {
        Self { source, processor }
    }

    /// Re-apply the provider's view of every linked subscription.
    ///
    /// A failure on one row is counted and logged; the sweep carries on with
    /// the rest. Only a failure to list rows aborts it.
    pub async fn run(&self) -> BillingResult<SweepReport> {
        let rows = self.processor.reconciler().store().list_linked().await?;
        let mut report = SweepReport::default();

        for row in rows {
            let Some(subscription_id) = row.billing_subscription_id.as_deref() else {
                continue;
            };
            report.checked += 1;

            // Stripe never leaves these states, so there is nothing to heal
            if row.status.forces_free_tier() {
                report.skipped += 1;
                continue;
            }

            let mut payload = match self.source.fetch_subscription(subscription_id).await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    tracing::warn!(
                        user_id = %row.user_id,
                        subscription_id = %subscription_id,
                        "Linked subscription no longer exists at Stripe"
                    );
                    report.missing += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        user_id = %row.user_id,
                        subscription_id = %subscription_id,
                        error = %e,
                        "Failed to fetch subscription during sweep"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            // The row already says who owns this subscription
            payload
                .metadata
                .insert("supabase_user_id".to_string(), row.user_id.to_string());

            match self
                .processor
                .apply_billing_event(BillingEvent::SubscriptionUpserted {
                    kind: SubscriptionEventKind::Reconciled,
                    subscription: payload,
                })
                .await
            {
                Ok(EventOutcome::Applied { .. }) => report.applied += 1,
                Ok(outcome) => {
                    tracing::warn!(
                        user_id = %row.user_id,
                        subscription_id = %subscription_id,
                        outcome = ?outcome,
                        "Sweep could not apply subscription"
                    );
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::error!(
                        user_id = %row.user_id,
                        subscription_id = %subscription_id,
                        error = %e,
                        "Failed to persist reconciled subscription"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            applied = report.applied,
            skipped = report.skipped,
            missing = report.missing,
            failed = report.failed,
            "Reconciliation sweep finished"
        );

        Ok(report)
    }
}
