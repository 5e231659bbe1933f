//! Billing events
//!
//! Typed views over the Stripe objects we react to, and the processor that
//! folds them into the subscription mirror.
//!
//! Payloads are decoded with our own serde types rather than `stripe::Event`:
//! the pinned async-stripe version cannot deserialize events from newer Stripe
//! API versions, and we only need a handful of fields.
//!
//! ## Event handling
//!
//! - `checkout.session.completed`: placeholder `pending` row until the
//!   subscription event lands
//! - `customer.subscription.*`: mirror price, status, and period; reset usage on
//!   period rollover; terminal statuses fall back to the free tier
//! - `invoice.paid`: mark active; reset usage only when the invoice opens a new
//!   period. `invoice.payment_succeeded` fires for the same invoice and is ignored.
//! - `invoice.payment_failed`: notify only
//!
//! Stripe does not deliver events in order. Every handler trusts the status and
//! period carried by the payload itself instead of assuming monotonic arrival.

use std::collections::HashMap;
use std::sync::Arc;

use retouch_shared::{SubscriptionPatch, SubscriptionStatus, UserId};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::customer::{user_id_from_metadata, CustomerDirectory};
use crate::email::{Notification, Notifier};
use crate::error::{BillingError, BillingResult};
use crate::identity::{IdentityProvider, UserProfile};
use crate::plans::FREE_TIER_QUOTA;
use crate::reconciler::{epoch_to_datetime, should_reset_usage, QuotaReconciler};

// =============================================================================
// Payloads
// =============================================================================

fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// A reference Stripe may send either as a bare id or as an expanded object
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Id(String),
    Object { id: String },
}

impl ObjectRef {
    pub fn id(&self) -> &str {
        match self {
            ObjectRef::Id(id) => id,
            ObjectRef::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PricePayload {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionItemPayload {
    pub price: Option<PricePayload>,
    /// Newer API versions moved the period onto items
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Vec<SubscriptionItemPayload>,
}

/// The fields of a Stripe subscription we mirror
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    pub customer: Option<ObjectRef>,
    pub status: SubscriptionStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub items: SubscriptionItems,
}

impl SubscriptionPayload {
    /// Re-read an async-stripe subscription through our payload shape
    pub fn from_stripe(subscription: &stripe::Subscription) -> BillingResult<Self> {
        let value = serde_json::to_value(subscription)
            .map_err(|e| BillingError::MalformedEvent(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| BillingError::MalformedEvent(e.to_string()))
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(ObjectRef::id)
    }

    /// Price of the first line item; `None` means the free tier
    pub fn price_reference(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    pub fn period_start(&self) -> Option<i64> {
        self.current_period_start
            .or_else(|| self.items.data.first().and_then(|i| i.current_period_start))
    }

    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end
            .or_else(|| self.items.data.first().and_then(|i| i.current_period_end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSessionPayload {
    pub id: String,
    pub customer: Option<ObjectRef>,
    pub subscription: Option<ObjectRef>,
    pub client_reference_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionPayload {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(ObjectRef::id)
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(ObjectRef::id)
    }

    fn user_id(&self) -> Option<UserId> {
        user_id_from_metadata(&self.metadata).or_else(|| {
            self.client_reference_id
                .as_deref()
                .and_then(|id| id.parse::<UserId>().ok())
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PeriodPayload {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InvoiceLinePayload {
    pub price: Option<PricePayload>,
    pub period: Option<PeriodPayload>,
    pub subscription: Option<ObjectRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InvoiceLines {
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Vec<InvoiceLinePayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CouponPayload {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DiscountPayload {
    pub coupon: Option<CouponPayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionDetailsPayload {
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InvoicePayload {
    pub id: Option<String>,
    pub customer: Option<ObjectRef>,
    pub subscription: Option<ObjectRef>,
    pub customer_email: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    pub currency: Option<String>,
    pub hosted_invoice_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub lines: InvoiceLines,
    pub discount: Option<DiscountPayload>,
    pub subscription_details: Option<SubscriptionDetailsPayload>,
}

impl InvoicePayload {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(ObjectRef::id)
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription
            .as_ref()
            .or_else(|| self.lines.data.first().and_then(|l| l.subscription.as_ref()))
            .map(ObjectRef::id)
    }

    fn first_line(&self) -> Option<&InvoiceLinePayload> {
        self.lines.data.first()
    }

    pub fn price_reference(&self) -> Option<&str> {
        self.first_line()
            .and_then(|l| l.price.as_ref())
            .map(|p| p.id.as_str())
    }

    pub fn period_start(&self) -> Option<i64> {
        self.first_line().and_then(|l| l.period.as_ref()).and_then(|p| p.start)
    }

    pub fn period_end(&self) -> Option<i64> {
        self.first_line().and_then(|l| l.period.as_ref()).and_then(|p| p.end)
    }

    pub fn coupon_id(&self) -> Option<&str> {
        self.discount
            .as_ref()
            .and_then(|d| d.coupon.as_ref())
            .map(|c| c.id.as_str())
    }

    fn metadata(&self) -> Option<&HashMap<String, String>> {
        self.subscription_details.as_ref().map(|d| &d.metadata)
    }

    fn customer_email(&self) -> Option<&str> {
        self.customer_email.as_deref().filter(|e| !e.is_empty())
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEventKind {
    Created,
    Updated,
    Deleted,
    /// Re-applied by the reconciliation sweep, not delivered by Stripe
    Reconciled,
}

/// A billing event we act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    CheckoutCompleted(CheckoutSessionPayload),
    SubscriptionUpserted {
        kind: SubscriptionEventKind,
        subscription: SubscriptionPayload,
    },
    InvoicePaid(InvoicePayload),
    PaymentFailed(InvoicePayload),
}

fn decode<T: for<'de> Deserialize<'de>>(event_type: &str, object: Value) -> BillingResult<T> {
    serde_json::from_value(object)
        .map_err(|e| BillingError::MalformedEvent(format!("{}: {}", event_type, e)))
}

impl BillingEvent {
    /// Decode a Stripe event object. Unsupported event types yield `None`.
    pub fn parse(event_type: &str, object: Value) -> BillingResult<Option<Self>> {
        let subscription_kind = match event_type {
            "customer.subscription.created" => Some(SubscriptionEventKind::Created),
            "customer.subscription.updated" => Some(SubscriptionEventKind::Updated),
            "customer.subscription.deleted" => Some(SubscriptionEventKind::Deleted),
            _ => None,
        };

        if let Some(kind) = subscription_kind {
            return Ok(Some(BillingEvent::SubscriptionUpserted {
                kind,
                subscription: decode(event_type, object)?,
            }));
        }

        let event = match event_type {
            "checkout.session.completed" => BillingEvent::CheckoutCompleted(decode(event_type, object)?),
            "invoice.paid" => BillingEvent::InvoicePaid(decode(event_type, object)?),
            "invoice.payment_failed" => BillingEvent::PaymentFailed(decode(event_type, object)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// What applying an event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// The user's subscription row was written
    Applied { user_id: UserId },
    /// Only a notification was sent
    Notified,
    /// The event could not be attributed or lacked required fields
    Dropped { reason: &'static str },
    /// Not relevant to quota state
    Ignored,
}

// =============================================================================
// Processor
// =============================================================================

/// Applies [`BillingEvent`]s to the subscription mirror.
///
/// Errors on the primary write propagate so the webhook is retried. Notification
/// and coupon bookkeeping failures are logged and swallowed.
#[derive(Clone)]
pub struct BillingEventProcessor {
    reconciler: QuotaReconciler,
    customers: Arc<dyn CustomerDirectory>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
}

impl BillingEventProcessor {
    pub fn new(
        reconciler: QuotaReconciler,
        customers: Arc<dyn CustomerDirectory>,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            reconciler,
            customers,
            identity,
            notifier,
        }
    }

    pub fn reconciler(&self) -> &QuotaReconciler {
        &self.reconciler
    }

    pub async fn apply_billing_event(&self, event: BillingEvent) -> BillingResult<EventOutcome> {
        match event {
            BillingEvent::SubscriptionUpserted { kind, subscription } => {
                self.apply_subscription(kind, &subscription).await
            }
            BillingEvent::CheckoutCompleted(session) => self.apply_checkout(&session).await,
            BillingEvent::InvoicePaid(invoice) => self.apply_invoice_paid(&invoice).await,
            BillingEvent::PaymentFailed(invoice) => self.apply_payment_failed(&invoice).await,
        }
    }

    /// Resolve the owning user: event metadata, then our own row for the
    /// customer, then the customer's metadata at Stripe.
    async fn resolve_user(
        &self,
        metadata: Option<&HashMap<String, String>>,
        customer_id: Option<&str>,
    ) -> BillingResult<Option<UserId>> {
        if let Some(user_id) = metadata.and_then(user_id_from_metadata) {
            return Ok(Some(user_id));
        }

        let Some(customer_id) = customer_id else {
            return Ok(None);
        };

        if let Some(row) = self.reconciler.store().find_by_customer(customer_id).await? {
            return Ok(Some(row.user_id));
        }

        match self.customers.user_id_for_customer(customer_id).await {
            Ok(user_id) => Ok(user_id),
            Err(e) => {
                tracing::error!(
                    customer_id = %customer_id,
                    error = %e,
                    "Unable to retrieve customer metadata"
                );
                Ok(None)
            }
        }
    }

    async fn profile(&self, user_id: UserId) -> Option<UserProfile> {
        match self.identity.get_user(user_id).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Unable to load user profile");
                None
            }
        }
    }

    async fn notify(&self, notification: Notification) {
        let category = notification.category.as_str();
        if !self.notifier.send(notification).await {
            tracing::warn!(category = %category, "Billing notification was not delivered");
        }
    }

    async fn apply_subscription(
        &self,
        kind: SubscriptionEventKind,
        subscription: &SubscriptionPayload,
    ) -> BillingResult<EventOutcome> {
        let Some(customer_id) = subscription.customer_id() else {
            tracing::warn!(
                subscription_id = %subscription.id,
                "Subscription event missing customer identifier"
            );
            return Ok(EventOutcome::Dropped {
                reason: "missing customer",
            });
        };

        let Some(user_id) = self
            .resolve_user(Some(&subscription.metadata), Some(customer_id))
            .await?
        else {
            tracing::warn!(
                subscription_id = %subscription.id,
                customer_id = %customer_id,
                "Unable to resolve user for subscription event"
            );
            return Ok(EventOutcome::Dropped {
                reason: "unresolved user",
            });
        };

        let existing = self.reconciler.find(user_id).await?;
        let price_reference = subscription.price_reference().map(str::to_string);
        let period_start = subscription.period_start();

        let mut updates = SubscriptionPatch {
            billing_customer_id: Some(Some(customer_id.to_string())),
            billing_subscription_id: Some(Some(subscription.id.clone())),
            quota_limit: Some(self.reconciler.resolve_quota_limit(price_reference.as_deref())),
            price_reference: Some(price_reference),
            status: Some(subscription.status),
            current_period_start: Some(epoch_to_datetime(period_start)),
            current_period_end: Some(epoch_to_datetime(subscription.period_end())),
            quota_used: None,
        };

        let previous_start = existing.as_ref().and_then(|r| r.current_period_start);
        if should_reset_usage(previous_start, period_start.unwrap_or(0)) {
            updates.quota_used = Some(0);
        }

        if subscription.status.forces_free_tier() {
            updates.quota_limit = Some(FREE_TIER_QUOTA);
            updates.price_reference = Some(None);
            updates.quota_used = Some(0);
        }

        let record = self
            .reconciler
            .upsert_subscription_for_user(user_id, updates, None)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            kind = ?kind,
            status = %record.status,
            quota_limit = record.quota_limit,
            quota_used = record.quota_used,
            "Subscription mirrored"
        );

        let was_canceled = existing
            .as_ref()
            .is_some_and(|r| r.status == SubscriptionStatus::Canceled);
        if subscription.status == SubscriptionStatus::Canceled && !was_canceled {
            let plan = self
                .reconciler
                .plans()
                .plan_label(existing.as_ref().and_then(|r| r.price_reference.as_deref()));
            if let Some(email) = self.profile(user_id).await.and_then(|p| p.email) {
                self.notify(Notification::subscription_canceled(&email, plan)).await;
            }
        }

        Ok(EventOutcome::Applied { user_id })
    }

    async fn apply_checkout(&self, session: &CheckoutSessionPayload) -> BillingResult<EventOutcome> {
        let Some(customer_id) = session.customer_id() else {
            return Ok(EventOutcome::Dropped {
                reason: "missing customer",
            });
        };

        let user_id = match session.user_id() {
            Some(user_id) => Some(user_id),
            None => self.resolve_user(None, Some(customer_id)).await?,
        };
        let Some(user_id) = user_id else {
            tracing::warn!(
                session_id = %session.id,
                customer_id = %customer_id,
                "Unable to resolve user for checkout session"
            );
            return Ok(EventOutcome::Dropped {
                reason: "unresolved user",
            });
        };

        let mut patch = SubscriptionPatch {
            billing_customer_id: Some(Some(customer_id.to_string())),
            ..Default::default()
        };
        if let Some(subscription_id) = session.subscription_id() {
            patch.billing_subscription_id = Some(Some(subscription_id.to_string()));
        }

        // The subscription event may already have landed
        let already_paid = self
            .reconciler
            .find(user_id)
            .await?
            .is_some_and(|r| r.status.is_paid());
        if !already_paid {
            patch.status = Some(SubscriptionStatus::Pending);
        }

        self.reconciler.ensure_subscription_row(user_id, Some(patch)).await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            already_paid = already_paid,
            "Checkout completed"
        );

        Ok(EventOutcome::Applied { user_id })
    }

    async fn resolve_invoice_user(&self, invoice: &InvoicePayload) -> BillingResult<Option<UserId>> {
        if let Some(subscription_id) = invoice.subscription_id() {
            if let Some(row) = self
                .reconciler
                .store()
                .find_by_subscription(subscription_id)
                .await?
            {
                return Ok(Some(row.user_id));
            }
        }
        self.resolve_user(invoice.metadata(), invoice.customer_id()).await
    }

    async fn apply_invoice_paid(&self, invoice: &InvoicePayload) -> BillingResult<EventOutcome> {
        let (Some(subscription_id), Some(customer_id)) = (invoice.subscription_id(), invoice.customer_id())
        else {
            return Ok(EventOutcome::Ignored);
        };

        let Some(user_id) = self.resolve_invoice_user(invoice).await? else {
            tracing::warn!(
                subscription_id = %subscription_id,
                customer_id = %customer_id,
                "Unable to resolve user for paid invoice"
            );
            return Ok(EventOutcome::Dropped {
                reason: "unresolved user",
            });
        };

        let existing = self.reconciler.find(user_id).await?;
        let price_reference = invoice
            .price_reference()
            .map(str::to_string)
            .or_else(|| existing.as_ref().and_then(|r| r.price_reference.clone()));
        let quota_limit = self.reconciler.resolve_quota_limit(price_reference.as_deref());

        // Redeliveries and renewals already mirrored by a subscription event keep usage
        let rollover = invoice.period_start().is_some_and(|start| {
            should_reset_usage(existing.as_ref().and_then(|r| r.current_period_start), start)
        });

        let mut updates = SubscriptionPatch {
            billing_customer_id: Some(Some(customer_id.to_string())),
            billing_subscription_id: Some(Some(subscription_id.to_string())),
            status: Some(SubscriptionStatus::Active),
            quota_limit: Some(quota_limit),
            ..Default::default()
        };
        if rollover {
            updates.quota_used = Some(0);
        }
        if price_reference.is_some() {
            updates.price_reference = Some(price_reference.clone());
        }
        if let Some(start) = invoice.period_start() {
            updates.current_period_start = Some(epoch_to_datetime(Some(start)));
        }
        if let Some(end) = invoice.period_end() {
            updates.current_period_end = Some(epoch_to_datetime(Some(end)));
        }

        let record = self
            .reconciler
            .upsert_subscription_for_user(user_id, updates, None)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            quota_limit = record.quota_limit,
            usage_reset = rollover,
            "Invoice paid"
        );

        let profile = self.profile(user_id).await;

        if let (Some(coupon_id), Some(profile)) = (invoice.coupon_id(), profile.as_ref()) {
            self.mark_referral_coupon_redeemed(user_id, profile, coupon_id).await;
        }

        let recipient = invoice
            .customer_email()
            .map(str::to_string)
            .or_else(|| profile.and_then(|p| p.email));
        if let Some(email) = recipient {
            let plan = self.reconciler.plans().plan_label(price_reference.as_deref());
            self.notify(Notification::billing_summary(
                &email,
                plan,
                invoice.amount_paid,
                invoice.currency.as_deref(),
                record.quota_limit,
            ))
            .await;
        }

        Ok(EventOutcome::Applied { user_id })
    }

    async fn mark_referral_coupon_redeemed(&self, user_id: UserId, profile: &UserProfile, coupon_id: &str) {
        let metadata = &profile.metadata;
        if metadata.referral_coupon_id.as_deref() != Some(coupon_id)
            || metadata.referral_coupon_redeemed == Some(true)
        {
            return;
        }

        let mut updated = metadata.clone();
        updated.referral_coupon_redeemed = Some(true);
        match self.identity.update_metadata(user_id, &updated).await {
            Ok(()) => tracing::info!(user_id = %user_id, coupon_id = %coupon_id, "Referral coupon redeemed"),
            Err(e) => tracing::warn!(
                user_id = %user_id,
                coupon_id = %coupon_id,
                error = %e,
                "Failed to mark referral coupon as redeemed"
            ),
        }
    }

    async fn apply_payment_failed(&self, invoice: &InvoicePayload) -> BillingResult<EventOutcome> {
        let mut recipient = invoice.customer_email().map(str::to_string);
        if recipient.is_none() {
            if let Some(user_id) = self.resolve_invoice_user(invoice).await? {
                recipient = self.profile(user_id).await.and_then(|p| p.email);
            }
        }

        let Some(email) = recipient else {
            tracing::warn!(
                invoice_id = ?invoice.id,
                "Payment failed but no recipient could be determined"
            );
            return Ok(EventOutcome::Dropped {
                reason: "no recipient",
            });
        };

        tracing::info!(invoice_id = ?invoice.id, "Payment failed, notifying customer");
        self.notify(Notification::payment_failed(
            &email,
            invoice.amount_due,
            invoice.currency.as_deref(),
            invoice.hosted_invoice_url.as_deref(),
        ))
        .await;

        Ok(EventOutcome::Notified)
    }
}
