#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Retouch Billing
//!
//! Quota reconciliation against Stripe, the credit ledger, and referral codes.
//!
//! The [`QuotaReconciler`] owns the per-user subscription row: generation
//! requests go through it to gate on quota, and Stripe events go through the
//! [`BillingEventProcessor`] to mirror plan, status, and billing period into it.
//! The [`CreditLedger`] and [`ReferralService`] live on identity-provider
//! metadata and only touch the reconciler to ensure a baseline row exists.

pub mod checkout;
pub mod client;
pub mod credits;
pub mod customer;
pub mod email;
pub mod error;
pub mod events;
pub mod identity;
pub mod memory;
pub mod plans;
pub mod portal;
pub mod reconciler;
pub mod reconciliation;
pub mod referrals;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

pub use checkout::{CheckoutResponse, CheckoutService};
pub use client::{PriceIds, StripeClient, StripeConfig};
pub use credits::{exact_credits, migrate_legacy_credits, whole_credits, CreditLedger, CREDITS_SCHEMA_VERSION};
pub use customer::{user_id_from_metadata, CustomerDirectory, CustomerService, StripeCustomerDirectory};
pub use email::{BillingEmailService, EmailConfig, Notification, NotificationCategory, Notifier};
pub use error::{BillingError, BillingResult};
pub use events::{BillingEvent, BillingEventProcessor, EventOutcome, SubscriptionEventKind, SubscriptionPayload};
pub use identity::{IdentityProvider, SupabaseAdminClient, UserMetadata, UserProfile};
pub use plans::{Plan, PlanCatalog, BASIC_PLAN_QUOTA, FREE_TIER_QUOTA, PRO_PLAN_QUOTA};
pub use portal::{PortalResponse, PortalService};
pub use reconciler::{should_reset_usage, QuotaDecision, QuotaReconciler};
pub use reconciliation::{ReconciliationSweep, StripeSubscriptionSource, SubscriptionSource, SweepReport};
pub use referrals::{
    referral_codes_available, ClaimOutcome, PgReferralCodeStore, ReferralCodeBackend, ReferralCodeStore,
    ReferralService, ReferralSummary, REFERRAL_REWARD_BONUS,
};
pub use store::{PgSubscriptionStore, SubscriptionStore};
pub use subscriptions::{UpgradeOutcome, UpgradeService};
pub use webhooks::{WebhookEvent, WebhookHandler};
