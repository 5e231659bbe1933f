//! Quota reconciler
//!
//! Keeps each user's `quota_limit`/`quota_used` pair consistent with the
//! billing provider's view of their subscription and gates generation
//! requests against it.

use std::sync::Arc;

use retouch_shared::{SubscriptionPatch, SubscriptionRecord, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::plans::{PlanCatalog, FREE_TIER_QUOTA};
use crate::store::SubscriptionStore;

/// Outcome of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub quota_used: i32,
    pub quota_limit: i32,
}

impl QuotaDecision {
    pub fn remaining(&self) -> i32 {
        (self.quota_limit - self.quota_used).max(0)
    }

    /// Turn a rejection into [`BillingError::QuotaExceeded`]
    pub fn require_allowed(self) -> BillingResult<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(BillingError::QuotaExceeded {
                used: self.quota_used,
                limit: self.quota_limit,
            })
        }
    }
}

/// Decide whether a provider-reported period start means usage rolls over.
///
/// Only provider period boundaries count; calendar time is never consulted.
/// `next_period_start` is epoch seconds, with 0 meaning "not reported".
pub fn should_reset_usage(previous_period_start: Option<OffsetDateTime>, next_period_start: i64) -> bool {
    if next_period_start == 0 {
        return false;
    }
    match previous_period_start {
        None => true,
        Some(previous) => previous.unix_timestamp() != next_period_start,
    }
}

/// Convert provider epoch seconds to a timestamp; 0 and out-of-range values are absent
pub fn epoch_to_datetime(epoch: Option<i64>) -> Option<OffsetDateTime> {
    epoch
        .filter(|e| *e != 0)
        .and_then(|e| OffsetDateTime::from_unix_timestamp(e).ok())
}

/// Quota state machine over a [`SubscriptionStore`]
#[derive(Clone)]
pub struct QuotaReconciler {
    store: Arc<dyn SubscriptionStore>,
    plans: PlanCatalog,
}

impl QuotaReconciler {
    pub fn new(store: Arc<dyn SubscriptionStore>, plans: PlanCatalog) -> Self {
        Self { store, plans }
    }

    pub fn plans(&self) -> &PlanCatalog {
        &self.plans
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    pub fn resolve_quota_limit(&self, price_reference: Option<&str>) -> i32 {
        self.plans.resolve_quota_limit(price_reference)
    }

    pub async fn find(&self, user_id: UserId) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.find_by_user(user_id).await
    }

    /// Return the user's row, creating a free-tier one if absent.
    ///
    /// With `defaults`, an existing row is patched with them first; a new row is
    /// seeded with them on top of the free baseline. Safe to call repeatedly.
    pub async fn ensure_subscription_row(
        &self,
        user_id: UserId,
        defaults: Option<SubscriptionPatch>,
    ) -> BillingResult<SubscriptionRecord> {
        let defaults = defaults.filter(|d| !d.is_empty());

        if let Some(existing) = self.store.find_by_user(user_id).await? {
            return match defaults {
                Some(patch) => Ok(self.store.update(user_id, patch).await?.unwrap_or(existing)),
                None => Ok(existing),
            };
        }

        let mut record = SubscriptionRecord::baseline(user_id, FREE_TIER_QUOTA);
        if let Some(patch) = &defaults {
            patch.apply_to(&mut record);
        }

        let inserted = self.store.insert(record).await?;
        tracing::info!(
            user_id = %user_id,
            status = %inserted.status,
            quota_limit = inserted.quota_limit,
            "Created subscription row"
        );
        Ok(inserted)
    }

    /// Merge `updates` onto the user's row, or insert one built from the free
    /// baseline, then `create_defaults`, then `updates` (later wins).
    pub async fn upsert_subscription_for_user(
        &self,
        user_id: UserId,
        updates: SubscriptionPatch,
        create_defaults: Option<SubscriptionPatch>,
    ) -> BillingResult<SubscriptionRecord> {
        if let Some(updated) = self.store.update(user_id, updates.clone()).await? {
            return Ok(updated);
        }

        let seed = create_defaults.unwrap_or_default().merge(updates);
        let mut record = SubscriptionRecord::baseline(user_id, FREE_TIER_QUOTA);
        seed.apply_to(&mut record);
        let candidate_id = record.id;

        let inserted = self.store.insert(record).await?;
        if inserted.id != candidate_id {
            // A concurrent ensure created the row between our update and insert
            return self
                .store
                .update(user_id, seed)
                .await?
                .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()));
        }
        Ok(inserted)
    }

    /// Check whether the user may start a generation.
    ///
    /// The limit is re-derived from the plan on every call and corrected in place
    /// if the stored value drifted. Usage is NOT incremented here: callers run the
    /// external generation and then call [`Self::record_generation_success`].
    /// Concurrent requests from one user can therefore all pass the check before
    /// any of them increments, overshooting the limit by the number in flight.
    /// This is accepted; serializing the two steps would hold a row lock across
    /// a multi-second external call.
    pub async fn record_generation_attempt(&self, user_id: UserId) -> BillingResult<QuotaDecision> {
        let record = self.ensure_subscription_row(user_id, None).await?;

        let expected_limit = if record.has_paid_plan() {
            self.plans.resolve_quota_limit(record.price_reference.as_deref())
        } else {
            FREE_TIER_QUOTA
        };

        let quota_limit = if record.quota_limit != expected_limit {
            tracing::info!(
                user_id = %user_id,
                stored = record.quota_limit,
                expected = expected_limit,
                "Correcting drifted quota limit"
            );
            let patch = SubscriptionPatch {
                quota_limit: Some(expected_limit),
                ..Default::default()
            };
            self.store.update(user_id, patch).await?;
            expected_limit
        } else {
            record.quota_limit
        };

        let decision = QuotaDecision {
            allowed: record.quota_used < quota_limit,
            quota_used: record.quota_used,
            quota_limit,
        };

        if !decision.allowed {
            tracing::info!(
                user_id = %user_id,
                quota_used = decision.quota_used,
                quota_limit = decision.quota_limit,
                "Generation rejected: quota exhausted"
            );
        }

        Ok(decision)
    }

    /// Count one successful generation
    pub async fn record_generation_success(&self, user_id: UserId) -> BillingResult<SubscriptionRecord> {
        if let Some(record) = self.store.increment_usage(user_id).await? {
            return Ok(record);
        }

        self.ensure_subscription_row(user_id, None).await?;
        self.store
            .increment_usage(user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))
    }
}
