//! Common types used across Retouch

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::RetouchError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper (the identity provider's user id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for UserId {
    type Err = RetouchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| RetouchError::InvalidUserId(s.to_string()))
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription status.
///
/// `Free` and `Pending` are local states; everything else mirrors the billing
/// provider's subscription status verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Free,
    Pending,
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Free
    }
}

impl SubscriptionStatus {
    /// Statuses under which a paid plan's quota applies
    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }

    /// Terminal statuses that drop the user back to the free tier
    pub fn forces_free_tier(&self) -> bool {
        matches!(self, Self::Canceled | Self::IncompleteExpired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Unpaid => "unpaid",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = RetouchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            // Stripe spells it "canceled"; accept the British spelling from older rows
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "incomplete" => Ok(Self::Incomplete),
            "incomplete_expired" => Ok(Self::IncompleteExpired),
            "unpaid" => Ok(Self::Unpaid),
            "paused" => Ok(Self::Paused),
            _ => Err(RetouchError::UnknownStatus(s.to_string())),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// One row of the `subscriptions` table: the locally mirrored quota state for a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    /// `None` means the free tier
    pub price_reference: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub quota_limit: i32,
    pub quota_used: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// A fresh free-tier row for `user_id`
    pub fn baseline(user_id: UserId, free_quota: i32) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            user_id,
            billing_customer_id: None,
            billing_subscription_id: None,
            price_reference: None,
            status: SubscriptionStatus::Free,
            current_period_start: None,
            current_period_end: None,
            quota_limit: free_quota,
            quota_used: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when a paid price is attached and the provider reports a paying status
    pub fn has_paid_plan(&self) -> bool {
        self.status.is_paid() && self.price_reference.is_some()
    }

    pub fn remaining_quota(&self) -> i32 {
        (self.quota_limit - self.quota_used).max(0)
    }
}

/// Field-wise update for a [`SubscriptionRecord`].
///
/// `None` leaves a field untouched. For nullable columns `Some(None)` clears the
/// value, so "set to null" and "leave alone" stay distinguishable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionPatch {
    pub billing_customer_id: Option<Option<String>>,
    pub billing_subscription_id: Option<Option<String>>,
    pub price_reference: Option<Option<String>>,
    pub status: Option<SubscriptionStatus>,
    pub current_period_start: Option<Option<OffsetDateTime>>,
    pub current_period_end: Option<Option<OffsetDateTime>>,
    pub quota_limit: Option<i32>,
    pub quota_used: Option<i32>,
}

impl SubscriptionPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overlay `other` onto `self`; fields set in `other` win.
    pub fn merge(mut self, other: SubscriptionPatch) -> Self {
        if other.billing_customer_id.is_some() {
            self.billing_customer_id = other.billing_customer_id;
        }
        if other.billing_subscription_id.is_some() {
            self.billing_subscription_id = other.billing_subscription_id;
        }
        if other.price_reference.is_some() {
            self.price_reference = other.price_reference;
        }
        if other.status.is_some() {
            self.status = other.status;
        }
        if other.current_period_start.is_some() {
            self.current_period_start = other.current_period_start;
        }
        if other.current_period_end.is_some() {
            self.current_period_end = other.current_period_end;
        }
        if other.quota_limit.is_some() {
            self.quota_limit = other.quota_limit;
        }
        if other.quota_used.is_some() {
            self.quota_used = other.quota_used;
        }
        self
    }

    /// Overwrite the set fields of `record`. Quota values are floored at zero.
    pub fn apply_to(&self, record: &mut SubscriptionRecord) {
        if let Some(v) = &self.billing_customer_id {
            record.billing_customer_id = v.clone();
        }
        if let Some(v) = &self.billing_subscription_id {
            record.billing_subscription_id = v.clone();
        }
        if let Some(v) = &self.price_reference {
            record.price_reference = v.clone();
        }
        if let Some(v) = self.status {
            record.status = v;
        }
        if let Some(v) = self.current_period_start {
            record.current_period_start = v;
        }
        if let Some(v) = self.current_period_end {
            record.current_period_end = v;
        }
        if let Some(v) = self.quota_limit {
            record.quota_limit = v.max(0);
        }
        if let Some(v) = self.quota_used {
            record.quota_used = v.max(0);
        }
    }
}
