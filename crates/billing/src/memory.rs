//! In-memory collaborators
//!
//! Process-local implementations of the billing seams. They back the test
//! suites and let the API run without Postgres, Supabase, or Stripe.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use retouch_shared::{SubscriptionPatch, SubscriptionRecord, UserId};
use serde_json::Value;
use time::OffsetDateTime;

use crate::customer::CustomerDirectory;
use crate::email::{Notification, Notifier};
use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionPayload;
use crate::identity::{IdentityProvider, UserMetadata, UserProfile};
use crate::reconciliation::SubscriptionSource;
use crate::referrals::{CodeInsert, ReferralCodeStore};
use crate::store::SubscriptionStore;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Default)]
pub struct InMemorySubscriptionStore {
    rows: RwLock<HashMap<UserId, SubscriptionRecord>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        read(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, user_id: UserId) -> Option<SubscriptionRecord> {
        read(&self.rows).get(&user_id).cloned()
    }

    /// Overwrite `quota_used` directly, bypassing the reconciler
    pub fn set_usage(&self, user_id: UserId, quota_used: i32) {
        if let Some(row) = write(&self.rows).get_mut(&user_id) {
            row.quota_used = quota_used;
        }
    }

    fn find_latest(&self, matches: impl Fn(&SubscriptionRecord) -> bool) -> Option<SubscriptionRecord> {
        read(&self.rows)
            .values()
            .filter(|row| matches(row))
            .max_by_key(|row| row.updated_at)
            .cloned()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn find_by_user(&self, user_id: UserId) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.get(user_id))
    }

    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.find_latest(|row| row.billing_customer_id.as_deref() == Some(customer_id)))
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.find_latest(|row| row.billing_subscription_id.as_deref() == Some(subscription_id)))
    }

    async fn insert(&self, record: SubscriptionRecord) -> BillingResult<SubscriptionRecord> {
        let mut rows = write(&self.rows);
        Ok(rows.entry(record.user_id).or_insert(record).clone())
    }

    async fn update(
        &self,
        user_id: UserId,
        patch: SubscriptionPatch,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut rows = write(&self.rows);
        Ok(rows.get_mut(&user_id).map(|row| {
            patch.apply_to(row);
            row.updated_at = OffsetDateTime::now_utc();
            row.clone()
        }))
    }

    async fn increment_usage(&self, user_id: UserId) -> BillingResult<Option<SubscriptionRecord>> {
        let mut rows = write(&self.rows);
        Ok(rows.get_mut(&user_id).map(|row| {
            row.quota_used += 1;
            row.updated_at = OffsetDateTime::now_utc();
            row.clone()
        }))
    }

    async fn list_linked(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let mut linked: Vec<_> = read(&self.rows)
            .values()
            .filter(|row| row.billing_subscription_id.is_some())
            .cloned()
            .collect();
        linked.sort_by_key(|row| row.updated_at);
        Ok(linked)
    }
}

// =============================================================================
// Identity
// =============================================================================

struct StoredUser {
    email: Option<String>,
    metadata: Value,
    app_metadata: Value,
}

#[derive(Default)]
pub struct InMemoryIdentityProvider {
    users: RwLock<HashMap<UserId, StoredUser>>,
    writes: AtomicUsize,
    fail_updates: AtomicBool,
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user_id: UserId, email: Option<&str>, metadata: Value) {
        write(&self.users).insert(
            user_id,
            StoredUser {
                email: email.map(str::to_string),
                metadata,
                app_metadata: Value::Object(Default::default()),
            },
        );
    }

    pub fn set_app_metadata(&self, user_id: UserId, app_metadata: Value) {
        if let Some(user) = write(&self.users).get_mut(&user_id) {
            user.app_metadata = app_metadata;
        }
    }

    /// Raw metadata blob as last written
    pub fn metadata(&self, user_id: UserId) -> Option<Value> {
        read(&self.users).get(&user_id).map(|u| u.metadata.clone())
    }

    /// Number of successful metadata writes
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent metadata write fail
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn get_user(&self, user_id: UserId) -> BillingResult<UserProfile> {
        let users = read(&self.users);
        let user = users
            .get(&user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

        Ok(UserProfile {
            id: user_id,
            email: user.email.clone(),
            metadata: UserMetadata::from_value(user.metadata.clone()),
            app_metadata: user.app_metadata.clone(),
        })
    }

    async fn update_metadata(&self, user_id: UserId, metadata: &UserMetadata) -> BillingResult<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(BillingError::IdentityProvider("metadata update rejected".to_string()));
        }

        let mut users = write(&self.users);
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        user.metadata = metadata.to_value();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Referral codes
// =============================================================================

#[derive(Default)]
pub struct InMemoryReferralCodeStore {
    codes: RwLock<HashMap<UserId, String>>,
    claims: RwLock<Vec<(UserId, UserId, String)>>,
}

impl InMemoryReferralCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `code` to `owner` directly
    pub fn reserve(&self, code: &str, owner: UserId) {
        write(&self.codes).insert(owner, code.to_string());
    }

    pub fn code_for(&self, user_id: UserId) -> Option<String> {
        read(&self.codes).get(&user_id).cloned()
    }

    /// Recorded claims as `(referrer, referred, code)`
    pub fn claims(&self) -> Vec<(UserId, UserId, String)> {
        read(&self.claims).clone()
    }
}

#[async_trait]
impl ReferralCodeStore for InMemoryReferralCodeStore {
    async fn code_for_user(&self, user_id: UserId) -> BillingResult<Option<String>> {
        Ok(self.code_for(user_id))
    }

    async fn insert_code(&self, user_id: UserId, code: &str) -> BillingResult<CodeInsert> {
        let mut codes = write(&self.codes);
        if codes.contains_key(&user_id) || codes.values().any(|c| c == code) {
            return Ok(CodeInsert::Conflict);
        }
        codes.insert(user_id, code.to_string());
        Ok(CodeInsert::Inserted)
    }

    async fn user_for_code(&self, code: &str) -> BillingResult<Option<UserId>> {
        Ok(read(&self.codes)
            .iter()
            .find(|(_, c)| c.as_str() == code)
            .map(|(user_id, _)| *user_id))
    }

    async fn record_claim(&self, referrer: UserId, referred: UserId, code: &str) -> BillingResult<()> {
        write(&self.claims).push((referrer, referred, code.to_string()));
        Ok(())
    }
}

// =============================================================================
// Stripe-side collaborators
// =============================================================================

/// Notifier that keeps every notification it is handed
pub struct RecordingNotifier {
    sent: RwLock<Vec<Notification>>,
    deliver: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            sent: RwLock::new(Vec::new()),
            deliver: true,
        }
    }

    /// Records notifications but reports every send as failed
    pub fn failing() -> Self {
        Self {
            sent: RwLock::new(Vec::new()),
            deliver: false,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        read(&self.sent).clone()
    }
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: Notification) -> bool {
        tracing::debug!(to = %notification.to, category = notification.category.as_str(), "Recorded notification");
        write(&self.sent).push(notification);
        self.deliver
    }
}

/// Fixed `customer id → user` table
#[derive(Default)]
pub struct StaticCustomerDirectory {
    customers: RwLock<HashMap<String, UserId>>,
}

impl StaticCustomerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, customer_id: &str, user_id: UserId) {
        write(&self.customers).insert(customer_id.to_string(), user_id);
    }
}

#[async_trait]
impl CustomerDirectory for StaticCustomerDirectory {
    async fn user_id_for_customer(&self, customer_id: &str) -> BillingResult<Option<UserId>> {
        Ok(read(&self.customers).get(customer_id).copied())
    }
}

/// Subscriptions as the billing provider would report them
#[derive(Default)]
pub struct InMemorySubscriptionSource {
    subscriptions: RwLock<HashMap<String, SubscriptionPayload>>,
    failing: RwLock<HashSet<String>>,
    fetches: AtomicUsize,
}

impl InMemorySubscriptionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subscription: SubscriptionPayload) {
        write(&self.subscriptions).insert(subscription.id.clone(), subscription);
    }

    /// Make fetches of `subscription_id` fail
    pub fn fail(&self, subscription_id: &str) {
        write(&self.failing).insert(subscription_id.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriptionSource for InMemorySubscriptionSource {
    async fn fetch_subscription(&self, subscription_id: &str) -> BillingResult<Option<SubscriptionPayload>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if read(&self.failing).contains(subscription_id) {
            return Err(BillingError::StripeApi(format!(
                "unable to retrieve {}",
                subscription_id
            )));
        }
        Ok(read(&self.subscriptions).get(subscription_id).cloned())
    }
}
