//! Subscription persistence
//!
//! [`SubscriptionStore`] is the seam between the quota logic and the relational
//! store. [`PgSubscriptionStore`] is the production implementation.

use async_trait::async_trait;
use retouch_shared::{SubscriptionPatch, SubscriptionRecord, UserId};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, billing_customer_id, billing_subscription_id, price_reference,
    status, current_period_start, current_period_end, quota_limit, quota_used,
    created_at, updated_at
"#;

/// Row-oriented access to the `subscriptions` table
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_user(&self, user_id: UserId) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_by_customer(&self, customer_id: &str)
        -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert a row. If the user already has one, the existing row is returned unchanged.
    async fn insert(&self, record: SubscriptionRecord) -> BillingResult<SubscriptionRecord>;

    /// Apply a field-wise patch and stamp `updated_at`. Returns `None` if the user has no row.
    async fn update(
        &self,
        user_id: UserId,
        patch: SubscriptionPatch,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// `quota_used += 1`. Returns `None` if the user has no row.
    async fn increment_usage(&self, user_id: UserId) -> BillingResult<Option<SubscriptionRecord>>;

    /// Rows linked to a billing-provider subscription
    async fn list_linked(&self) -> BillingResult<Vec<SubscriptionRecord>>;
}

/// Postgres-backed subscription store
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_one(&self, column: &str, value: &str) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE {} = $1 ORDER BY updated_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS, column
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_by_user(&self, user_id: UserId) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!("SELECT {} FROM subscriptions WHERE user_id = $1", SUBSCRIPTION_COLUMNS);
        let record = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn find_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.find_one("billing_customer_id", customer_id).await
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.find_one("billing_subscription_id", subscription_id).await
    }

    async fn insert(&self, record: SubscriptionRecord) -> BillingResult<SubscriptionRecord> {
        let query = format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, billing_customer_id, billing_subscription_id, price_reference,
                status, current_period_start, current_period_end, quota_limit, quota_used,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
            ON CONFLICT (user_id) DO NOTHING
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );

        let inserted = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(record.id)
            .bind(record.user_id)
            .bind(&record.billing_customer_id)
            .bind(&record.billing_subscription_id)
            .bind(&record.price_reference)
            .bind(record.status)
            .bind(record.current_period_start)
            .bind(record.current_period_end)
            .bind(record.quota_limit)
            .bind(record.quota_used)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => Ok(row),
            // Lost a race with a concurrent ensure; the winner's row stands
            None => self.find_by_user(record.user_id).await?.ok_or_else(|| {
                crate::error::BillingError::Database(format!(
                    "subscription row for {} vanished after conflict",
                    record.user_id
                ))
            }),
        }
    }

    async fn update(
        &self,
        user_id: UserId,
        patch: SubscriptionPatch,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut tx = self.pool.begin().await?;

        let query = format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        );
        let current = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(mut record) = current else {
            tx.rollback().await?;
            return Ok(None);
        };

        patch.apply_to(&mut record);
        record.updated_at = OffsetDateTime::now_utc();

        sqlx::query(
            r#"
            UPDATE subscriptions SET
                billing_customer_id = $2,
                billing_subscription_id = $3,
                price_reference = $4,
                status = $5,
                current_period_start = $6,
                current_period_end = $7,
                quota_limit = $8,
                quota_used = $9,
                updated_at = $10
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(&record.billing_customer_id)
        .bind(&record.billing_subscription_id)
        .bind(&record.price_reference)
        .bind(record.status)
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.quota_limit)
        .bind(record.quota_used)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(record))
    }

    async fn increment_usage(&self, user_id: UserId) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            r#"
            UPDATE subscriptions
            SET quota_used = quota_used + 1, updated_at = NOW()
            WHERE user_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn list_linked(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE billing_subscription_id IS NOT NULL ORDER BY updated_at ASC",
            SUBSCRIPTION_COLUMNS
        );
        let records = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }
}
