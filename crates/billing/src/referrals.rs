//! Referral codes and the claim flow
//!
//! Each user owns one short code. A new user who claims someone else's code
//! earns the referrer [`REFERRAL_REWARD_BONUS`] credits and may receive a
//! one-time checkout coupon.
//!
//! Codes live in the `referral_codes` table when it exists. Deployments without
//! it run in [`ReferralCodeBackend::MetadataOnly`] mode, chosen once at startup:
//! codes are kept in the owner's metadata and cannot be reverse-resolved.

use std::sync::Arc;

use async_trait::async_trait;
use retouch_shared::UserId;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::credits::CreditLedger;
use crate::error::{BillingError, BillingResult};
use crate::identity::IdentityProvider;
use crate::reconciler::QuotaReconciler;

/// Credits granted to the referrer per successful claim
pub const REFERRAL_REWARD_BONUS: i64 = 10;

const MAX_CODE_ATTEMPTS: usize = 5;
const CODE_PREFIX_LEN: usize = 6;
const CODE_SUFFIX_LEN: usize = 4;

/// Trim and upper-case a client-supplied code; blank input yields `None`
pub fn normalize_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_uppercase();
    (!code.is_empty()).then_some(code)
}

/// Candidate code for `user_id`. The first attempt is derived from the id alone;
/// later attempts append a random suffix.
pub fn candidate_code(user_id: UserId, attempt: usize) -> String {
    let simple = user_id.as_uuid().simple().to_string();
    let base: String = simple.chars().take(CODE_PREFIX_LEN).collect::<String>().to_uppercase();
    if attempt == 0 {
        return base;
    }
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(CODE_SUFFIX_LEN)
        .collect::<String>()
        .to_uppercase();
    format!("{}{}", base, suffix)
}

/// Result of inserting a code mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeInsert {
    Inserted,
    /// The code or the user already has a mapping
    Conflict,
}

/// `code → user` mapping store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReferralCodeStore: Send + Sync {
    async fn code_for_user(&self, user_id: UserId) -> BillingResult<Option<String>>;

    async fn insert_code(&self, user_id: UserId, code: &str) -> BillingResult<CodeInsert>;

    async fn user_for_code(&self, code: &str) -> BillingResult<Option<UserId>>;

    /// Append to the claim audit trail
    async fn record_claim(&self, referrer: UserId, referred: UserId, code: &str) -> BillingResult<()>;
}

/// Postgres-backed referral code store
#[derive(Clone)]
pub struct PgReferralCodeStore {
    pool: PgPool,
}

impl PgReferralCodeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReferralCodeStore for PgReferralCodeStore {
    async fn code_for_user(&self, user_id: UserId) -> BillingResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT code FROM referral_codes WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(code,)| code))
    }

    async fn insert_code(&self, user_id: UserId, code: &str) -> BillingResult<CodeInsert> {
        let result = sqlx::query(
            r#"
            INSERT INTO referral_codes (user_id, code, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(code)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            CodeInsert::Inserted
        } else {
            CodeInsert::Conflict
        })
    }

    async fn user_for_code(&self, code: &str) -> BillingResult<Option<UserId>> {
        let row: Option<(UserId,)> = sqlx::query_as("SELECT user_id FROM referral_codes WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(user_id,)| user_id))
    }

    async fn record_claim(&self, referrer: UserId, referred: UserId, code: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO referral_claims (id, referrer_id, referred_id, referral_code, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(referrer)
        .bind(referred)
        .bind(code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Whether the `referral_codes` table is present. Probed once at startup.
pub async fn referral_codes_available(pool: &PgPool) -> BillingResult<bool> {
    Ok(retouch_shared::table_exists(pool, "referral_codes").await?)
}

/// Where referral codes are persisted
#[derive(Clone)]
pub enum ReferralCodeBackend {
    Table(Arc<dyn ReferralCodeStore>),
    MetadataOnly,
}

/// Outcome of a claim attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed { referrer_id: UserId, reward: i64 },
    /// The user has already used a referral code; nothing changed
    AlreadyClaimed,
}

/// What the referral page shows a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferralSummary {
    pub code: String,
    pub credits: i64,
    pub referred_by: Option<String>,
}

/// Referral code allocation and claim orchestration
#[derive(Clone)]
pub struct ReferralService {
    backend: ReferralCodeBackend,
    identity: Arc<dyn IdentityProvider>,
    ledger: CreditLedger,
    reconciler: QuotaReconciler,
    coupon_id: Option<String>,
}

impl ReferralService {
    pub fn new(
        backend: ReferralCodeBackend,
        identity: Arc<dyn IdentityProvider>,
        ledger: CreditLedger,
        reconciler: QuotaReconciler,
        coupon_id: Option<String>,
    ) -> Self {
        Self {
            backend,
            identity,
            ledger,
            reconciler,
            coupon_id,
        }
    }

    /// Return the user's code, allocating one on first use
    pub async fn ensure_referral_code(&self, user_id: UserId) -> BillingResult<String> {
        let store = match &self.backend {
            ReferralCodeBackend::Table(store) => store,
            ReferralCodeBackend::MetadataOnly => return self.ensure_code_in_metadata(user_id).await,
        };

        if let Some(code) = store.code_for_user(user_id).await? {
            return Ok(code);
        }

        for attempt in 0..MAX_CODE_ATTEMPTS {
            let code = candidate_code(user_id, attempt);
            match store.insert_code(user_id, &code).await? {
                CodeInsert::Inserted => {
                    tracing::info!(user_id = %user_id, code = %code, "Allocated referral code");
                    return Ok(code);
                }
                CodeInsert::Conflict => {
                    // A concurrent request may have allocated one for this user
                    if let Some(existing) = store.code_for_user(user_id).await? {
                        return Ok(existing);
                    }
                    tracing::debug!(user_id = %user_id, attempt = attempt, "Referral code collision");
                }
            }
        }

        tracing::warn!(
            user_id = %user_id,
            attempts = MAX_CODE_ATTEMPTS,
            "Referral code attempts exhausted, storing code in metadata"
        );
        self.ensure_code_in_metadata(user_id).await.map_err(|e| {
            tracing::error!(user_id = %user_id, error = %e, "Metadata fallback for referral code failed");
            BillingError::ReferralCodeExhausted(user_id.to_string())
        })
    }

    async fn ensure_code_in_metadata(&self, user_id: UserId) -> BillingResult<String> {
        let profile = self.identity.get_user(user_id).await?;
        if let Some(code) = profile.metadata.referral_code {
            return Ok(code);
        }

        let mut metadata = profile.metadata;
        let code = candidate_code(user_id, 0);
        metadata.referral_code = Some(code.clone());
        self.identity.update_metadata(user_id, &metadata).await?;
        Ok(code)
    }

    /// Resolve a code to its owner. Unknown codes and metadata-only mode both yield `None`.
    pub async fn find_referrer_by_code(&self, code: &str) -> BillingResult<Option<UserId>> {
        match &self.backend {
            ReferralCodeBackend::Table(store) => store.user_for_code(code).await,
            ReferralCodeBackend::MetadataOnly => Ok(None),
        }
    }

    /// Code, credit balance, and referrer for the referral page
    pub async fn referral_summary(&self, user_id: UserId) -> BillingResult<ReferralSummary> {
        let code = self.ensure_referral_code(user_id).await?;
        let credits = self.ledger.get_balance(user_id).await?;
        let profile = self.identity.get_user(user_id).await?;

        Ok(ReferralSummary {
            code,
            credits,
            referred_by: profile.metadata.referred_by,
        })
    }

    /// Claim `raw_code` on behalf of `claimant`.
    ///
    /// The claimant is marked before the referrer is credited, so a failure part
    /// way through can at worst lose a reward, never pay it twice.
    pub async fn claim(&self, claimant: UserId, raw_code: &str) -> BillingResult<ClaimOutcome> {
        let code = normalize_code(raw_code).ok_or(BillingError::MissingReferralCode)?;

        let profile = self.identity.get_user(claimant).await?;
        if profile.metadata.has_claimed_referral() {
            tracing::info!(user_id = %claimant, "Referral already claimed");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        let referrer = self
            .find_referrer_by_code(&code)
            .await?
            .ok_or_else(|| BillingError::ReferralCodeNotFound(code.clone()))?;

        if referrer == claimant {
            return Err(BillingError::SelfReferral);
        }

        self.reconciler.ensure_subscription_row(claimant, None).await?;
        self.reconciler.ensure_subscription_row(referrer, None).await?;

        let mut metadata = profile.metadata;
        metadata.referred_by = Some(code.clone());
        metadata.referral_reward_claimed = Some(true);
        if metadata.referral_coupon_id.is_none() {
            metadata.referral_coupon_id = self.coupon_id.clone();
        }
        if metadata.referral_coupon_id.is_some() {
            metadata.referral_coupon_redeemed = Some(false);
        }
        self.identity.update_metadata(claimant, &metadata).await?;

        self.ledger
            .add_credits(referrer, REFERRAL_REWARD_BONUS)
            .await
            .map_err(|e| {
                tracing::error!(
                    referrer_id = %referrer,
                    referred_id = %claimant,
                    error = %e,
                    "Failed to credit referrer after marking claim"
                );
                e
            })?;

        if let ReferralCodeBackend::Table(store) = &self.backend {
            if let Err(e) = store.record_claim(referrer, claimant, &code).await {
                tracing::warn!(
                    referrer_id = %referrer,
                    referred_id = %claimant,
                    error = %e,
                    "Failed to record referral claim"
                );
            }
        }

        tracing::info!(
            referrer_id = %referrer,
            referred_id = %claimant,
            code = %code,
            reward = REFERRAL_REWARD_BONUS,
            "Referral claimed"
        );

        Ok(ClaimOutcome::Claimed {
            referrer_id: referrer,
            reward: REFERRAL_REWARD_BONUS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryIdentityProvider, InMemoryReferralCodeStore, InMemorySubscriptionStore};
    use crate::plans::PlanCatalog;
    use serde_json::json;

    struct Harness {
        service: ReferralService,
        identity: Arc<InMemoryIdentityProvider>,
        codes: Arc<InMemoryReferralCodeStore>,
        subscriptions: Arc<InMemorySubscriptionStore>,
    }

    fn harness(coupon_id: Option<&str>) -> Harness {
        let identity = Arc::new(InMemoryIdentityProvider::new());
        let codes = Arc::new(InMemoryReferralCodeStore::new());
        let subscriptions = Arc::new(InMemorySubscriptionStore::new());
        let reconciler = QuotaReconciler::new(subscriptions.clone(), PlanCatalog::default());
        let service = ReferralService::new(
            ReferralCodeBackend::Table(codes.clone()),
            identity.clone(),
            CreditLedger::new(identity.clone()),
            reconciler,
            coupon_id.map(str::to_string),
        );
        Harness {
            service,
            identity,
            codes,
            subscriptions,
        }
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("  ab12cd "), Some("AB12CD".to_string()));
        assert_eq!(normalize_code("   "), None);
        assert_eq!(normalize_code(""), None);
    }

    #[test]
    fn test_candidate_code_shape() {
        let user = UserId::new();
        let first = candidate_code(user, 0);
        assert_eq!(first.len(), CODE_PREFIX_LEN);
        assert_eq!(first, candidate_code(user, 0));
        assert_eq!(first, first.to_uppercase());

        let retry = candidate_code(user, 1);
        assert_eq!(retry.len(), CODE_PREFIX_LEN + CODE_SUFFIX_LEN);
        assert!(retry.starts_with(&first));
    }

    #[tokio::test]
    async fn test_ensure_code_is_stable() {
        let h = harness(None);
        let user = UserId::new();
        h.identity.add_user(user, None, json!({}));

        let code = h.service.ensure_referral_code(user).await.unwrap();
        assert_eq!(h.service.ensure_referral_code(user).await.unwrap(), code);
        assert_eq!(h.service.find_referrer_by_code(&code).await.unwrap(), Some(user));
    }

    #[tokio::test]
    async fn test_ensure_code_retries_on_collision() {
        let h = harness(None);
        let user = UserId::new();
        h.codes.reserve(&candidate_code(user, 0), UserId::new());

        let code = h.service.ensure_referral_code(user).await.unwrap();
        assert_eq!(code.len(), CODE_PREFIX_LEN + CODE_SUFFIX_LEN);
        assert_eq!(h.codes.code_for(user), Some(code));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fall_back_to_metadata() {
        let mut store = MockReferralCodeStore::new();
        store.expect_code_for_user().returning(|_| Ok(None));
        store
            .expect_insert_code()
            .times(MAX_CODE_ATTEMPTS)
            .returning(|_, _| Ok(CodeInsert::Conflict));

        let identity = Arc::new(InMemoryIdentityProvider::new());
        let user = UserId::new();
        identity.add_user(user, None, json!({}));
        let service = ReferralService::new(
            ReferralCodeBackend::Table(Arc::new(store)),
            identity.clone(),
            CreditLedger::new(identity.clone()),
            QuotaReconciler::new(Arc::new(InMemorySubscriptionStore::new()), PlanCatalog::default()),
            None,
        );

        let code = service.ensure_referral_code(user).await.unwrap();
        assert_eq!(code, candidate_code(user, 0));
        assert_eq!(identity.metadata(user).unwrap()["referral_code"], code);
    }

    #[tokio::test]
    async fn test_metadata_only_backend() {
        let identity = Arc::new(InMemoryIdentityProvider::new());
        let user = UserId::new();
        identity.add_user(user, None, json!({ "full_name": "Lin" }));
        let service = ReferralService::new(
            ReferralCodeBackend::MetadataOnly,
            identity.clone(),
            CreditLedger::new(identity.clone()),
            QuotaReconciler::new(Arc::new(InMemorySubscriptionStore::new()), PlanCatalog::default()),
            None,
        );

        let code = service.ensure_referral_code(user).await.unwrap();
        let stored = identity.metadata(user).unwrap();
        assert_eq!(stored["referral_code"], code);
        assert_eq!(stored["full_name"], "Lin");
        assert_eq!(service.ensure_referral_code(user).await.unwrap(), code);
        assert_eq!(service.find_referrer_by_code(&code).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_claim_credits_referrer_and_marks_claimant() {
        let h = harness(Some("coupon_welcome"));
        let referrer = UserId::new();
        let claimant = UserId::new();
        h.identity.add_user(referrer, None, json!({ "credit_balance": 2 }));
        h.identity.add_user(claimant, None, json!({}));
        let code = h.service.ensure_referral_code(referrer).await.unwrap();

        let outcome = h
            .service
            .claim(claimant, &format!(" {} ", code.to_lowercase()))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Claimed {
                referrer_id: referrer,
                reward: REFERRAL_REWARD_BONUS
            }
        );

        assert_eq!(h.identity.metadata(referrer).unwrap()["credit_balance"], 12);
        let claimant_meta = h.identity.metadata(claimant).unwrap();
        assert_eq!(claimant_meta["referred_by"], code);
        assert_eq!(claimant_meta["referral_reward_claimed"], true);
        assert_eq!(claimant_meta["referral_coupon_id"], "coupon_welcome");
        assert_eq!(claimant_meta["referral_coupon_redeemed"], false);

        assert!(h.subscriptions.get(claimant).is_some());
        assert!(h.subscriptions.get(referrer).is_some());
        assert_eq!(h.codes.claims(), vec![(referrer, claimant, code)]);
    }

    #[tokio::test]
    async fn test_second_claim_is_a_no_op() {
        let h = harness(None);
        let referrer = UserId::new();
        let claimant = UserId::new();
        h.identity.add_user(referrer, None, json!({}));
        h.identity.add_user(claimant, None, json!({}));
        let code = h.service.ensure_referral_code(referrer).await.unwrap();

        h.service.claim(claimant, &code).await.unwrap();
        let outcome = h.service.claim(claimant, &code).await.unwrap();

        assert_eq!(outcome, ClaimOutcome::AlreadyClaimed);
        assert_eq!(h.identity.metadata(referrer).unwrap()["credit_balance"], REFERRAL_REWARD_BONUS);
    }

    #[tokio::test]
    async fn test_self_referral_rejected_before_any_write() {
        let h = harness(None);
        let user = UserId::new();
        h.identity.add_user(user, None, json!({ "credit_balance": 1 }));
        let code = h.service.ensure_referral_code(user).await.unwrap();
        let writes = h.identity.write_count();

        let result = h.service.claim(user, &code).await;
        assert!(matches!(result, Err(BillingError::SelfReferral)));
        assert_eq!(h.identity.write_count(), writes);
        assert_eq!(h.identity.metadata(user).unwrap()["credit_balance"], 1);
    }

    #[tokio::test]
    async fn test_unknown_and_missing_codes() {
        let h = harness(None);
        let user = UserId::new();
        h.identity.add_user(user, None, json!({}));

        assert!(matches!(
            h.service.claim(user, "NOPE42").await,
            Err(BillingError::ReferralCodeNotFound(code)) if code == "NOPE42"
        ));
        assert!(matches!(
            h.service.claim(user, "   ").await,
            Err(BillingError::MissingReferralCode)
        ));
    }

    #[tokio::test]
    async fn test_claim_audit_failure_is_not_fatal() {
        let mut store = MockReferralCodeStore::new();
        let referrer = UserId::new();
        store
            .expect_user_for_code()
            .returning(move |_| Ok(Some(referrer)));
        store
            .expect_record_claim()
            .times(1)
            .returning(|_, _, _| Err(BillingError::Database("insert failed".to_string())));

        let identity = Arc::new(InMemoryIdentityProvider::new());
        let claimant = UserId::new();
        identity.add_user(referrer, None, json!({}));
        identity.add_user(claimant, None, json!({}));
        let service = ReferralService::new(
            ReferralCodeBackend::Table(Arc::new(store)),
            identity.clone(),
            CreditLedger::new(identity.clone()),
            QuotaReconciler::new(Arc::new(InMemorySubscriptionStore::new()), PlanCatalog::default()),
            None,
        );

        let outcome = service.claim(claimant, "abc123").await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed { .. }));
        assert_eq!(identity.metadata(referrer).unwrap()["credit_balance"], REFERRAL_REWARD_BONUS);
    }

    #[tokio::test]
    async fn test_summary_reports_balance_and_referrer() {
        let h = harness(None);
        let user = UserId::new();
        h.identity.add_user(user, None, json!({ "referral_credits": 3, "referred_by": "ZZZ999" }));

        let summary = h.service.referral_summary(user).await.unwrap();
        assert_eq!(summary.credits, 3);
        assert_eq!(summary.referred_by.as_deref(), Some("ZZZ999"));
        assert_eq!(summary.code, candidate_code(user, 0));
    }
}
