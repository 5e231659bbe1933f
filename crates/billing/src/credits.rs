//! Credit ledger
//!
//! A non-negative integer balance per user, stored in the identity provider's
//! metadata blob and fed by referral rewards and admin grants. It is independent
//! of the generation quota.
//!
//! The identity provider offers no compare-and-swap on metadata, so every write
//! is a whole-blob read-modify-write. Two concurrent writers for the same user
//! can lose one update. Writes are rare per user, which keeps this acceptable.

use std::sync::Arc;

use retouch_shared::UserId;

use crate::error::{BillingError, BillingResult};
use crate::identity::{IdentityProvider, UserMetadata};

/// Current version of the credit fields in user metadata.
///
/// Version 1 folded the legacy `referral_credits` counter into `credit_balance`.
pub const CREDITS_SCHEMA_VERSION: u32 = 1;

/// Bring a metadata blob up to [`CREDITS_SCHEMA_VERSION`].
///
/// Folds a positive legacy `referral_credits` into `credit_balance`, zeroes the
/// legacy field and stamps the version marker. Returns `true` when the balance
/// changed and the blob must be persisted. Running it again is a no-op.
pub fn migrate_legacy_credits(metadata: &mut UserMetadata) -> bool {
    if metadata.credits_schema_version.unwrap_or(0) >= CREDITS_SCHEMA_VERSION {
        return false;
    }

    let legacy = metadata.referral_credits.unwrap_or(0);
    metadata.credits_schema_version = Some(CREDITS_SCHEMA_VERSION);

    if legacy <= 0 {
        if metadata.referral_credits.is_some() {
            metadata.referral_credits = Some(0);
        }
        return false;
    }

    metadata.credit_balance = Some(metadata.balance().saturating_add(legacy));
    metadata.referral_credits = Some(0);
    true
}

/// Validate a raw amount from a client: it must be finite and at least one whole credit.
/// Fractions are floored.
pub fn whole_credits(raw: f64) -> BillingResult<i64> {
    if !raw.is_finite() || raw <= 0.0 {
        return Err(BillingError::InvalidAmount(
            "Credit amount must be a positive number".to_string(),
        ));
    }
    let floored = raw.floor();
    if floored < 1.0 || floored > i64::MAX as f64 {
        return Err(BillingError::InvalidAmount(format!(
            "Credit amount {} is out of range",
            raw
        )));
    }
    Ok(floored as i64)
}

/// Validate an amount to spend. Flooring would let a caller spend 2.7 from a
/// balance of 2, so fractions are rejected outright.
pub fn exact_credits(raw: f64) -> BillingResult<i64> {
    if raw.is_finite() && raw.fract() != 0.0 {
        return Err(BillingError::InvalidAmount(format!(
            "Credit amount {} must be a whole number",
            raw
        )));
    }
    whole_credits(raw)
}

/// Per-user credit balance backed by identity-provider metadata
#[derive(Clone)]
pub struct CreditLedger {
    identity: Arc<dyn IdentityProvider>,
}

impl CreditLedger {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self { identity }
    }

    /// Load metadata, migrating legacy credits on the way.
    /// Returns the (possibly migrated) metadata and whether it still needs persisting.
    async fn load(&self, user_id: UserId) -> BillingResult<(UserMetadata, bool)> {
        let profile = self.identity.get_user(user_id).await?;
        let mut metadata = profile.metadata;
        let migrated = migrate_legacy_credits(&mut metadata);
        if migrated {
            tracing::info!(
                user_id = %user_id,
                balance = metadata.balance(),
                "Migrated legacy referral credits into credit balance"
            );
        }
        Ok((metadata, migrated))
    }

    async fn persist(&self, user_id: UserId, metadata: &mut UserMetadata, balance: i64) -> BillingResult<()> {
        metadata.credit_balance = Some(balance.max(0));
        self.identity.update_metadata(user_id, metadata).await
    }

    /// Current balance (never negative)
    pub async fn get_balance(&self, user_id: UserId) -> BillingResult<i64> {
        let (mut metadata, migrated) = self.load(user_id).await?;
        let balance = metadata.balance();
        if migrated {
            self.persist(user_id, &mut metadata, balance).await?;
        }
        Ok(balance)
    }

    /// Add `amount` credits and return the new balance
    pub async fn add_credits(&self, user_id: UserId, amount: i64) -> BillingResult<i64> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(
                "Credit amount must be a positive number".to_string(),
            ));
        }

        let (mut metadata, _) = self.load(user_id).await?;
        let next = metadata.balance().saturating_add(amount);
        self.persist(user_id, &mut metadata, next).await?;

        tracing::info!(user_id = %user_id, amount = amount, balance = next, "Credits added");
        Ok(next)
    }

    /// Spend `amount` credits. Returns `false` without writing if the amount is not
    /// positive or the balance is insufficient.
    pub async fn consume_credits(&self, user_id: UserId, amount: i64) -> BillingResult<bool> {
        if amount <= 0 {
            return Ok(false);
        }

        let (mut metadata, migrated) = self.load(user_id).await?;
        let current = metadata.balance();

        if current < amount {
            if migrated {
                self.persist(user_id, &mut metadata, current).await?;
            }
            tracing::debug!(user_id = %user_id, amount = amount, balance = current, "Insufficient credits");
            return Ok(false);
        }

        let next = current - amount;
        self.persist(user_id, &mut metadata, next).await?;

        tracing::info!(user_id = %user_id, amount = amount, balance = next, "Credits consumed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryIdentityProvider;
    use serde_json::json;

    fn ledger_with(metadata: serde_json::Value) -> (CreditLedger, Arc<InMemoryIdentityProvider>, UserId) {
        let identity = Arc::new(InMemoryIdentityProvider::new());
        let user = UserId::new();
        identity.add_user(user, Some("user@example.com"), metadata);
        (CreditLedger::new(identity.clone()), identity, user)
    }

    #[test]
    fn test_migration_folds_legacy_once() {
        let mut metadata = UserMetadata::from_value(json!({ "referral_credits": 8 }));
        assert!(migrate_legacy_credits(&mut metadata));
        assert_eq!(metadata.credit_balance, Some(8));
        assert_eq!(metadata.referral_credits, Some(0));
        assert_eq!(metadata.credits_schema_version, Some(CREDITS_SCHEMA_VERSION));

        assert!(!migrate_legacy_credits(&mut metadata));
        assert_eq!(metadata.credit_balance, Some(8));
    }

    #[test]
    fn test_migration_adds_to_existing_balance() {
        let mut metadata =
            UserMetadata::from_value(json!({ "credit_balance": 5, "referral_credits": 10 }));
        assert!(migrate_legacy_credits(&mut metadata));
        assert_eq!(metadata.balance(), 15);
    }

    #[test]
    fn test_migration_without_legacy_only_stamps_version() {
        let mut metadata = UserMetadata::from_value(json!({ "credit_balance": 2 }));
        assert!(!migrate_legacy_credits(&mut metadata));
        assert_eq!(metadata.balance(), 2);
        assert_eq!(metadata.credits_schema_version, Some(CREDITS_SCHEMA_VERSION));
    }

    #[test]
    fn test_whole_credits_validation() {
        assert_eq!(whole_credits(3.9).unwrap(), 3);
        assert!(matches!(whole_credits(0.0), Err(BillingError::InvalidAmount(_))));
        assert!(matches!(whole_credits(-2.0), Err(BillingError::InvalidAmount(_))));
        assert!(matches!(whole_credits(f64::NAN), Err(BillingError::InvalidAmount(_))));
        assert!(matches!(whole_credits(f64::INFINITY), Err(BillingError::InvalidAmount(_))));
        assert!(matches!(whole_credits(0.4), Err(BillingError::InvalidAmount(_))));
    }

    #[test]
    fn test_exact_credits_rejects_fractions() {
        assert_eq!(exact_credits(2.0).unwrap(), 2);
        assert!(matches!(exact_credits(2.7), Err(BillingError::InvalidAmount(_))));
        assert!(matches!(exact_credits(0.0), Err(BillingError::InvalidAmount(_))));
        assert!(matches!(exact_credits(f64::NAN), Err(BillingError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_get_balance_migrates_and_persists() {
        let (ledger, identity, user) = ledger_with(json!({ "referral_credits": 8 }));

        assert_eq!(ledger.get_balance(user).await.unwrap(), 8);
        let stored = identity.metadata(user).unwrap();
        assert_eq!(stored["credit_balance"], 8);
        assert_eq!(stored["referral_credits"], 0);

        assert_eq!(ledger.get_balance(user).await.unwrap(), 8);
        assert_eq!(identity.write_count(), 1);
    }

    #[tokio::test]
    async fn test_get_balance_defaults_to_zero_without_writing() {
        let (ledger, identity, user) = ledger_with(json!({}));
        assert_eq!(ledger.get_balance(user).await.unwrap(), 0);
        assert_eq!(identity.write_count(), 0);
    }

    #[tokio::test]
    async fn test_add_then_consume_restores_balance() {
        let (ledger, _identity, user) = ledger_with(json!({ "credit_balance": 4 }));

        for amount in [1_i64, 3, 10] {
            let before = ledger.get_balance(user).await.unwrap();
            ledger.add_credits(user, amount).await.unwrap();
            assert!(ledger.consume_credits(user, amount).await.unwrap());
            assert_eq!(ledger.get_balance(user).await.unwrap(), before);
        }
    }

    #[tokio::test]
    async fn test_consume_more_than_balance_fails_without_mutation() {
        let (ledger, identity, user) = ledger_with(json!({ "credit_balance": 7 }));
        let writes = identity.write_count();

        assert!(!ledger.consume_credits(user, 8).await.unwrap());
        assert_eq!(ledger.get_balance(user).await.unwrap(), 7);
        assert_eq!(identity.write_count(), writes);
    }

    #[tokio::test]
    async fn test_non_positive_amounts() {
        let (ledger, _identity, user) = ledger_with(json!({ "credit_balance": 7 }));

        assert!(matches!(
            ledger.add_credits(user, 0).await,
            Err(BillingError::InvalidAmount(_))
        ));
        assert!(!ledger.consume_credits(user, 0).await.unwrap());
        assert!(!ledger.consume_credits(user, -3).await.unwrap());
        assert_eq!(ledger.get_balance(user).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_add_preserves_unrelated_metadata() {
        let (ledger, identity, user) = ledger_with(json!({ "full_name": "Grace", "referral_code": "ABC123" }));

        assert_eq!(ledger.add_credits(user, 10).await.unwrap(), 10);
        let stored = identity.metadata(user).unwrap();
        assert_eq!(stored["full_name"], "Grace");
        assert_eq!(stored["referral_code"], "ABC123");
        assert_eq!(stored["credit_balance"], 10);
    }

    #[tokio::test]
    async fn test_unknown_user_propagates_error() {
        let identity = Arc::new(InMemoryIdentityProvider::new());
        let ledger = CreditLedger::new(identity);
        assert!(matches!(
            ledger.get_balance(UserId::new()).await,
            Err(BillingError::UserNotFound(_))
        ));
    }
}
