//! Identity provider access
//!
//! Credit balances and referral flags live in the identity provider's per-user
//! metadata blob. [`UserMetadata`] gives that blob a typed schema while keeping
//! every unknown key intact, so a read-modify-write never drops fields owned by
//! other parts of the product.

use async_trait::async_trait;
use retouch_shared::UserId;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{BillingError, BillingResult};

/// Typed view over a user's metadata blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub credit_balance: Option<i64>,
    /// Superseded by `credit_balance`; folded in once by the credits migration
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub referral_credits: Option<i64>,
    #[serde(default, deserialize_with = "lenient_u32", skip_serializing_if = "Option::is_none")]
    pub credits_schema_version: Option<u32>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub referral_code: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub referred_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub referral_reward_claimed: Option<bool>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub referral_coupon_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub referral_coupon_redeemed: Option<bool>,
    /// Keys this service does not own
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserMetadata {
    /// Parse an arbitrary JSON value; anything that is not an object yields empty metadata
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => serde_json::from_value(value).unwrap_or_default(),
            _ => Self::default(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Object(Map::new()))
    }

    /// Modern balance, clamped to ≥ 0
    pub fn balance(&self) -> i64 {
        self.credit_balance.unwrap_or(0).max(0)
    }

    pub fn has_claimed_referral(&self) -> bool {
        self.referral_reward_claimed == Some(true)
            || self.referred_by.as_deref().is_some_and(|r| !r.is_empty())
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.floor() as i64)),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.floor() as i64),
        _ => None,
    })
}

fn lenient_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    Ok(lenient_i64(d)?.and_then(|v| u32::try_from(v).ok()))
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::Bool(b)) => Some(b),
        _ => None,
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    })
}

/// A user as seen by the identity provider
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub id: UserId,
    pub email: Option<String>,
    pub metadata: UserMetadata,
    /// Provider-controlled metadata (roles granted by operators)
    pub app_metadata: Value,
}

/// Admin access to the identity provider's user records
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn get_user(&self, user_id: UserId) -> BillingResult<UserProfile>;

    /// Replace the user's metadata blob as a whole
    async fn update_metadata(&self, user_id: UserId, metadata: &UserMetadata) -> BillingResult<()>;
}

/// Supabase GoTrue admin API client (service-role key)
#[derive(Clone)]
pub struct SupabaseAdminClient {
    base_url: String,
    service_role_key: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct AdminUser {
    id: String,
    email: Option<String>,
    #[serde(default)]
    user_metadata: Value,
    #[serde(default)]
    app_metadata: Value,
}

impl SupabaseAdminClient {
    pub fn new(base_url: &str, service_role_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key: service_role_key.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn user_url(&self, user_id: UserId) -> String {
        format!("{}/auth/v1/admin/users/{}", self.base_url, user_id)
    }
}

#[async_trait]
impl IdentityProvider for SupabaseAdminClient {
    async fn get_user(&self, user_id: UserId) -> BillingResult<UserProfile> {
        let response = self
            .client
            .get(self.user_url(user_id))
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .send()
            .await
            .map_err(|e| BillingError::IdentityProvider(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(user_id = %user_id, status = %status, body = %body, "Identity provider lookup failed");
            return Err(BillingError::IdentityProvider(format!("get user returned {}", status)));
        }

        let user: AdminUser = response
            .json()
            .await
            .map_err(|e| BillingError::IdentityProvider(format!("invalid user payload: {}", e)))?;

        let id = user.id.parse::<UserId>().unwrap_or(user_id);

        Ok(UserProfile {
            id,
            email: user.email.filter(|e| !e.is_empty()),
            metadata: UserMetadata::from_value(user.user_metadata),
            app_metadata: user.app_metadata,
        })
    }

    async fn update_metadata(&self, user_id: UserId, metadata: &UserMetadata) -> BillingResult<()> {
        let body = serde_json::json!({ "user_metadata": metadata });

        let response = self
            .client
            .put(self.user_url(user_id))
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::IdentityProvider(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(user_id = %user_id, status = %status, body = %body, "Identity provider metadata update failed");
            return Err(BillingError::IdentityProvider(format!(
                "update metadata returned {}",
                status
            )));
        }

        Ok(())
    }
}
