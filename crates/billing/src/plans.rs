//! Plan catalog
//!
//! Static mapping from Stripe price IDs to monthly generation quotas. It must be
//! kept in sync by hand with the prices defined in the Stripe dashboard.

use serde::Serialize;

use crate::client::PriceIds;

/// Generations per billing period without a paid plan
pub const FREE_TIER_QUOTA: i32 = 5;
/// Generations per billing period on Basic
pub const BASIC_PLAN_QUOTA: i32 = 50;
/// Generations per billing period on Pro
pub const PRO_PLAN_QUOTA: i32 = 200;

/// Plans a user can be on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Basic,
    Pro,
}

impl Plan {
    pub fn quota(&self) -> i32 {
        match self {
            Plan::Free => FREE_TIER_QUOTA,
            Plan::Basic => BASIC_PLAN_QUOTA,
            Plan::Pro => PRO_PLAN_QUOTA,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Plan::Free => "Free",
            Plan::Basic => "Basic",
            Plan::Pro => "Pro",
        }
    }
}

/// Price → plan lookup table
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    price_ids: PriceIds,
}

impl PlanCatalog {
    pub fn from_price_ids(price_ids: PriceIds) -> Self {
        Self { price_ids }
    }

    pub fn price_ids(&self) -> &PriceIds {
        &self.price_ids
    }

    /// Plan for a price reference; unknown or missing references are the free tier
    pub fn plan_for(&self, price_reference: Option<&str>) -> Plan {
        match price_reference {
            Some(p) if p == self.price_ids.basic => Plan::Basic,
            Some(p) if p == self.price_ids.pro => Plan::Pro,
            _ => Plan::Free,
        }
    }

    /// Quota limit for a price reference. Never fails.
    pub fn resolve_quota_limit(&self, price_reference: Option<&str>) -> i32 {
        self.plan_for(price_reference).quota()
    }

    pub fn is_known_price(&self, price_reference: &str) -> bool {
        self.plan_for(Some(price_reference)) != Plan::Free
    }

    pub fn plan_label(&self, price_reference: Option<&str>) -> &'static str {
        self.plan_for(price_reference).label()
    }

    pub fn price_for(&self, plan: Plan) -> Option<&str> {
        match plan {
            Plan::Free => None,
            Plan::Basic => Some(&self.price_ids.basic),
            Plan::Pro => Some(&self.price_ids.pro),
        }
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::from_price_ids(PriceIds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PlanCatalog {
        PlanCatalog::from_price_ids(PriceIds {
            basic: "price_basic".to_string(),
            pro: "price_pro".to_string(),
        })
    }

    #[test]
    fn test_missing_price_is_free_tier() {
        assert_eq!(catalog().resolve_quota_limit(None), FREE_TIER_QUOTA);
    }

    #[test]
    fn test_unknown_price_is_free_tier() {
        assert_eq!(catalog().resolve_quota_limit(Some("price_legacy")), FREE_TIER_QUOTA);
        assert!(!catalog().is_known_price("price_legacy"));
    }

    #[test]
    fn test_known_prices() {
        let catalog = catalog();
        assert_eq!(catalog.resolve_quota_limit(Some("price_basic")), BASIC_PLAN_QUOTA);
        assert_eq!(catalog.resolve_quota_limit(Some("price_pro")), PRO_PLAN_QUOTA);
        assert_eq!(catalog.plan_label(Some("price_pro")), "Pro");
        assert_eq!(catalog.price_for(Plan::Basic), Some("price_basic"));
        assert_eq!(catalog.price_for(Plan::Free), None);
    }
}
