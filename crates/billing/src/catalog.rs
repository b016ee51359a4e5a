//! Plan catalog types and tier inference
//!
//! The catalog itself (CRUD, pricing sync) is an external collaborator;
//! this module only defines the plan shape the core reads and the
//! second-class keyword fallback for inferring a tier from a free-text
//! plan identifier.

use serde::{Deserialize, Serialize};
use tollgate_shared::{BillingCycle, PlanTier};

/// A plan tier definition as read from the pricing catalog.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlanDefinition {
    pub tier: PlanTier,
    pub name: String,
    /// Maximum licensed seats for this tier.
    pub seat_limit: i32,
    /// Monthly metered-minutes allowance per seat.
    pub minutes_per_seat: f64,
    pub provider_product_id: Option<String>,
    pub monthly_price_id: Option<String>,
    pub annual_price_id: Option<String>,
    pub is_active: bool,
}

impl PlanDefinition {
    /// Provider price reference for the given billing cycle, if configured.
    pub fn price_id_for(&self, cycle: BillingCycle) -> Option<&str> {
        match cycle {
            BillingCycle::Monthly => self.monthly_price_id.as_deref(),
            BillingCycle::Yearly => self.annual_price_id.as_deref(),
        }
    }
}

/// Keyword table for the free-text fallback. Checked in order; first
/// substring match wins.
const TIER_KEYWORDS: &[(&str, PlanTier)] = &[
    ("personal", PlanTier::Personal),
    ("business", PlanTier::Business),
    ("company", PlanTier::Company),
    ("custom", PlanTier::Custom),
];

/// Infer a plan tier from a free-text plan identifier.
///
/// This is strictly a fallback for records whose structured product
/// reference no longer resolves in the catalog; the structured lookup is
/// always tried first.
pub fn infer_tier_from_plan_id(plan_id: &str) -> Option<PlanTier> {
    let normalized = plan_id.to_lowercase();
    TIER_KEYWORDS
        .iter()
        .find(|(keyword, _)| normalized.contains(keyword))
        .map(|(_, tier)| *tier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_tier_from_plan_keywords() {
        assert_eq!(
            infer_tier_from_plan_id("business_monthly"),
            Some(PlanTier::Business)
        );
        assert_eq!(
            infer_tier_from_plan_id("Personal Plan v2"),
            Some(PlanTier::Personal)
        );
        assert_eq!(
            infer_tier_from_plan_id("COMPANY_yearly"),
            Some(PlanTier::Company)
        );
        assert_eq!(
            infer_tier_from_plan_id("custom-enterprise-2024"),
            Some(PlanTier::Custom)
        );
    }

    #[test]
    fn unknown_plan_ids_do_not_infer() {
        assert_eq!(infer_tier_from_plan_id("price_1Nxyz"), None);
        assert_eq!(infer_tier_from_plan_id(""), None);
    }

    #[test]
    fn price_id_follows_billing_cycle() {
        let plan = PlanDefinition {
            tier: PlanTier::Business,
            name: "Business".to_string(),
            seat_limit: 50,
            minutes_per_seat: 3_000.0,
            provider_product_id: Some("prod_biz".to_string()),
            monthly_price_id: Some("price_month".to_string()),
            annual_price_id: Some("price_year".to_string()),
            is_active: true,
        };
        assert_eq!(plan.price_id_for(BillingCycle::Monthly), Some("price_month"));
        assert_eq!(plan.price_id_for(BillingCycle::Yearly), Some("price_year"));
    }
}
