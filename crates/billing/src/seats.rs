//! Seat validation
//!
//! Answers "may this organization move to N seats" against the seat limit
//! of its current plan, without touching the provider. The outcome is a
//! structured verdict rather than an error so callers can render limits and
//! upgrade suggestions directly.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use tollgate_shared::PlanTier;

use crate::catalog::infer_tier_from_plan_id;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerService, SubscriptionRecord};
use crate::store::PlanCatalog;

#[derive(Debug, Clone, Serialize)]
pub struct SeatValidationResult {
    pub is_valid: bool,
    pub current_seats: i32,
    pub requested_seats: i32,
    pub plan_tier: Option<PlanTier>,
    /// `None` only when the request is rejected before the plan is resolved.
    pub seat_limit: Option<i32>,
    pub message: String,
    pub requires_upgrade: bool,
    pub suggested_plan: Option<PlanTier>,
}

/// Current seat occupancy against the plan limit.
#[derive(Debug, Clone, Serialize)]
pub struct SeatUsageSummary {
    pub current_seats: i32,
    pub plan_tier: PlanTier,
    pub seat_limit: i32,
    /// Clamped into 0..=100.
    pub usage_percentage: u32,
}

#[derive(Clone)]
pub struct SeatService {
    ledger: LedgerService,
    catalog: Arc<dyn PlanCatalog>,
}

impl SeatService {
    pub fn new(ledger: LedgerService, catalog: Arc<dyn PlanCatalog>) -> Self {
        Self { ledger, catalog }
    }

    /// Validate a prospective seat count against the organization's current
    /// plan. Requires an entitled subscription.
    pub async fn validate_seat_change(
        &self,
        org_id: Uuid,
        requested_seats: i32,
    ) -> BillingResult<SeatValidationResult> {
        let subscription = self.entitled_subscription(org_id).await?;
        let current_seats = subscription.seats_count;

        if requested_seats < 1 {
            return Ok(SeatValidationResult {
                is_valid: false,
                current_seats,
                requested_seats,
                plan_tier: None,
                seat_limit: None,
                message: "Seat count must be at least 1".to_string(),
                requires_upgrade: false,
                suggested_plan: None,
            });
        }

        let (plan_tier, limit) = self.resolve_plan_limit(&subscription).await?;

        if requested_seats <= limit {
            return Ok(SeatValidationResult {
                is_valid: true,
                current_seats,
                requested_seats,
                plan_tier: Some(plan_tier),
                seat_limit: Some(limit),
                message: format!("{} seats allowed on the current plan", requested_seats),
                requires_upgrade: false,
                suggested_plan: None,
            });
        }

        let suggested_plan = self.suggest_plan(requested_seats).await?;
        Ok(SeatValidationResult {
            is_valid: false,
            current_seats,
            requested_seats,
            plan_tier: Some(plan_tier),
            seat_limit: Some(limit),
            message: format!(
                "Requested {} seats exceeds the plan limit of {}",
                requested_seats, limit
            ),
            requires_upgrade: true,
            suggested_plan,
        })
    }

    /// Validate adding `additional_seats` on top of the current count.
    pub async fn validate_seat_addition(
        &self,
        org_id: Uuid,
        additional_seats: i32,
    ) -> BillingResult<SeatValidationResult> {
        let subscription = self.entitled_subscription(org_id).await?;
        self.validate_seat_change(org_id, subscription.seats_count + additional_seats)
            .await
    }

    /// Plan suggestion when the current seat count no longer fits the plan
    /// limit. `None` when within the limit.
    pub async fn check_upgrade_needed(&self, org_id: Uuid) -> BillingResult<Option<PlanTier>> {
        let subscription = self.entitled_subscription(org_id).await?;
        let (_, limit) = self.resolve_plan_limit(&subscription).await?;
        if subscription.seats_count > limit {
            self.suggest_plan(subscription.seats_count).await
        } else {
            Ok(None)
        }
    }

    /// Seat occupancy for the current subscription.
    pub async fn current_seat_usage(&self, org_id: Uuid) -> BillingResult<SeatUsageSummary> {
        let subscription = self.entitled_subscription(org_id).await?;
        let (plan_tier, limit) = self.resolve_plan_limit(&subscription).await?;
        let usage_percentage = if limit <= 0 {
            100
        } else {
            ((subscription.seats_count as f64 / limit as f64 * 100.0).round() as u32).min(100)
        };
        Ok(SeatUsageSummary {
            current_seats: subscription.seats_count,
            plan_tier,
            seat_limit: limit,
            usage_percentage,
        })
    }

    async fn entitled_subscription(&self, org_id: Uuid) -> BillingResult<SubscriptionRecord> {
        match self.ledger.get_current(org_id, None).await? {
            Some(record) if record.status.is_entitled() => Ok(record),
            _ => Err(BillingError::NotFound(format!(
                "No active subscription for organization {}",
                org_id
            ))),
        }
    }

    /// Tier and seat limit of the subscription's plan. Structured product
    /// lookup first, then the free-text plan id, defaulting to the business
    /// tier. A tier the catalog cannot resolve is a hard error, never an
    /// unlimited grant.
    async fn resolve_plan_limit(
        &self,
        subscription: &SubscriptionRecord,
    ) -> BillingResult<(PlanTier, i32)> {
        if let Some(product_id) = &subscription.provider_product_id {
            if let Some(plan) = self.catalog.find_by_product(product_id).await? {
                return Ok((plan.tier, plan.seat_limit));
            }
        }
        let tier = subscription
            .provider_plan_id
            .as_deref()
            .and_then(infer_tier_from_plan_id)
            .unwrap_or(PlanTier::Business);
        match self.catalog.find_by_tier(tier).await? {
            Some(plan) => Ok((tier, plan.seat_limit)),
            None => Err(BillingError::NotFound(format!(
                "Pricing plan not found for tier: {}",
                tier
            ))),
        }
    }

    /// Smallest active plan that can hold the requested seats.
    async fn suggest_plan(&self, requested_seats: i32) -> BillingResult<Option<PlanTier>> {
        let plans = self.catalog.list_active().await?;
        Ok(plans
            .into_iter()
            .find(|p| p.seat_limit >= requested_seats)
            .map(|p| p.tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;
    use tollgate_shared::SubscriptionStatus;

    use crate::catalog::PlanDefinition;
    use crate::config::LedgerConfig;
    use crate::memory::{InMemoryLedgerStore, InMemoryPlanCatalog};

    fn plan(tier: PlanTier, seat_limit: i32, product: &str) -> PlanDefinition {
        PlanDefinition {
            tier,
            name: tier.to_string(),
            seat_limit,
            minutes_per_seat: 1_500.0,
            provider_product_id: Some(product.to_string()),
            monthly_price_id: Some(format!("price_{}_m", tier)),
            annual_price_id: Some(format!("price_{}_y", tier)),
            is_active: true,
        }
    }

    fn record(org: Uuid, seats: i32, status: SubscriptionStatus, product: &str) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            organization_id: org,
            external_subscription_id: "sub_1".to_string(),
            seats_count: seats,
            status,
            is_current: true,
            version: 1,
            previous_version_id: None,
            created_at: OffsetDateTime::now_utc(),
            superseded_at: None,
            change_reason: "created".to_string(),
            change_metadata: serde_json::json!({}),
            is_scheduled_for_cancellation: false,
            scheduled_cancellation_date: None,
            cancellation_reason: None,
            cancellation_feedback: None,
            cancellation_comment: None,
            provider_customer_id: Some("cus_1".to_string()),
            provider_price_id: None,
            provider_product_id: Some(product.to_string()),
            provider_payment_method_id: None,
            provider_plan_id: None,
        }
    }

    async fn service_with(records: Vec<SubscriptionRecord>) -> SeatService {
        let store = std::sync::Arc::new(InMemoryLedgerStore::new());
        for r in records {
            store.seed(r).await;
        }
        let catalog = Arc::new(InMemoryPlanCatalog::with_plans(vec![
            plan(PlanTier::Personal, 5, "prod_personal"),
            plan(PlanTier::Business, 50, "prod_business"),
            plan(PlanTier::Company, 250, "prod_company"),
        ]));
        SeatService::new(
            LedgerService::new(store, LedgerConfig::without_dedup()),
            catalog,
        )
    }

    #[tokio::test]
    async fn within_limit_is_valid() {
        let org = Uuid::new_v4();
        let service = service_with(vec![record(org, 2, SubscriptionStatus::Active, "prod_personal")]).await;

        let result = service.validate_seat_change(org, 4).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(result.seat_limit, Some(5));
        assert_eq!(result.plan_tier, Some(PlanTier::Personal));
        assert!(!result.requires_upgrade);
    }

    #[tokio::test]
    async fn limit_boundary_is_inclusive() {
        let org = Uuid::new_v4();
        let service = service_with(vec![record(org, 2, SubscriptionStatus::Active, "prod_personal")]).await;

        let result = service.validate_seat_change(org, 5).await.unwrap();
        assert!(result.is_valid);
    }

    #[tokio::test]
    async fn over_limit_suggests_the_smallest_sufficient_plan() {
        let org = Uuid::new_v4();
        let service = service_with(vec![record(org, 2, SubscriptionStatus::Active, "prod_personal")]).await;

        let result = service.validate_seat_change(org, 30).await.unwrap();
        assert!(!result.is_valid);
        assert!(result.requires_upgrade);
        assert_eq!(result.suggested_plan, Some(PlanTier::Business));
    }

    #[tokio::test]
    async fn zero_seats_is_rejected() {
        let org = Uuid::new_v4();
        let service = service_with(vec![record(org, 2, SubscriptionStatus::Active, "prod_personal")]).await;

        let result = service.validate_seat_change(org, 0).await.unwrap();
        assert!(!result.is_valid);
        assert!(!result.requires_upgrade);
    }

    #[tokio::test]
    async fn requires_an_entitled_subscription() {
        let org = Uuid::new_v4();
        let service = service_with(vec![record(org, 2, SubscriptionStatus::Cancelled, "prod_personal")]).await;

        let err = service.validate_seat_change(org, 3).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn addition_validates_against_the_new_total() {
        let org = Uuid::new_v4();
        let service = service_with(vec![record(org, 4, SubscriptionStatus::Active, "prod_personal")]).await;

        let result = service.validate_seat_addition(org, 1).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(result.requested_seats, 5);

        let result = service.validate_seat_addition(org, 2).await.unwrap();
        assert!(!result.is_valid);
        assert!(result.requires_upgrade);
    }

    #[tokio::test]
    async fn upgrade_needed_only_when_over_the_limit() {
        let org = Uuid::new_v4();
        let service = service_with(vec![record(org, 3, SubscriptionStatus::Active, "prod_personal")]).await;
        assert_eq!(service.check_upgrade_needed(org).await.unwrap(), None);

        let over = Uuid::new_v4();
        let service = service_with(vec![record(over, 8, SubscriptionStatus::Active, "prod_personal")]).await;
        assert_eq!(
            service.check_upgrade_needed(over).await.unwrap(),
            Some(PlanTier::Business)
        );
    }

    #[tokio::test]
    async fn seat_usage_reports_percentage_of_limit() {
        let org = Uuid::new_v4();
        let service = service_with(vec![record(org, 25, SubscriptionStatus::Active, "prod_business")]).await;

        let usage = service.current_seat_usage(org).await.unwrap();
        assert_eq!(usage.current_seats, 25);
        assert_eq!(usage.seat_limit, 50);
        assert_eq!(usage.usage_percentage, 50);
        assert_eq!(usage.plan_tier, PlanTier::Business);
    }

    #[tokio::test]
    async fn unmapped_product_falls_back_to_the_business_plan() {
        let org = Uuid::new_v4();
        let service = service_with(vec![record(org, 2, SubscriptionStatus::Active, "prod_retired")]).await;

        let result = service.validate_seat_change(org, 30).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(result.plan_tier, Some(PlanTier::Business));
        assert_eq!(result.seat_limit, Some(50));
    }

    #[tokio::test]
    async fn unresolvable_plan_is_not_found() {
        let org = Uuid::new_v4();
        let mut rec = record(org, 2, SubscriptionStatus::Active, "prod_retired");
        rec.provider_plan_id = Some("custom_enterprise".to_string());
        let service = service_with(vec![rec]).await;

        let err = service
            .validate_seat_change(org, 1_000_000)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}
