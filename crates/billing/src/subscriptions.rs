//! Seat and plan updates
//!
//! The one write path that goes out to the payment provider instead of
//! reacting to it: move an organization to a new (tier, seats, cycle)
//! combination. Validation happens against the local catalog before any
//! provider call; the ledger is appended exactly once per successful
//! change, whether the provider subscription was updated in place or had
//! to be replaced.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use tollgate_shared::{BillingCycle, PlanTier};

use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerService, SubscriptionRecord};
use crate::provider::{PaymentProvider, ProviderSubscription, SubscriptionUpdate};
use crate::reconcile::lifecycle_record;
use crate::store::PlanCatalog;

#[derive(Clone)]
pub struct SubscriptionService {
    ledger: LedgerService,
    provider: Arc<dyn PaymentProvider>,
    catalog: Arc<dyn PlanCatalog>,
}

impl SubscriptionService {
    pub fn new(
        ledger: LedgerService,
        provider: Arc<dyn PaymentProvider>,
        catalog: Arc<dyn PlanCatalog>,
    ) -> Self {
        Self {
            ledger,
            provider,
            catalog,
        }
    }

    /// Move the organization's subscription to (tier, seats, cycle).
    ///
    /// Validation order: billing cycle, plan existence, plan active, price
    /// configured, seat limit. Only then is the provider touched. If the
    /// provider refuses the in-place update with an error that can never
    /// succeed on retry (the subscription is expired or otherwise frozen),
    /// a fresh subscription is created under the same customer and recorded
    /// as a replacement.
    pub async fn update_seats_and_plan(
        &self,
        org_id: Uuid,
        tier: PlanTier,
        seats: i32,
        billing_cycle: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let cycle = BillingCycle::normalize(billing_cycle)
            .ok_or_else(|| BillingError::InvalidBillingCycle(billing_cycle.to_string()))?;

        let plan = self
            .catalog
            .find_by_tier(tier)
            .await?
            .ok_or_else(|| BillingError::InvalidTier(tier.to_string()))?;
        if !plan.is_active {
            return Err(BillingError::PlanInactive(tier));
        }
        let price_id = plan.price_id_for(cycle).map(str::to_owned).ok_or_else(|| {
            BillingError::NotFound(format!("No {} price configured for the {} plan", cycle, tier))
        })?;

        if seats < 1 || seats > plan.seat_limit {
            return Err(BillingError::SeatLimitExceeded {
                requested: seats,
                limit: plan.seat_limit,
                tier,
            });
        }

        let current = self.ledger.get_current(org_id, None).await?.ok_or_else(|| {
            BillingError::NotFound(format!("No subscription for organization {}", org_id))
        })?;

        let update = SubscriptionUpdate {
            price_id: Some(price_id.clone()),
            quantity: Some(seats as u64),
            metadata: Some(HashMap::from([(
                "organization_id".to_string(),
                org_id.to_string(),
            )])),
        };

        match self
            .provider
            .update_subscription(&current.external_subscription_id, update)
            .await
        {
            Ok(updated) => {
                tracing::info!(
                    org_id = %org_id,
                    subscription_id = %updated.id,
                    tier = %tier,
                    seats,
                    cycle = %cycle,
                    "Provider subscription updated"
                );
                self.record_change(org_id, &updated, tier, cycle, "seats_plan_updated", None)
                    .await
            }
            Err(err) if err.is_unrecoverable_update() => {
                tracing::warn!(
                    org_id = %org_id,
                    subscription_id = %current.external_subscription_id,
                    error = %err,
                    "Subscription cannot be updated in place, creating a replacement"
                );
                self.replace_subscription(org_id, &current, &price_id, seats, tier, cycle, err)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn replace_subscription(
        &self,
        org_id: Uuid,
        current: &SubscriptionRecord,
        price_id: &str,
        seats: i32,
        tier: PlanTier,
        cycle: BillingCycle,
        update_error: BillingError,
    ) -> BillingResult<SubscriptionRecord> {
        let customer_id = current.provider_customer_id.as_deref().ok_or_else(|| {
            BillingError::Provider(format!(
                "Cannot replace subscription {}: no provider customer on record",
                current.external_subscription_id
            ))
        })?;

        let replacement = self
            .provider
            .create_subscription(
                customer_id,
                price_id,
                seats as u64,
                HashMap::from([("organization_id".to_string(), org_id.to_string())]),
            )
            .await?;

        tracing::info!(
            org_id = %org_id,
            old_subscription_id = %current.external_subscription_id,
            new_subscription_id = %replacement.id,
            "Replacement subscription created"
        );

        self.record_change(
            org_id,
            &replacement,
            tier,
            cycle,
            "subscription_replaced",
            Some(serde_json::json!({
                "replaced_subscription_id": current.external_subscription_id,
                "provider_error": update_error.to_string(),
            })),
        )
        .await
    }

    async fn record_change(
        &self,
        org_id: Uuid,
        sub: &ProviderSubscription,
        tier: PlanTier,
        cycle: BillingCycle,
        change_reason: &str,
        extra: Option<serde_json::Value>,
    ) -> BillingResult<SubscriptionRecord> {
        let mut metadata = serde_json::json!({
            "tier": tier.to_string(),
            "billing_cycle": cycle.to_string(),
        });
        if let (Some(obj), Some(serde_json::Value::Object(extra))) =
            (metadata.as_object_mut(), extra)
        {
            obj.extend(extra);
        }

        self.ledger
            .append_record(lifecycle_record(org_id, sub), change_reason, metadata)
            .await
    }
}
