//! Entitlement guards
//!
//! Call-site checks for gated functionality. Both guards fail open on
//! internal faults (storage down, directory unreachable): a broken billing
//! stack must never take the product down with it. They fail closed only on
//! a definitive verdict, and the denial carries a structured payload the
//! caller can surface as-is.

use uuid::Uuid;

use crate::error::{BillingError, BillingResult, MinutesDenial, SubscriptionDenial};
use crate::ledger::LedgerService;
use crate::usage::UsageService;

pub const MINUTES_LIMIT_CODE: &str = "MONTHLY_MINUTES_LIMIT_EXCEEDED";
pub const NO_SUBSCRIPTION_CODE: &str = "NO_SUBSCRIPTION";
pub const INACTIVE_SUBSCRIPTION_CODE: &str = "INACTIVE_SUBSCRIPTION";

#[derive(Clone)]
pub struct EntitlementGuard {
    usage: UsageService,
    ledger: LedgerService,
}

impl EntitlementGuard {
    pub fn new(usage: UsageService, ledger: LedgerService) -> Self {
        Self { usage, ledger }
    }

    /// Deny when the organization has exhausted its monthly metered
    /// minutes. Internal faults allow the call through with a logged error.
    pub async fn enforce_monthly_minutes(&self, org_id: Uuid) -> BillingResult<()> {
        self.enforce_monthly_minutes_at(org_id, time::OffsetDateTime::now_utc())
            .await
    }

    pub async fn enforce_monthly_minutes_at(
        &self,
        org_id: Uuid,
        now: time::OffsetDateTime,
    ) -> BillingResult<()> {
        let usage = match self.usage.monthly_minutes_usage_at(org_id, now).await {
            Ok(usage) => usage,
            Err(err) => {
                tracing::error!(
                    org_id = %org_id,
                    error = %err,
                    "Usage check failed, allowing call through"
                );
                return Ok(());
            }
        };

        if usage.can_proceed {
            return Ok(());
        }

        tracing::warn!(
            org_id = %org_id,
            current_usage = usage.current_usage,
            monthly_limit = usage.monthly_limit,
            "Monthly minutes limit reached"
        );

        Err(BillingError::MinutesLimitExceeded(Box::new(MinutesDenial {
            message: format!(
                "Monthly limit of {} minutes reached. Your usage resets on {}.",
                usage.monthly_limit,
                usage.reset_date.date()
            ),
            error_code: MINUTES_LIMIT_CODE,
            current_usage: usage.current_usage,
            monthly_limit: usage.monthly_limit,
            usage_percentage: usage.usage_percentage,
            reset_date: usage.reset_date,
            upgrade_required: true,
        })))
    }

    /// Deny when the organization has no entitled (active or trialing)
    /// subscription. Internal faults allow the call through.
    pub async fn require_active_subscription(&self, org_id: Uuid) -> BillingResult<()> {
        let current = match self.ledger.get_current(org_id, None).await {
            Ok(current) => current,
            Err(err) => {
                tracing::error!(
                    org_id = %org_id,
                    error = %err,
                    "Subscription check failed, allowing call through"
                );
                return Ok(());
            }
        };

        match current {
            Some(record) if record.status.is_entitled() => Ok(()),
            Some(record) => Err(BillingError::SubscriptionRequired(Box::new(
                SubscriptionDenial {
                    message: format!(
                        "Subscription is {} and does not grant access",
                        record.status
                    ),
                    error_code: INACTIVE_SUBSCRIPTION_CODE,
                    current_status: Some(record.status),
                    upgrade_required: true,
                },
            ))),
            None => Err(BillingError::SubscriptionRequired(Box::new(
                SubscriptionDenial {
                    message: "An active subscription is required".to_string(),
                    error_code: NO_SUBSCRIPTION_CODE,
                    current_status: None,
                    upgrade_required: true,
                },
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use time::macros::datetime;
    use tollgate_shared::SubscriptionStatus;

    use crate::config::{LedgerConfig, UsageLimitsConfig};
    use crate::ledger::SubscriptionRecord;
    use crate::store::UsageEventStore;
    use crate::memory::{
        InMemoryLedgerStore, InMemoryOrganizationDirectory, InMemoryPlanCatalog,
        InMemoryUsageEventStore,
    };
    use crate::usage::{UsageEvent, UsageEventKind};

    struct Fixture {
        guard: EntitlementGuard,
        events: Arc<InMemoryUsageEventStore>,
        store: Arc<InMemoryLedgerStore>,
        org_id: Uuid,
    }

    fn fixture(register_org: bool) -> Fixture {
        let events = Arc::new(InMemoryUsageEventStore::new());
        let store = Arc::new(InMemoryLedgerStore::new());
        let orgs = Arc::new(InMemoryOrganizationDirectory::new());
        let org_id = Uuid::new_v4();
        if register_org {
            orgs.put(org_id, datetime!(2024-01-15 09:00 UTC));
        }

        let ledger = crate::ledger::LedgerService::new(store.clone(), LedgerConfig::default());
        let usage = UsageService::new(
            events.clone(),
            orgs,
            store.clone(),
            Arc::new(InMemoryPlanCatalog::with_plans(vec![])),
            UsageLimitsConfig::default(),
        );
        Fixture {
            guard: EntitlementGuard::new(usage, ledger),
            events,
            store,
            org_id,
        }
    }

    fn minutes(org: Uuid, quantity: f64, at: time::OffsetDateTime) -> UsageEvent {
        UsageEvent {
            id: Uuid::new_v4(),
            organization_id: org,
            user_id: None,
            kind: UsageEventKind::CallMinutesUsed,
            metadata: serde_json::json!({}),
            quantity,
            created_at: at,
        }
    }

    fn current_record(org: Uuid, status: SubscriptionStatus) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            organization_id: org,
            external_subscription_id: "sub_1".to_string(),
            seats_count: 1,
            status,
            is_current: true,
            version: 1,
            previous_version_id: None,
            created_at: time::OffsetDateTime::now_utc(),
            superseded_at: None,
            change_reason: "created".to_string(),
            change_metadata: serde_json::json!({}),
            is_scheduled_for_cancellation: false,
            scheduled_cancellation_date: None,
            cancellation_reason: None,
            cancellation_feedback: None,
            cancellation_comment: None,
            provider_customer_id: None,
            provider_price_id: None,
            provider_product_id: None,
            provider_payment_method_id: None,
            provider_plan_id: None,
        }
    }

    #[tokio::test]
    async fn under_the_limit_proceeds() {
        let f = fixture(true);
        f.events
            .insert(minutes(f.org_id, 100.0, datetime!(2024-03-16 10:00 UTC)))
            .await
            .unwrap();

        f.guard
            .enforce_monthly_minutes_at(f.org_id, datetime!(2024-03-20 12:00 UTC))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_limit_denies_with_structured_payload() {
        let f = fixture(true);
        f.events
            .insert(minutes(f.org_id, 300.0, datetime!(2024-03-16 10:00 UTC)))
            .await
            .unwrap();

        let err = f
            .guard
            .enforce_monthly_minutes_at(f.org_id, datetime!(2024-03-20 12:00 UTC))
            .await
            .unwrap_err();

        let BillingError::MinutesLimitExceeded(denial) = err else {
            panic!("expected MinutesLimitExceeded");
        };
        assert_eq!(denial.error_code, MINUTES_LIMIT_CODE);
        assert!((denial.current_usage - 300.0).abs() < f64::EPSILON);
        assert_eq!(denial.usage_percentage, 100);
        assert_eq!(denial.reset_date, datetime!(2024-04-15 00:00 UTC));
        assert!(denial.upgrade_required);
    }

    #[tokio::test]
    async fn usage_check_fault_fails_open() {
        // Org not registered in the directory: the usage lookup errors and
        // the guard lets the call through.
        let f = fixture(false);
        f.guard
            .enforce_monthly_minutes_at(f.org_id, datetime!(2024-03-20 12:00 UTC))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_subscription_is_denied() {
        let f = fixture(true);
        let err = f
            .guard
            .require_active_subscription(f.org_id)
            .await
            .unwrap_err();
        let BillingError::SubscriptionRequired(denial) = err else {
            panic!("expected SubscriptionRequired");
        };
        assert_eq!(denial.error_code, NO_SUBSCRIPTION_CODE);
        assert!(denial.current_status.is_none());
    }

    #[tokio::test]
    async fn inactive_subscription_is_denied_with_status() {
        let f = fixture(true);
        f.store
            .seed(current_record(f.org_id, SubscriptionStatus::PastDue))
            .await;

        let err = f
            .guard
            .require_active_subscription(f.org_id)
            .await
            .unwrap_err();
        let BillingError::SubscriptionRequired(denial) = err else {
            panic!("expected SubscriptionRequired");
        };
        assert_eq!(denial.error_code, INACTIVE_SUBSCRIPTION_CODE);
        assert_eq!(denial.current_status, Some(SubscriptionStatus::PastDue));
    }

    #[tokio::test]
    async fn trialing_subscription_grants_access() {
        let f = fixture(true);
        f.store
            .seed(current_record(f.org_id, SubscriptionStatus::Trialing))
            .await;

        f.guard.require_active_subscription(f.org_id).await.unwrap();
    }
}
