//! Webhook reconciliation
//!
//! Turns provider webhook events into ledger appends. Each event is claimed
//! against the dedup ledger first (the provider redelivers on any non-2xx
//! and sometimes on 2xx too), then dispatched by type. Events whose tenant
//! cannot be resolved are dropped with a warning rather than retried: the
//! provider would redeliver them forever and resolution is not going to
//! start succeeding on its own.

use std::sync::Arc;

use tollgate_shared::SubscriptionStatus;

use crate::error::BillingResult;
use crate::ledger::{LedgerService, NewSubscriptionRecord, SubscriptionRecord};
use crate::provider::{
    BillingEvent, PaymentProvider, ProviderCheckoutSession, ProviderSubscription,
};
use crate::resolve::{session_org_id, OrgResolver, ResolvedOrg};
use crate::store::EventDedupStore;

/// What reconciliation did with an event.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// A ledger record was appended (or an in-window duplicate returned).
    Applied(Box<SubscriptionRecord>),
    /// The event id was already claimed by an earlier delivery.
    Duplicate,
    /// The event type is observed but does not change the ledger.
    Ignored,
    /// No organization could be resolved; the event was dropped.
    Unresolved,
}

pub struct ReconcileEngine {
    ledger: LedgerService,
    provider: Arc<dyn PaymentProvider>,
    resolver: OrgResolver,
    dedup: Arc<dyn EventDedupStore>,
}

impl ReconcileEngine {
    pub fn new(
        ledger: LedgerService,
        provider: Arc<dyn PaymentProvider>,
        dedup: Arc<dyn EventDedupStore>,
    ) -> Self {
        let resolver = OrgResolver::new(provider.clone(), ledger.store().clone());
        Self {
            ledger,
            provider,
            resolver,
            dedup,
        }
    }

    /// Process one webhook event end to end.
    ///
    /// Errors from downstream (provider API, storage) are recorded against
    /// the event and returned; the caller's non-2xx response makes the
    /// provider redeliver, and the dedup claim is what stops a redelivery
    /// of an already-processed event from double-applying.
    pub async fn handle_event(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        if !self.dedup.claim(&event.id, &event.event_type).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Skipping already-processed event"
            );
            return Ok(ReconcileOutcome::Duplicate);
        }

        let result = self.dispatch(event).await;

        match &result {
            // Unresolved events record their own outcome before returning.
            Ok(ReconcileOutcome::Unresolved) => {}
            Ok(_) => {
                self.dedup.record_outcome(&event.id, "processed", None).await?;
            }
            Err(err) => {
                let message = err.to_string();
                self.dedup
                    .record_outcome(&event.id, "failed", Some(&message))
                    .await?;
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %message,
                    "Event processing failed"
                );
            }
        }

        result
    }

    async fn dispatch(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        match event.event_type.as_str() {
            "checkout.session.completed" => self.handle_checkout_completed(event).await,
            "customer.subscription.created" | "customer.subscription.updated" => {
                let sub = ProviderSubscription::from_object(&event.object)?;
                self.apply_subscription(event, &sub, None, false).await
            }
            "customer.subscription.deleted" => {
                let sub = ProviderSubscription::from_object(&event.object)?;
                self.apply_subscription(event, &sub, None, true).await
            }
            "customer.subscription.trial_will_end" => {
                let sub = ProviderSubscription::from_object(&event.object)?;
                tracing::info!(
                    subscription_id = %sub.id,
                    trial_end = ?sub.current_period_end,
                    "Trial ending soon"
                );
                Ok(ReconcileOutcome::Ignored)
            }
            "invoice.payment_failed" => {
                tracing::warn!(
                    event_id = %event.id,
                    "Invoice payment failed; awaiting subsequent subscription status event"
                );
                Ok(ReconcileOutcome::Ignored)
            }
            other => {
                tracing::debug!(event_type = %other, "Unhandled event type");
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    /// Checkout completion carries the tenant id directly on the session;
    /// the subscription itself is fetched from the provider.
    async fn handle_checkout_completed(
        &self,
        event: &BillingEvent,
    ) -> BillingResult<ReconcileOutcome> {
        let session = ProviderCheckoutSession::from_object(&event.object)?;
        let Some(subscription_id) = &session.subscription_id else {
            tracing::info!(
                session_id = %session.id,
                "Checkout session completed without a subscription, nothing to record"
            );
            return Ok(ReconcileOutcome::Ignored);
        };

        let sub = self.provider.subscription(subscription_id).await?;
        let session_org = session_org_id(&session).map(|org_id| ResolvedOrg {
            org_id,
            strategy: "checkout_session",
        });
        self.apply_subscription(event, &sub, session_org, false).await
    }

    async fn apply_subscription(
        &self,
        event: &BillingEvent,
        sub: &ProviderSubscription,
        pre_resolved: Option<ResolvedOrg>,
        deleted: bool,
    ) -> BillingResult<ReconcileOutcome> {
        let resolved = match pre_resolved {
            Some(resolved) => Some(resolved),
            None => self.resolver.resolve(sub).await?,
        };
        let Some(resolved) = resolved else {
            // Dropped on purpose: a redelivery loop would never resolve either.
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                subscription_id = %sub.id,
                "Dropping event for unresolvable organization"
            );
            self.dedup
                .record_outcome(&event.id, "unresolved", None)
                .await?;
            return Ok(ReconcileOutcome::Unresolved);
        };

        let (data, change_reason) = if deleted {
            (deletion_record(resolved.org_id, sub), "subscription_deleted")
        } else {
            (
                lifecycle_record(resolved.org_id, sub),
                match event.event_type.as_str() {
                    "checkout.session.completed" => "checkout_completed",
                    "customer.subscription.created" => "subscription_created",
                    _ => "subscription_updated",
                },
            )
        };

        let metadata = serde_json::json!({
            "event_id": event.id,
            "event_type": event.event_type,
            "resolution_strategy": resolved.strategy,
        });

        let record = self.ledger.append_record(data, change_reason, metadata).await?;
        Ok(ReconcileOutcome::Applied(Box::new(record)))
    }
}

/// Map a provider status string, failing open to Active with a warning so
/// an unrecognized status never locks a paying tenant out.
fn map_provider_status(sub: &ProviderSubscription) -> SubscriptionStatus {
    match SubscriptionStatus::from_provider(&sub.status) {
        Some(status) => status,
        None => {
            tracing::warn!(
                subscription_id = %sub.id,
                provider_status = %sub.status,
                "Unknown provider subscription status, treating as active"
            );
            SubscriptionStatus::Active
        }
    }
}

pub(crate) fn lifecycle_record(
    org_id: uuid::Uuid,
    sub: &ProviderSubscription,
) -> NewSubscriptionRecord {
    let mut status = map_provider_status(sub);

    // A pending cancellation overrides whatever status the provider
    // reported; the scheduled date records when access actually ends.
    let scheduled = sub.cancel_at_period_end;
    if scheduled {
        status = SubscriptionStatus::ScheduledForCancellation;
    }

    NewSubscriptionRecord {
        organization_id: org_id,
        external_subscription_id: sub.id.clone(),
        seats_count: sub.quantity,
        status,
        is_scheduled_for_cancellation: scheduled,
        scheduled_cancellation_date: if scheduled { sub.current_period_end } else { None },
        cancellation_reason: sub.cancellation_details.reason.clone(),
        cancellation_feedback: sub.cancellation_details.feedback.clone(),
        cancellation_comment: sub.cancellation_details.comment.clone(),
        provider_customer_id: sub.customer_id.clone(),
        provider_price_id: sub.price_id.clone(),
        provider_product_id: sub.product_id.clone(),
        provider_payment_method_id: sub.default_payment_method_id.clone(),
        provider_plan_id: sub.plan_id.clone(),
    }
}

/// Terminal deletion: cancelled, seats back to the floor, provider
/// references cleared so nothing downstream keeps calling out for a
/// subscription that no longer exists.
fn deletion_record(org_id: uuid::Uuid, sub: &ProviderSubscription) -> NewSubscriptionRecord {
    NewSubscriptionRecord {
        organization_id: org_id,
        external_subscription_id: sub.id.clone(),
        seats_count: 1,
        status: SubscriptionStatus::Cancelled,
        is_scheduled_for_cancellation: false,
        scheduled_cancellation_date: None,
        cancellation_reason: sub.cancellation_details.reason.clone(),
        cancellation_feedback: sub.cancellation_details.feedback.clone(),
        cancellation_comment: sub.cancellation_details.comment.clone(),
        provider_customer_id: None,
        provider_price_id: None,
        provider_product_id: None,
        provider_payment_method_id: None,
        provider_plan_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use crate::config::LedgerConfig;
    use crate::memory::{InMemoryEventDedupStore, InMemoryLedgerStore};
    use crate::provider::mock::MockProvider;
    use crate::store::SubscriptionStore;

    struct Fixture {
        engine: ReconcileEngine,
        store: Arc<InMemoryLedgerStore>,
        provider: Arc<MockProvider>,
    }

    fn fixture(config: LedgerConfig) -> Fixture {
        let store = Arc::new(InMemoryLedgerStore::new());
        let provider = Arc::new(MockProvider::new());
        let engine = ReconcileEngine::new(
            LedgerService::new(store.clone(), config),
            provider.clone(),
            Arc::new(InMemoryEventDedupStore::new()),
        );
        Fixture {
            engine,
            store,
            provider,
        }
    }

    fn subscription_event(
        event_id: &str,
        event_type: &str,
        sub_id: &str,
        org: Uuid,
        status: &str,
        quantity: i64,
    ) -> BillingEvent {
        BillingEvent {
            id: event_id.to_string(),
            event_type: event_type.to_string(),
            object: serde_json::json!({
                "id": sub_id,
                "status": status,
                "customer": "cus_1",
                "quantity": quantity,
                "metadata": { "organization_id": org.to_string() },
                "items": {
                    "data": [{
                        "price": { "id": "price_1", "product": "prod_1" },
                        "quantity": quantity
                    }]
                }
            }),
        }
    }

    fn applied(outcome: ReconcileOutcome) -> SubscriptionRecord {
        match outcome {
            ReconcileOutcome::Applied(record) => *record,
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn subscription_created_appends_a_record() {
        let f = fixture(LedgerConfig::without_dedup());
        let org = Uuid::new_v4();

        let outcome = f
            .engine
            .handle_event(&subscription_event(
                "evt_1",
                "customer.subscription.created",
                "sub_1",
                org,
                "active",
                3,
            ))
            .await
            .unwrap();

        let record = applied(outcome);
        assert_eq!(record.organization_id, org);
        assert_eq!(record.seats_count, 3);
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.provider_product_id.as_deref(), Some("prod_1"));
        assert_eq!(record.change_reason, "subscription_created");
        assert_eq!(record.change_metadata["resolution_strategy"], "subscription_metadata");
    }

    #[tokio::test]
    async fn redelivered_event_id_is_a_duplicate() {
        let f = fixture(LedgerConfig::without_dedup());
        let org = Uuid::new_v4();
        let event = subscription_event(
            "evt_1",
            "customer.subscription.created",
            "sub_1",
            org,
            "active",
            1,
        );

        applied(f.engine.handle_event(&event).await.unwrap());
        let second = f.engine.handle_event(&event).await.unwrap();
        assert!(matches!(second, ReconcileOutcome::Duplicate));

        let history = f.store.history(org, None).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn deletion_nulls_provider_references_and_resets_seats() {
        let f = fixture(LedgerConfig::without_dedup());
        let org = Uuid::new_v4();

        applied(
            f.engine
                .handle_event(&subscription_event(
                    "evt_1",
                    "customer.subscription.created",
                    "sub_1",
                    org,
                    "active",
                    5,
                ))
                .await
                .unwrap(),
        );

        let mut deleted = subscription_event(
            "evt_2",
            "customer.subscription.deleted",
            "sub_1",
            org,
            "canceled",
            5,
        );
        deleted.object["cancellation_details"] =
            serde_json::json!({ "reason": "cancellation_requested", "feedback": "too_expensive" });

        let record = applied(f.engine.handle_event(&deleted).await.unwrap());
        assert_eq!(record.status, SubscriptionStatus::Cancelled);
        assert_eq!(record.seats_count, 1);
        assert_eq!(record.version, 2);
        assert!(record.provider_customer_id.is_none());
        assert!(record.provider_price_id.is_none());
        assert!(record.provider_product_id.is_none());
        assert_eq!(record.cancellation_reason.as_deref(), Some("cancellation_requested"));
        assert_eq!(record.cancellation_feedback.as_deref(), Some("too_expensive"));
    }

    #[tokio::test]
    async fn pending_cancellation_overrides_active_status() {
        let f = fixture(LedgerConfig::without_dedup());
        let org = Uuid::new_v4();

        let mut event = subscription_event(
            "evt_1",
            "customer.subscription.updated",
            "sub_1",
            org,
            "active",
            2,
        );
        event.object["cancel_at_period_end"] = serde_json::json!(true);
        event.object["current_period_end"] = serde_json::json!(1_700_000_000);

        let record = applied(f.engine.handle_event(&event).await.unwrap());
        assert_eq!(record.status, SubscriptionStatus::ScheduledForCancellation);
        assert!(record.is_scheduled_for_cancellation);
        assert!(record.scheduled_cancellation_date.is_some());
    }

    #[tokio::test]
    async fn unknown_provider_status_fails_open_to_active() {
        let f = fixture(LedgerConfig::without_dedup());
        let org = Uuid::new_v4();

        let record = applied(
            f.engine
                .handle_event(&subscription_event(
                    "evt_1",
                    "customer.subscription.updated",
                    "sub_1",
                    org,
                    "some_future_status",
                    1,
                ))
                .await
                .unwrap(),
        );
        assert_eq!(record.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn unresolvable_event_is_dropped_not_errored() {
        let f = fixture(LedgerConfig::without_dedup());

        let event = BillingEvent {
            id: "evt_1".to_string(),
            event_type: "customer.subscription.updated".to_string(),
            object: serde_json::json!({ "id": "sub_ghost", "status": "active" }),
        };

        let outcome = f.engine.handle_event(&event).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Unresolved));
    }

    #[tokio::test]
    async fn checkout_completed_fetches_subscription_and_uses_session_identity() {
        let f = fixture(LedgerConfig::without_dedup());
        let org = Uuid::new_v4();

        f.provider.put_subscription(crate::provider::ProviderSubscription {
            id: "sub_1".to_string(),
            status: "active".to_string(),
            customer_id: Some("cus_1".to_string()),
            latest_invoice_id: None,
            metadata: Default::default(),
            cancel_at_period_end: false,
            current_period_end: None,
            canceled_at: None,
            cancellation_details: Default::default(),
            price_id: Some("price_1".to_string()),
            product_id: Some("prod_1".to_string()),
            plan_id: None,
            quantity: 4,
            default_payment_method_id: None,
        });

        let event = BillingEvent {
            id: "evt_1".to_string(),
            event_type: "checkout.session.completed".to_string(),
            object: serde_json::json!({
                "id": "cs_1",
                "client_reference_id": org.to_string(),
                "subscription": "sub_1",
                "customer": "cus_1"
            }),
        };

        let record = applied(f.engine.handle_event(&event).await.unwrap());
        assert_eq!(record.organization_id, org);
        assert_eq!(record.seats_count, 4);
        assert_eq!(record.change_reason, "checkout_completed");
        assert_eq!(record.change_metadata["resolution_strategy"], "checkout_session");
    }

    #[tokio::test]
    async fn failed_event_can_be_retried_on_redelivery() {
        let f = fixture(LedgerConfig::without_dedup());
        let org = Uuid::new_v4();

        // Checkout completion referencing a subscription the provider does
        // not know yet: the fetch fails and the event errors out.
        let event = BillingEvent {
            id: "evt_1".to_string(),
            event_type: "checkout.session.completed".to_string(),
            object: serde_json::json!({
                "id": "cs_1",
                "client_reference_id": org.to_string(),
                "subscription": "sub_1",
                "customer": "cus_1"
            }),
        };
        assert!(f.engine.handle_event(&event).await.is_err());

        f.provider.put_subscription(crate::provider::ProviderSubscription {
            id: "sub_1".to_string(),
            status: "active".to_string(),
            customer_id: Some("cus_1".to_string()),
            latest_invoice_id: None,
            metadata: Default::default(),
            cancel_at_period_end: false,
            current_period_end: None,
            canceled_at: None,
            cancellation_details: Default::default(),
            price_id: None,
            product_id: None,
            plan_id: None,
            quantity: 1,
            default_payment_method_id: None,
        });

        // Redelivery of the same event id succeeds now.
        let record = applied(f.engine.handle_event(&event).await.unwrap());
        assert_eq!(record.organization_id, org);
    }

    #[tokio::test]
    async fn observational_events_are_ignored() {
        let f = fixture(LedgerConfig::default());
        let org = Uuid::new_v4();

        let trial = subscription_event(
            "evt_1",
            "customer.subscription.trial_will_end",
            "sub_1",
            org,
            "trialing",
            1,
        );
        assert!(matches!(
            f.engine.handle_event(&trial).await.unwrap(),
            ReconcileOutcome::Ignored
        ));

        let failed = BillingEvent {
            id: "evt_2".to_string(),
            event_type: "invoice.payment_failed".to_string(),
            object: serde_json::json!({ "id": "in_1" }),
        };
        assert!(matches!(
            f.engine.handle_event(&failed).await.unwrap(),
            ReconcileOutcome::Ignored
        ));

        assert!(f.store.history(org, None).await.unwrap().is_empty());
    }
}
