//! Organization identity resolution
//!
//! Provider webhook payloads do not reliably carry the tenant id. A
//! subscription created through checkout has it in the session's client
//! reference; one created through the API may only have it in customer
//! metadata; a bare lifecycle event may carry nothing at all and only the
//! ledger remembers the mapping. Resolution tries each source in order of
//! reliability and stops at the first hit. A failure inside one strategy
//! is logged and falls through to the next; only an unresolvable identity
//! is reported as `None`.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::BillingResult;
use crate::provider::{PaymentProvider, ProviderCheckoutSession, ProviderSubscription};
use crate::store::SubscriptionStore;

/// How many of the customer's recent checkout sessions to inspect.
const CUSTOMER_SESSION_LIMIT: u64 = 10;

/// A resolved tenant identity plus the strategy that produced it, for the
/// reconciliation audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOrg {
    pub org_id: Uuid,
    pub strategy: &'static str,
}

#[derive(Clone)]
pub struct OrgResolver {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn SubscriptionStore>,
}

impl OrgResolver {
    pub fn new(provider: Arc<dyn PaymentProvider>, store: Arc<dyn SubscriptionStore>) -> Self {
        Self { provider, store }
    }

    /// Resolve the owning organization for a provider subscription.
    pub async fn resolve(&self, sub: &ProviderSubscription) -> BillingResult<Option<ResolvedOrg>> {
        if let Some(org_id) = parse_org_id(sub.metadata.get("organization_id"), "subscription metadata") {
            return Ok(Some(ResolvedOrg {
                org_id,
                strategy: "subscription_metadata",
            }));
        }

        match self.from_invoice_chain(sub).await {
            Ok(Some(org_id)) => {
                return Ok(Some(ResolvedOrg {
                    org_id,
                    strategy: "invoice_checkout_session",
                }))
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    error = %err,
                    "Invoice chain lookup failed, trying next strategy"
                );
            }
        }

        match self.from_customer_sessions(sub).await {
            Ok(Some(org_id)) => {
                return Ok(Some(ResolvedOrg {
                    org_id,
                    strategy: "customer_checkout_session",
                }))
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    error = %err,
                    "Customer session lookup failed, trying next strategy"
                );
            }
        }

        match self.from_customer_metadata(sub).await {
            Ok(Some(org_id)) => {
                return Ok(Some(ResolvedOrg {
                    org_id,
                    strategy: "customer_metadata",
                }))
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    error = %err,
                    "Customer metadata lookup failed, trying next strategy"
                );
            }
        }

        match self.store.latest_by_external_id(&sub.id).await {
            Ok(Some(record)) => {
                return Ok(Some(ResolvedOrg {
                    org_id: record.organization_id,
                    strategy: "ledger_history",
                }))
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    error = %err,
                    "Ledger lookup failed"
                );
            }
        }

        tracing::warn!(
            subscription_id = %sub.id,
            customer_id = ?sub.customer_id,
            "Could not resolve organization for subscription"
        );
        Ok(None)
    }

    /// latest invoice -> its payment intent -> checkout sessions opened for
    /// that payment intent.
    async fn from_invoice_chain(
        &self,
        sub: &ProviderSubscription,
    ) -> BillingResult<Option<Uuid>> {
        let Some(invoice_id) = &sub.latest_invoice_id else {
            return Ok(None);
        };
        let invoice = self.provider.invoice(invoice_id).await?;

        if let Some(org_id) =
            parse_org_id(invoice.metadata.get("organization_id"), "invoice metadata")
        {
            return Ok(Some(org_id));
        }

        let Some(payment_intent_id) = &invoice.payment_intent_id else {
            return Ok(None);
        };
        let sessions = self
            .provider
            .checkout_sessions_for_payment_intent(payment_intent_id)
            .await?;
        Ok(sessions.iter().find_map(session_org_id))
    }

    /// The customer's recent checkout sessions, looking for the one that
    /// produced this subscription.
    async fn from_customer_sessions(
        &self,
        sub: &ProviderSubscription,
    ) -> BillingResult<Option<Uuid>> {
        let Some(customer_id) = &sub.customer_id else {
            return Ok(None);
        };
        let sessions = self
            .provider
            .checkout_sessions_for_customer(customer_id, CUSTOMER_SESSION_LIMIT)
            .await?;
        Ok(sessions
            .iter()
            .filter(|s| s.subscription_id.as_deref() == Some(sub.id.as_str()))
            .find_map(session_org_id))
    }

    async fn from_customer_metadata(
        &self,
        sub: &ProviderSubscription,
    ) -> BillingResult<Option<Uuid>> {
        let Some(customer_id) = &sub.customer_id else {
            return Ok(None);
        };
        let customer = self.provider.customer(customer_id).await?;
        Ok(parse_org_id(
            customer.metadata.get("organization_id"),
            "customer metadata",
        ))
    }
}

/// Organization id carried by a checkout session: the client reference
/// takes precedence over session metadata.
pub(crate) fn session_org_id(session: &ProviderCheckoutSession) -> Option<Uuid> {
    parse_org_id(session.client_reference_id.as_ref(), "session client reference")
        .or_else(|| parse_org_id(session.metadata.get("organization_id"), "session metadata"))
}

fn parse_org_id(value: Option<&String>, source: &str) -> Option<Uuid> {
    let raw = value?;
    match raw.parse::<Uuid>() {
        Ok(org_id) => Some(org_id),
        Err(_) => {
            tracing::warn!(value = %raw, source, "Ignoring malformed organization id");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::memory::InMemoryLedgerStore;
    use crate::provider::mock::MockProvider;
    use crate::provider::{CancellationDetails, ProviderCustomer, ProviderInvoice};

    fn provider_sub(id: &str) -> ProviderSubscription {
        ProviderSubscription {
            id: id.to_string(),
            status: "active".to_string(),
            customer_id: Some("cus_1".to_string()),
            latest_invoice_id: None,
            metadata: HashMap::new(),
            cancel_at_period_end: false,
            current_period_end: None,
            canceled_at: None,
            cancellation_details: CancellationDetails::default(),
            price_id: None,
            product_id: None,
            plan_id: None,
            quantity: 1,
            default_payment_method_id: None,
        }
    }

    fn session(id: &str, sub_id: Option<&str>, org: Option<Uuid>) -> ProviderCheckoutSession {
        ProviderCheckoutSession {
            id: id.to_string(),
            client_reference_id: org.map(|o| o.to_string()),
            metadata: HashMap::new(),
            subscription_id: sub_id.map(str::to_string),
            customer_id: Some("cus_1".to_string()),
        }
    }

    fn resolver(provider: Arc<MockProvider>, store: Arc<InMemoryLedgerStore>) -> OrgResolver {
        OrgResolver::new(provider, store)
    }

    #[tokio::test]
    async fn subscription_metadata_wins() {
        let org = Uuid::new_v4();
        let mut sub = provider_sub("sub_1");
        sub.metadata
            .insert("organization_id".to_string(), org.to_string());

        let r = resolver(
            Arc::new(MockProvider::new()),
            Arc::new(InMemoryLedgerStore::new()),
        );
        let resolved = r.resolve(&sub).await.unwrap().unwrap();
        assert_eq!(resolved.org_id, org);
        assert_eq!(resolved.strategy, "subscription_metadata");
    }

    #[tokio::test]
    async fn invoice_payment_intent_session_chain() {
        let org = Uuid::new_v4();
        let provider = Arc::new(MockProvider::new());
        provider.invoices.lock().unwrap().insert(
            "in_1".to_string(),
            ProviderInvoice {
                id: "in_1".to_string(),
                subscription_id: Some("sub_1".to_string()),
                payment_intent_id: Some("pi_1".to_string()),
                metadata: HashMap::new(),
            },
        );
        provider
            .sessions_by_payment_intent
            .lock()
            .unwrap()
            .insert("pi_1".to_string(), vec![session("cs_1", None, Some(org))]);

        let mut sub = provider_sub("sub_1");
        sub.latest_invoice_id = Some("in_1".to_string());

        let r = resolver(provider, Arc::new(InMemoryLedgerStore::new()));
        let resolved = r.resolve(&sub).await.unwrap().unwrap();
        assert_eq!(resolved.org_id, org);
        assert_eq!(resolved.strategy, "invoice_checkout_session");
    }

    #[tokio::test]
    async fn customer_sessions_must_match_the_subscription() {
        let org = Uuid::new_v4();
        let other_org = Uuid::new_v4();
        let provider = Arc::new(MockProvider::new());
        provider.sessions_by_customer.lock().unwrap().insert(
            "cus_1".to_string(),
            vec![
                session("cs_other", Some("sub_other"), Some(other_org)),
                session("cs_match", Some("sub_1"), Some(org)),
            ],
        );

        let r = resolver(provider, Arc::new(InMemoryLedgerStore::new()));
        let resolved = r.resolve(&provider_sub("sub_1")).await.unwrap().unwrap();
        assert_eq!(resolved.org_id, org);
        assert_eq!(resolved.strategy, "customer_checkout_session");
    }

    #[tokio::test]
    async fn customer_metadata_fallback() {
        let org = Uuid::new_v4();
        let provider = Arc::new(MockProvider::new());
        provider.customers.lock().unwrap().insert(
            "cus_1".to_string(),
            ProviderCustomer {
                id: "cus_1".to_string(),
                metadata: HashMap::from([("organization_id".to_string(), org.to_string())]),
            },
        );

        let r = resolver(provider, Arc::new(InMemoryLedgerStore::new()));
        let resolved = r.resolve(&provider_sub("sub_1")).await.unwrap().unwrap();
        assert_eq!(resolved.org_id, org);
        assert_eq!(resolved.strategy, "customer_metadata");
    }

    #[tokio::test]
    async fn ledger_history_is_the_last_resort() {
        let org = Uuid::new_v4();
        let store = Arc::new(InMemoryLedgerStore::new());
        let record = crate::ledger::SubscriptionRecord {
            id: Uuid::new_v4(),
            organization_id: org,
            external_subscription_id: "sub_1".to_string(),
            seats_count: 1,
            status: tollgate_shared::SubscriptionStatus::Active,
            is_current: false,
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
        };
        store.seed(record).await;

        let r = resolver(Arc::new(MockProvider::new()), store);
        let resolved = r.resolve(&provider_sub("sub_1")).await.unwrap().unwrap();
        assert_eq!(resolved.org_id, org);
        assert_eq!(resolved.strategy, "ledger_history");
    }

    #[tokio::test]
    async fn malformed_metadata_falls_through() {
        let org = Uuid::new_v4();
        let provider = Arc::new(MockProvider::new());
        provider.customers.lock().unwrap().insert(
            "cus_1".to_string(),
            ProviderCustomer {
                id: "cus_1".to_string(),
                metadata: HashMap::from([("organization_id".to_string(), org.to_string())]),
            },
        );

        let mut sub = provider_sub("sub_1");
        sub.metadata
            .insert("organization_id".to_string(), "not-a-uuid".to_string());

        let r = resolver(provider, Arc::new(InMemoryLedgerStore::new()));
        let resolved = r.resolve(&sub).await.unwrap().unwrap();
        assert_eq!(resolved.strategy, "customer_metadata");
        assert_eq!(resolved.org_id, org);
    }

    #[tokio::test]
    async fn unresolvable_identity_is_none() {
        let r = resolver(
            Arc::new(MockProvider::new()),
            Arc::new(InMemoryLedgerStore::new()),
        );
        // Customer lookup errors (unknown customer) and ledger is empty.
        assert!(r.resolve(&provider_sub("sub_ghost")).await.unwrap().is_none());
    }
}
