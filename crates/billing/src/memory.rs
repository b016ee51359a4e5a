//! In-memory store implementations
//!
//! Mutex-guarded vectors behind the same traits the sqlx implementations
//! satisfy. Used by the test suite and by embedded setups that do not carry
//! a database. Locks are held only for the duration of a synchronous scan,
//! never across an await point.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use tollgate_shared::PlanTier;

use crate::catalog::PlanDefinition;
use crate::error::{BillingError, BillingResult};
use crate::ledger::SubscriptionRecord;
use crate::store::{
    EventDedupStore, OrganizationDirectory, PlanCatalog, SubscriptionStore, UsageEventStore,
};
use crate::usage::{UsageEvent, UsageEventKind};

fn poisoned() -> BillingError {
    BillingError::Database("in-memory store lock poisoned".to_string())
}

// =============================================================================
// Subscription ledger
// =============================================================================

#[derive(Default)]
pub struct InMemoryLedgerStore {
    records: Mutex<Vec<SubscriptionRecord>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record verbatim, bypassing the ledger's versioning. Test
    /// setup only.
    pub async fn seed(&self, record: SubscriptionRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryLedgerStore {
    async fn insert(&self, record: SubscriptionRecord) -> BillingResult<SubscriptionRecord> {
        let mut records = self.records.lock().map_err(|_| poisoned())?;
        records.push(record.clone());
        Ok(record)
    }

    async fn supersede(&self, record_id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        let mut records = self.records.lock().map_err(|_| poisoned())?;
        match records.iter_mut().find(|r| r.id == record_id) {
            Some(record) => {
                record.is_current = false;
                record.superseded_at = Some(at);
                Ok(())
            }
            None => Err(BillingError::NotFound(format!(
                "Subscription record {} not found",
                record_id
            ))),
        }
    }

    async fn current(
        &self,
        org_id: Uuid,
        external_id: Option<&str>,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let records = self.records.lock().map_err(|_| poisoned())?;
        Ok(records
            .iter()
            .filter(|r| {
                r.organization_id == org_id
                    && r.is_current
                    && external_id.map_or(true, |ext| r.external_subscription_id == ext)
            })
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn history(
        &self,
        org_id: Uuid,
        external_id: Option<&str>,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let records = self.records.lock().map_err(|_| poisoned())?;
        let mut out: Vec<SubscriptionRecord> = records
            .iter()
            .filter(|r| {
                r.organization_id == org_id
                    && external_id.map_or(true, |ext| r.external_subscription_id == ext)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.version.cmp(&a.version).then(b.created_at.cmp(&a.created_at)));
        Ok(out)
    }

    async fn latest_by_external_id(
        &self,
        external_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let records = self.records.lock().map_err(|_| poisoned())?;
        Ok(records
            .iter()
            .filter(|r| r.external_subscription_id == external_id)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn created_within(
        &self,
        org_id: Uuid,
        external_id: &str,
        window: Duration,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let cutoff = OffsetDateTime::now_utc() - window;
        let records = self.records.lock().map_err(|_| poisoned())?;
        let mut out: Vec<SubscriptionRecord> = records
            .iter()
            .filter(|r| {
                r.organization_id == org_id
                    && r.external_subscription_id == external_id
                    && r.created_at >= cutoff
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }
}

// =============================================================================
// Usage facts
// =============================================================================

#[derive(Default)]
pub struct InMemoryUsageEventStore {
    events: Mutex<Vec<UsageEvent>>,
}

impl InMemoryUsageEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageEventStore for InMemoryUsageEventStore {
    async fn insert(&self, event: UsageEvent) -> BillingResult<UsageEvent> {
        let mut events = self.events.lock().map_err(|_| poisoned())?;
        events.push(event.clone());
        Ok(event)
    }

    async fn events(
        &self,
        org_id: Uuid,
        kind: Option<UsageEventKind>,
    ) -> BillingResult<Vec<UsageEvent>> {
        let events = self.events.lock().map_err(|_| poisoned())?;
        let mut out: Vec<UsageEvent> = events
            .iter()
            .filter(|e| e.organization_id == org_id && kind.map_or(true, |k| e.kind == k))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn sum_quantity(
        &self,
        org_id: Uuid,
        kind: UsageEventKind,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<f64> {
        let events = self.events.lock().map_err(|_| poisoned())?;
        Ok(events
            .iter()
            .filter(|e| {
                e.organization_id == org_id
                    && e.kind == kind
                    && since.map_or(true, |s| e.created_at >= s)
            })
            .map(|e| e.quantity)
            .sum())
    }

    async fn count(
        &self,
        org_id: Uuid,
        kind: UsageEventKind,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<u64> {
        let events = self.events.lock().map_err(|_| poisoned())?;
        Ok(events
            .iter()
            .filter(|e| {
                e.organization_id == org_id
                    && e.kind == kind
                    && since.map_or(true, |s| e.created_at >= s)
            })
            .count() as u64)
    }
}

// =============================================================================
// Event dedup
// =============================================================================

#[derive(Default)]
pub struct InMemoryEventDedupStore {
    statuses: Mutex<HashMap<String, String>>,
}

impl InMemoryEventDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventDedupStore for InMemoryEventDedupStore {
    async fn claim(&self, event_id: &str, _event_type: &str) -> BillingResult<bool> {
        let mut statuses = self.statuses.lock().map_err(|_| poisoned())?;
        match statuses.get(event_id).map(String::as_str) {
            // Failed deliveries may be reclaimed and retried.
            None | Some("failed") => {
                statuses.insert(event_id.to_string(), "processing".to_string());
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn record_outcome(
        &self,
        event_id: &str,
        outcome: &str,
        _error: Option<&str>,
    ) -> BillingResult<()> {
        let mut statuses = self.statuses.lock().map_err(|_| poisoned())?;
        statuses.insert(event_id.to_string(), outcome.to_string());
        Ok(())
    }
}

// =============================================================================
// Plan catalog
// =============================================================================

#[derive(Default)]
pub struct InMemoryPlanCatalog {
    plans: Vec<PlanDefinition>,
}

impl InMemoryPlanCatalog {
    pub fn with_plans(plans: Vec<PlanDefinition>) -> Self {
        Self { plans }
    }
}

#[async_trait]
impl PlanCatalog for InMemoryPlanCatalog {
    async fn find_by_tier(&self, tier: PlanTier) -> BillingResult<Option<PlanDefinition>> {
        Ok(self.plans.iter().find(|p| p.tier == tier).cloned())
    }

    async fn find_by_product(
        &self,
        provider_product_id: &str,
    ) -> BillingResult<Option<PlanDefinition>> {
        Ok(self
            .plans
            .iter()
            .find(|p| p.provider_product_id.as_deref() == Some(provider_product_id))
            .cloned())
    }

    async fn list_active(&self) -> BillingResult<Vec<PlanDefinition>> {
        let mut out: Vec<PlanDefinition> =
            self.plans.iter().filter(|p| p.is_active).cloned().collect();
        out.sort_by_key(|p| p.seat_limit);
        Ok(out)
    }
}

// =============================================================================
// Organization directory
// =============================================================================

#[derive(Default)]
pub struct InMemoryOrganizationDirectory {
    created: Mutex<HashMap<Uuid, OffsetDateTime>>,
}

impl InMemoryOrganizationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, org_id: Uuid, created_at: OffsetDateTime) {
        if let Ok(mut created) = self.created.lock() {
            created.insert(org_id, created_at);
        }
    }
}

#[async_trait]
impl OrganizationDirectory for InMemoryOrganizationDirectory {
    async fn created_at(&self, org_id: Uuid) -> BillingResult<Option<OffsetDateTime>> {
        let created = self.created.lock().map_err(|_| poisoned())?;
        Ok(created.get(&org_id).copied())
    }
}
