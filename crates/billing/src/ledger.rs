//! Append-only subscription ledger
//!
//! Every subscription state change lands as a new immutable record; the
//! previous current record is only ever touched to flip `is_current` and
//! stamp `superseded_at`. Versions along a (organization, external
//! subscription) chain increase strictly by 1 and `previous_version_id`
//! links each record to its immediate predecessor, so the chain is a total
//! order equal to creation order. Nothing is ever deleted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use tollgate_shared::SubscriptionStatus;

use crate::config::LedgerConfig;
use crate::error::BillingResult;
use crate::store::SubscriptionStore;

/// One immutable snapshot of a subscription's state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub external_subscription_id: String,
    pub seats_count: i32,
    pub status: SubscriptionStatus,
    pub is_current: bool,
    /// Strictly increasing, starting at 1 for the first record of a chain.
    pub version: i32,
    pub previous_version_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub superseded_at: Option<OffsetDateTime>,
    pub change_reason: String,
    pub change_metadata: serde_json::Value,
    pub is_scheduled_for_cancellation: bool,
    pub scheduled_cancellation_date: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    pub cancellation_feedback: Option<String>,
    pub cancellation_comment: Option<String>,
    // Provider-specific identifiers, all nulled on terminal deletion.
    pub provider_customer_id: Option<String>,
    pub provider_price_id: Option<String>,
    pub provider_product_id: Option<String>,
    pub provider_payment_method_id: Option<String>,
    /// Free-text plan identifier, kept for the tier-inference fallback.
    pub provider_plan_id: Option<String>,
}

/// Payload for a new ledger record. Versioning, currency flags, and
/// timestamps are assigned by the ledger, never by the caller.
#[derive(Debug, Clone, Default)]
pub struct NewSubscriptionRecord {
    pub organization_id: Uuid,
    pub external_subscription_id: String,
    pub seats_count: i32,
    pub status: SubscriptionStatus,
    pub is_scheduled_for_cancellation: bool,
    pub scheduled_cancellation_date: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    pub cancellation_feedback: Option<String>,
    pub cancellation_comment: Option<String>,
    pub provider_customer_id: Option<String>,
    pub provider_price_id: Option<String>,
    pub provider_product_id: Option<String>,
    pub provider_payment_method_id: Option<String>,
    pub provider_plan_id: Option<String>,
}

/// A changed field between two consecutive ledger versions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange<T> {
    pub from: T,
    pub to: T,
}

/// Diffs between two consecutive versions of a subscription chain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubscriptionChanges {
    pub status: Option<FieldChange<SubscriptionStatus>>,
    pub seats_count: Option<FieldChange<i32>>,
    pub is_scheduled_for_cancellation: Option<FieldChange<bool>>,
}

impl SubscriptionChanges {
    pub fn between(previous: &SubscriptionRecord, current: &SubscriptionRecord) -> Self {
        let mut changes = Self::default();
        if previous.status != current.status {
            changes.status = Some(FieldChange {
                from: previous.status,
                to: current.status,
            });
        }
        if previous.seats_count != current.seats_count {
            changes.seats_count = Some(FieldChange {
                from: previous.seats_count,
                to: current.seats_count,
            });
        }
        if previous.is_scheduled_for_cancellation != current.is_scheduled_for_cancellation {
            changes.is_scheduled_for_cancellation = Some(FieldChange {
                from: previous.is_scheduled_for_cancellation,
                to: current.is_scheduled_for_cancellation,
            });
        }
        changes
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.seats_count.is_none()
            && self.is_scheduled_for_cancellation.is_none()
    }
}

/// One timeline entry: a record in creation order plus its diff against the
/// immediately preceding record of the organization.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub date: OffsetDateTime,
    pub event: String,
    pub record: SubscriptionRecord,
    pub changes: Option<SubscriptionChanges>,
}

/// Aggregate counts over an organization's full subscription history.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineSummary {
    pub total_records: usize,
    /// Distinct external subscription ids seen across all versions.
    pub distinct_subscriptions: usize,
    pub active_subscriptions: usize,
    pub cancelled_subscriptions: usize,
    pub scheduled_for_cancellation: usize,
    /// cancelled / distinct x 100, rounded to two decimals.
    pub churn_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionTimeline {
    pub entries: Vec<TimelineEntry>,
    pub summary: TimelineSummary,
}

/// The append-only subscription ledger.
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn SubscriptionStore>,
    config: LedgerConfig,
}

impl LedgerService {
    pub fn new(store: Arc<dyn SubscriptionStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    /// Append a new record for (org, external subscription), superseding the
    /// current one if present.
    ///
    /// Duplicate-delivery heuristic: if any record for this key was created
    /// within the configured concurrent window, this call is treated as a
    /// re-delivery of the same logical event and the most recent record is
    /// returned without writing. This is a best-effort guard, not a
    /// transactional idempotency key; reconciliation additionally dedups on
    /// the provider's event id before ever reaching this point.
    pub async fn append_record(
        &self,
        data: NewSubscriptionRecord,
        change_reason: &str,
        change_metadata: serde_json::Value,
    ) -> BillingResult<SubscriptionRecord> {
        let org_id = data.organization_id;
        let external_id = data.external_subscription_id.clone();

        if !self.config.concurrent_window.is_zero() {
            let concurrent = self
                .store
                .created_within(org_id, &external_id, self.config.concurrent_window)
                .await?;
            if let Some(duplicate) = concurrent.first() {
                tracing::info!(
                    org_id = %org_id,
                    external_subscription_id = %external_id,
                    duplicate_of = %duplicate.id,
                    window_ms = self.config.concurrent_window.as_millis() as u64,
                    "Concurrent duplicate append detected, returning existing record"
                );
                return Ok(duplicate.clone());
            }
        }

        if self.config.recent_window > self.config.concurrent_window {
            let recent = self
                .store
                .created_within(org_id, &external_id, self.config.recent_window)
                .await?;
            if !recent.is_empty() {
                tracing::debug!(
                    org_id = %org_id,
                    external_subscription_id = %external_id,
                    recent_count = recent.len(),
                    "Recent records exist for key inside the observation window"
                );
            }
        }

        let current = self.store.current(org_id, Some(&external_id)).await?;
        let now = OffsetDateTime::now_utc();

        let (version, previous_version_id) = match &current {
            Some(prior) => (prior.version + 1, Some(prior.id)),
            None => (1, None),
        };

        if let Some(prior) = &current {
            self.store.supersede(prior.id, now).await?;
            tracing::info!(
                org_id = %org_id,
                superseded = %prior.id,
                prior_version = prior.version,
                new_version = version,
                "Superseding current subscription record"
            );
        }

        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            organization_id: org_id,
            external_subscription_id: data.external_subscription_id,
            seats_count: data.seats_count,
            status: data.status,
            is_current: true,
            version,
            previous_version_id,
            created_at: now,
            superseded_at: None,
            change_reason: change_reason.to_string(),
            change_metadata,
            is_scheduled_for_cancellation: data.is_scheduled_for_cancellation,
            scheduled_cancellation_date: data.scheduled_cancellation_date,
            cancellation_reason: data.cancellation_reason,
            cancellation_feedback: data.cancellation_feedback,
            cancellation_comment: data.cancellation_comment,
            provider_customer_id: data.provider_customer_id,
            provider_price_id: data.provider_price_id,
            provider_product_id: data.provider_product_id,
            provider_payment_method_id: data.provider_payment_method_id,
            provider_plan_id: data.provider_plan_id,
        };

        let saved = self.store.insert(record).await?;

        tracing::info!(
            org_id = %org_id,
            record_id = %saved.id,
            version = saved.version,
            status = %saved.status,
            "Subscription record created"
        );

        Ok(saved)
    }

    /// Current record for an organization, optionally narrowed to one
    /// external subscription id.
    pub async fn get_current(
        &self,
        org_id: Uuid,
        external_id: Option<&str>,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.current(org_id, external_id).await
    }

    /// Full history, newest version first.
    pub async fn get_history(
        &self,
        org_id: Uuid,
        external_id: Option<&str>,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        self.store.history(org_id, external_id).await
    }

    /// Timeline in creation order with per-step field diffs and aggregate
    /// counts over the organization's whole history.
    pub async fn get_timeline(&self, org_id: Uuid) -> BillingResult<SubscriptionTimeline> {
        let mut records = self.store.history(org_id, None).await?;
        records.sort_by_key(|r| r.created_at);

        let mut entries = Vec::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            let changes = if idx > 0 {
                Some(SubscriptionChanges::between(&records[idx - 1], record))
            } else {
                None
            };
            entries.push(TimelineEntry {
                date: record.created_at,
                event: if record.change_reason.is_empty() {
                    "Record created".to_string()
                } else {
                    record.change_reason.clone()
                },
                record: record.clone(),
                changes,
            });
        }

        let distinct: std::collections::HashSet<&str> = records
            .iter()
            .map(|r| r.external_subscription_id.as_str())
            .collect();
        let current: Vec<&SubscriptionRecord> = records.iter().filter(|r| r.is_current).collect();
        let active = current
            .iter()
            .filter(|r| r.status == SubscriptionStatus::Active)
            .count();
        let cancelled = current
            .iter()
            .filter(|r| r.status == SubscriptionStatus::Cancelled)
            .count();
        let scheduled = current
            .iter()
            .filter(|r| r.is_scheduled_for_cancellation)
            .count();
        let churn_rate = if distinct.is_empty() {
            0.0
        } else {
            let raw = cancelled as f64 / distinct.len() as f64 * 100.0;
            (raw * 100.0).round() / 100.0
        };

        Ok(SubscriptionTimeline {
            summary: TimelineSummary {
                total_records: records.len(),
                distinct_subscriptions: distinct.len(),
                active_subscriptions: active,
                cancelled_subscriptions: cancelled,
                scheduled_for_cancellation: scheduled,
                churn_rate,
            },
            entries,
        })
    }
}
