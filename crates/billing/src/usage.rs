//! Usage accounting
//!
//! Append-only usage facts plus derived-on-read aggregates. Nothing is
//! pre-aggregated or cached: every read scans the relevant window, which
//! keeps resets purely logical (an audit fact, never a deletion) and makes
//! invalidation a non-problem.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use tollgate_shared::{PlanTier, SubscriptionStatus};

use crate::catalog::infer_tier_from_plan_id;
use crate::config::UsageLimitsConfig;
use crate::cycle::cycle_bounds;
use crate::error::{BillingError, BillingResult};
use crate::store::{OrganizationDirectory, PlanCatalog, SubscriptionStore, UsageEventStore};

/// Kinds of usage facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UsageEventKind {
    CallMinutesUsed,
    SeatAdded,
    SeatRemoved,
    /// Audit marker for a logical usage reset; carries the pre-reset usage
    /// in its metadata and is never counted as metered consumption.
    MonthlyMinutesReset,
}

impl std::fmt::Display for UsageEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CallMinutesUsed => "call_minutes_used",
            Self::SeatAdded => "seat_added",
            Self::SeatRemoved => "seat_removed",
            Self::MonthlyMinutesReset => "monthly_minutes_reset",
        };
        write!(f, "{}", s)
    }
}

/// One append-only usage fact. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageEvent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub kind: UsageEventKind,
    pub metadata: serde_json::Value,
    pub quantity: f64,
    pub created_at: OffsetDateTime,
}

/// Answer to "how much of the monthly metered allowance has this tenant
/// consumed", computed live against the tenant's anchored cycle.
#[derive(Debug, Clone, Serialize)]
pub struct MonthlyMinutesUsage {
    pub current_usage: f64,
    pub monthly_limit: f64,
    /// Clamped into 0..=100 even when usage exceeds the limit.
    pub usage_percentage: u32,
    /// Strict inequality: usage exactly at the limit no longer proceeds.
    pub can_proceed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_date: OffsetDateTime,
    /// `None` when the plan tier could not be resolved.
    pub plan_tier: Option<PlanTier>,
    pub seat_count: i32,
}

/// Aggregate usage across fact kinds since an optional lower bound.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub call_minutes: f64,
    /// Seats added minus seats removed.
    pub net_seats: i64,
    pub resets: u64,
}

/// Outcome of a logical monthly reset.
#[derive(Debug, Clone, Serialize)]
pub struct ResetOutcome {
    pub organization_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_date: OffsetDateTime,
    pub reason: String,
    pub previous_usage: f64,
}

/// One historical reset, reconstructed from the audit facts.
#[derive(Debug, Clone, Serialize)]
pub struct ResetHistoryEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub reset_date: OffsetDateTime,
    pub reason: String,
    pub previous_usage: f64,
    pub reset_by: Option<Uuid>,
}

#[derive(Clone)]
pub struct UsageService {
    events: Arc<dyn UsageEventStore>,
    orgs: Arc<dyn OrganizationDirectory>,
    subscriptions: Arc<dyn SubscriptionStore>,
    catalog: Arc<dyn PlanCatalog>,
    limits: UsageLimitsConfig,
}

impl UsageService {
    pub fn new(
        events: Arc<dyn UsageEventStore>,
        orgs: Arc<dyn OrganizationDirectory>,
        subscriptions: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn PlanCatalog>,
        limits: UsageLimitsConfig,
    ) -> Self {
        Self {
            events,
            orgs,
            subscriptions,
            catalog,
            limits,
        }
    }

    /// Append a usage fact.
    pub async fn log_event(
        &self,
        org_id: Uuid,
        kind: UsageEventKind,
        user_id: Option<Uuid>,
        metadata: serde_json::Value,
        quantity: f64,
    ) -> BillingResult<UsageEvent> {
        let event = UsageEvent {
            id: Uuid::new_v4(),
            organization_id: org_id,
            user_id,
            kind,
            metadata,
            quantity,
            created_at: OffsetDateTime::now_utc(),
        };
        self.events.insert(event).await
    }

    /// Record metered call minutes (e.g. when a meeting completes).
    pub async fn track_call_minutes(
        &self,
        org_id: Uuid,
        user_id: Option<Uuid>,
        minutes: f64,
    ) -> BillingResult<UsageEvent> {
        self.log_event(
            org_id,
            UsageEventKind::CallMinutesUsed,
            user_id,
            serde_json::json!({ "meeting_duration_minutes": minutes }),
            minutes,
        )
        .await
    }

    pub async fn track_seat_added(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        new_seat_count: i32,
    ) -> BillingResult<UsageEvent> {
        self.log_event(
            org_id,
            UsageEventKind::SeatAdded,
            Some(user_id),
            serde_json::json!({ "new_seat_count": new_seat_count }),
            1.0,
        )
        .await
    }

    pub async fn track_seat_removed(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        new_seat_count: i32,
    ) -> BillingResult<UsageEvent> {
        self.log_event(
            org_id,
            UsageEventKind::SeatRemoved,
            Some(user_id),
            serde_json::json!({ "new_seat_count": new_seat_count }),
            1.0,
        )
        .await
    }

    /// Metered minutes consumed since `since` (all-time when `None`).
    pub async fn minutes_used_since(
        &self,
        org_id: Uuid,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<f64> {
        self.events
            .sum_quantity(org_id, UsageEventKind::CallMinutesUsed, since)
            .await
    }

    /// Summary across fact kinds; seats are net (added minus removed).
    pub async fn usage_summary(
        &self,
        org_id: Uuid,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<UsageSummary> {
        let call_minutes = self
            .events
            .sum_quantity(org_id, UsageEventKind::CallMinutesUsed, since)
            .await?;
        let added = self
            .events
            .count(org_id, UsageEventKind::SeatAdded, since)
            .await?;
        let removed = self
            .events
            .count(org_id, UsageEventKind::SeatRemoved, since)
            .await?;
        let resets = self
            .events
            .count(org_id, UsageEventKind::MonthlyMinutesReset, since)
            .await?;
        Ok(UsageSummary {
            call_minutes,
            net_seats: added as i64 - removed as i64,
            resets,
        })
    }

    /// Monthly metered usage against the tenant's anchored cycle, evaluated
    /// at the current instant.
    pub async fn monthly_minutes_usage(&self, org_id: Uuid) -> BillingResult<MonthlyMinutesUsage> {
        self.monthly_minutes_usage_at(org_id, OffsetDateTime::now_utc())
            .await
    }

    /// Same as [`monthly_minutes_usage`](Self::monthly_minutes_usage) with an
    /// explicit evaluation instant.
    pub async fn monthly_minutes_usage_at(
        &self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<MonthlyMinutesUsage> {
        let created_at = self
            .orgs
            .created_at(org_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Organization {} not found", org_id)))?;

        let (cycle_start, reset_date) = cycle_bounds(created_at, now);

        let subscription = self.subscriptions.current(org_id, None).await?;

        let (plan_tier, monthly_limit, seat_count) = match &subscription {
            None => (
                Some(PlanTier::Free),
                self.limits.free_trial_monthly_minutes,
                self.limits.free_trial_seat_count,
            ),
            // Trials get the free allowance regardless of the attached plan.
            Some(sub) if sub.status == SubscriptionStatus::Trialing => (
                Some(PlanTier::Free),
                self.limits.free_trial_monthly_minutes,
                self.limits.free_trial_seat_count,
            ),
            Some(sub) => self.resolve_paid_limits(sub).await?,
        };

        let current_usage = self
            .events
            .sum_quantity(org_id, UsageEventKind::CallMinutesUsed, Some(cycle_start))
            .await?;

        let usage_percentage = if monthly_limit > 0.0 {
            ((current_usage / monthly_limit * 100.0).round() as u32).min(100)
        } else {
            100
        };
        let can_proceed = current_usage < monthly_limit;

        tracing::debug!(
            org_id = %org_id,
            plan_tier = ?plan_tier,
            seat_count,
            monthly_limit,
            current_usage,
            cycle_start = %cycle_start,
            reset_date = %reset_date,
            "Computed monthly minutes usage"
        );

        Ok(MonthlyMinutesUsage {
            current_usage,
            monthly_limit,
            usage_percentage,
            can_proceed,
            cycle_start,
            reset_date,
            plan_tier,
            seat_count,
        })
    }

    /// Limit resolution for a non-trial subscription: structured product
    /// lookup first, keyword inference from the free-text plan id second,
    /// configured defaults last.
    async fn resolve_paid_limits(
        &self,
        sub: &crate::ledger::SubscriptionRecord,
    ) -> BillingResult<(Option<PlanTier>, f64, i32)> {
        if let Some(product_id) = &sub.provider_product_id {
            if let Some(plan) = self.catalog.find_by_product(product_id).await? {
                let seats = sub.seats_count;
                return Ok((Some(plan.tier), plan.minutes_per_seat * seats as f64, seats));
            }
            tracing::warn!(
                org_id = %sub.organization_id,
                provider_product_id = %product_id,
                "Product reference did not resolve to a plan, trying plan-id inference"
            );
        }

        if let Some(plan_id) = &sub.provider_plan_id {
            if let Some(tier) = infer_tier_from_plan_id(plan_id) {
                let seats = sub.seats_count;
                tracing::warn!(
                    org_id = %sub.organization_id,
                    provider_plan_id = %plan_id,
                    tier = %tier,
                    "Plan tier inferred from free-text plan identifier"
                );
                return Ok((
                    Some(tier),
                    self.limits.minutes_per_seat(tier) * seats as f64,
                    seats,
                ));
            }
        }

        Ok((
            None,
            self.limits.default_monthly_minutes,
            self.limits.default_seat_count,
        ))
    }

    /// Logical reset: writes an audit fact carrying the pre-reset usage.
    /// No facts are deleted; subsequent reads stay correct because the
    /// window formula ignores the audit fact.
    pub async fn reset_monthly_minutes(
        &self,
        org_id: Uuid,
        reason: &str,
        reset_by: Option<Uuid>,
    ) -> BillingResult<ResetOutcome> {
        self.reset_monthly_minutes_at(org_id, reason, reset_by, OffsetDateTime::now_utc())
            .await
    }

    /// [`reset_monthly_minutes`](Self::reset_monthly_minutes) against an
    /// explicit instant.
    pub async fn reset_monthly_minutes_at(
        &self,
        org_id: Uuid,
        reason: &str,
        reset_by: Option<Uuid>,
        now: OffsetDateTime,
    ) -> BillingResult<ResetOutcome> {
        let previous_usage = match self.orgs.created_at(org_id).await? {
            Some(created_at) => {
                let (cycle_start, _) = cycle_bounds(created_at, now);
                self.events
                    .sum_quantity(org_id, UsageEventKind::CallMinutesUsed, Some(cycle_start))
                    .await?
            }
            None => {
                self.events
                    .sum_quantity(org_id, UsageEventKind::CallMinutesUsed, None)
                    .await?
            }
        };

        self.log_event(
            org_id,
            UsageEventKind::MonthlyMinutesReset,
            reset_by,
            serde_json::json!({
                "reason": reason,
                "previous_usage": previous_usage,
            }),
            1.0,
        )
        .await?;

        tracing::info!(
            org_id = %org_id,
            reason = %reason,
            previous_usage,
            "Monthly minutes usage reset recorded"
        );

        Ok(ResetOutcome {
            organization_id: org_id,
            reset_date: now,
            reason: reason.to_string(),
            previous_usage,
        })
    }

    /// Past resets, newest first, reconstructed from the audit facts.
    pub async fn reset_history(&self, org_id: Uuid) -> BillingResult<Vec<ResetHistoryEntry>> {
        let events = self
            .events
            .events(org_id, Some(UsageEventKind::MonthlyMinutesReset))
            .await?;
        Ok(events
            .into_iter()
            .map(|e| ResetHistoryEntry {
                reset_date: e.created_at,
                reason: e
                    .metadata
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                previous_usage: e
                    .metadata
                    .get("previous_usage")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0),
                reset_by: e.user_id,
            })
            .collect())
    }
}
